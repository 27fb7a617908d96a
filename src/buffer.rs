// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Component A: a growable byte region used both as the outbound coalescing
//! buffer (§4.G) and as the parser's control-line scratch space (§4.B).
//!
//! Addresses returned by [`Buffer::as_slice`] become invalid after any
//! subsequent `append`/`expand` call, same as the teacher's `BytesMut`
//! scratch buffer in the read loop — callers must not hold a borrow across
//! a mutation.

/// Backing storage for a [`Buffer`]. `Borrowed` defers the first allocation
/// until the buffer actually needs to grow past its initial fixed slice;
/// the first `expand()` copies the borrowed bytes into owned storage and the
/// buffer behaves like `Owned` from then on.
enum Storage {
    Owned(Vec<u8>),
    Borrowed(&'static [u8]),
}

pub struct Buffer {
    storage: Storage,
    len: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self {
            storage: Storage::Owned(Vec::new()),
            len: 0,
        }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            storage: Storage::Owned(Vec::with_capacity(cap)),
            len: 0,
        }
    }

    /// Wrap a static, already-available slice without copying it. The first
    /// mutation that needs more room than the slice provides copies it into
    /// owned storage (§4.A "Borrowed-backing mode").
    pub fn from_borrowed(bytes: &'static [u8]) -> Self {
        Self {
            len: bytes.len(),
            storage: Storage::Borrowed(bytes),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.storage {
            Storage::Owned(v) => &v[..self.len],
            Storage::Borrowed(b) => &b[..self.len],
        }
    }

    pub fn capacity(&self) -> usize {
        match &self.storage {
            Storage::Owned(v) => v.capacity(),
            Storage::Borrowed(b) => b.len(),
        }
    }

    /// Grow so that at least `additional` more bytes can be appended without
    /// a further reallocation. Growth target is `n + max(n/10, 64)` per
    /// §4.A, where `n` is the size needed after the append.
    pub fn expand(&mut self, additional: usize) {
        let needed = self.len + additional;
        if needed <= self.capacity() {
            self.force_owned();
            return;
        }
        let target = needed + std::cmp::max(needed / 10, 64);
        match &mut self.storage {
            Storage::Owned(v) => {
                v.reserve(target - v.len());
            }
            Storage::Borrowed(b) => {
                let mut v = Vec::with_capacity(target);
                v.extend_from_slice(&b[..self.len]);
                self.storage = Storage::Owned(v);
            }
        }
    }

    /// Copy borrowed bytes into owned storage without necessarily growing
    /// capacity; used so in-place mutation (e.g. overwriting already
    /// written bytes) never writes through a borrowed pointer.
    fn force_owned(&mut self) {
        if let Storage::Borrowed(b) = &self.storage {
            let mut v = Vec::with_capacity(self.len);
            v.extend_from_slice(&b[..self.len]);
            self.storage = Storage::Owned(v);
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.expand(bytes.len());
        match &mut self.storage {
            Storage::Owned(v) => {
                v.truncate(self.len);
                v.extend_from_slice(bytes);
            }
            Storage::Borrowed(_) => unreachable!("expand() always converts to Owned"),
        }
        self.len += bytes.len();
    }

    pub fn append_byte(&mut self, b: u8) {
        self.append(std::slice::from_ref(&b));
    }

    /// Drop the first `n` bytes, shifting whatever remains to the front.
    /// Used after a complete control line or payload has been consumed by
    /// the parser.
    pub fn consume_prefix(&mut self, n: usize) {
        assert!(n <= self.len, "consume_prefix beyond buffer length");
        self.force_owned();
        if let Storage::Owned(v) = &mut self.storage {
            v.drain(0..n);
        }
        self.len -= n;
    }

    /// Truncate back to a previously observed length, discarding anything
    /// appended since. Used to unwind a partially-accumulated control line
    /// on a parse error.
    pub fn rewind_to(&mut self, pos: usize) {
        assert!(pos <= self.len, "rewind_to beyond buffer length");
        self.len = pos;
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Release the owned storage (mirrors the `destroy` operation in
    /// §4.A). `Buffer`'s own `Drop` already does this; exposed as a named
    /// operation for callers that want to reclaim memory without dropping
    /// the handle itself.
    pub fn reset(&mut self) {
        self.storage = Storage::Owned(Vec::new());
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_back() {
        let mut b = Buffer::new();
        b.append(b"hello ");
        b.append(b"world");
        assert_eq!(b.as_slice(), b"hello world");
    }

    #[test]
    fn consume_prefix_shifts_remainder() {
        let mut b = Buffer::new();
        b.append(b"PING\r\nPONG\r\n");
        b.consume_prefix(6);
        assert_eq!(b.as_slice(), b"PONG\r\n");
    }

    #[test]
    fn rewind_to_discards_tail() {
        let mut b = Buffer::new();
        b.append(b"abc");
        let mark = b.len();
        b.append(b"def");
        b.rewind_to(mark);
        assert_eq!(b.as_slice(), b"abc");
    }

    #[test]
    fn borrowed_backing_materializes_on_first_expand() {
        static FIXTURE: &[u8] = b"fixed";
        let mut b = Buffer::from_borrowed(FIXTURE);
        assert_eq!(b.as_slice(), b"fixed");
        b.append(b"-more");
        assert_eq!(b.as_slice(), b"fixed-more");
    }

    #[test]
    fn expand_growth_target_matches_formula() {
        let mut b = Buffer::new();
        b.expand(5);
        // n=5 -> target = 5 + max(0, 64) = 69
        assert!(b.capacity() >= 69);
    }
}
