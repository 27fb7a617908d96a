// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Component G: the batching outbound writer (§4.G).
//!
//! Grounded on the teacher's `ClientConnection` write path, which coalesces
//! an outgoing PDU into a single `TcpStream::write_all` call rather than
//! issuing one syscall per field; here the coalescing window is widened
//! from "one PDU" to "whatever accumulated since the last wakeup", using a
//! signal flag plus `Condvar` in place of the teacher's Tokio mpsc channel.

use std::{
    io::Write,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    time::Duration,
};

use tracing::{debug, warn};

use crate::buffer::Buffer;

const COALESCE_WINDOW: Duration = Duration::from_millis(1);

/// Where the flusher currently sends bytes: a live socket, or a capped
/// pending buffer while the reconnect supervisor is between servers
/// (§4.G "Reconnect buffering").
enum Sink {
    Live(Box<dyn Write + Send>),
    Pending { buf: Buffer, cap: usize },
}

struct State {
    out: Buffer,
    sink: Sink,
    closed: bool,
}

/// Batches writes from many caller threads behind a single lock, and wakes
/// one dedicated flusher thread to drain them (§4.G).
pub struct Flusher {
    state: Mutex<State>,
    cond: Condvar,
    signaled: AtomicBool,
}

impl Flusher {
    pub fn new(reconnect_buf_cap: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                out: Buffer::new(),
                sink: Sink::Pending {
                    buf: Buffer::new(),
                    cap: reconnect_buf_cap,
                },
                closed: false,
            }),
            cond: Condvar::new(),
            signaled: AtomicBool::new(false),
        })
    }

    /// Queue bytes for the next flush; returns `false` if the pending
    /// reconnect buffer is full and the bytes were dropped (only possible
    /// while [`Sink::Pending`]).
    pub fn enqueue(&self, bytes: &[u8]) -> bool {
        let mut state = self.lock();
        match &mut state.sink {
            Sink::Live(_) => {
                state.out.append(bytes);
                true
            }
            Sink::Pending { buf, cap } => {
                if buf.len() + bytes.len() > *cap {
                    warn!("reconnect pending buffer full, dropping write");
                    false
                } else {
                    buf.append(bytes);
                    true
                }
            }
        }
    }

    /// Wake the flusher thread immediately instead of waiting for the next
    /// coalescing tick (used for `flush()`/PING urgency).
    pub fn kick(&self) {
        self.signaled.store(true, Ordering::SeqCst);
        self.cond.notify_all();
    }

    /// Install a live socket, moving any bytes buffered while pending onto
    /// the front of the outgoing queue (§4.I "replay pending on reconnect").
    pub fn attach(&self, sink: Box<dyn Write + Send>) {
        let mut state = self.lock();
        let carried = match std::mem::replace(
            &mut state.sink,
            Sink::Pending {
                buf: Buffer::new(),
                cap: 0,
            },
        ) {
            Sink::Pending { buf, .. } => buf,
            Sink::Live(_) => Buffer::new(),
        };
        state.sink = Sink::Live(sink);
        if !carried.is_empty() {
            let mut merged = Buffer::new();
            merged.append(carried.as_slice());
            merged.append(state.out.as_slice());
            state.out = merged;
        }
        drop(state);
        self.kick();
    }

    /// Detach the live socket and revert to buffering pending writes, used
    /// when the reconnect supervisor takes over (§4.I).
    pub fn detach(&self, reconnect_buf_cap: usize) {
        let mut state = self.lock();
        state.sink = Sink::Pending {
            buf: Buffer::new(),
            cap: reconnect_buf_cap,
        };
    }

    /// One-shot drain for host-driven event loops that own no flusher
    /// thread: write out whatever is queued right now, once. No-op if
    /// nothing is queued or no live sink is attached yet (§6 "event-loop
    /// embedding").
    pub fn drain_once(&self) -> std::io::Result<()> {
        let mut state = self.lock();
        if state.out.is_empty() {
            return Ok(());
        }
        let State { out, sink, .. } = &mut *state;
        let Sink::Live(sink) = sink else {
            return Ok(());
        };
        let to_write = std::mem::take(out);
        match sink.write_all(to_write.as_slice()) {
            Ok(()) => {
                let _ = sink.flush();
                Ok(())
            }
            Err(e) => {
                state.out = to_write;
                Err(e)
            }
        }
    }

    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.closed = true;
        drop(state);
        self.kick();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Run the flusher loop on the calling thread; spawned once per
    /// connection lifetime by the connection core.
    pub fn run(self: Arc<Self>) {
        loop {
            let mut state = self.lock();
            while !self.signaled.load(Ordering::SeqCst) && state.out.is_empty() && !state.closed {
                let (guard, _) = self
                    .cond
                    .wait_timeout(state, COALESCE_WINDOW)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                state = guard;
            }
            self.signaled.store(false, Ordering::SeqCst);

            if state.closed && state.out.is_empty() {
                return;
            }

            if state.out.is_empty() {
                continue;
            }

            let State { out, sink, .. } = &mut *state;
            let Sink::Live(sink) = sink else {
                // Nothing to drain to yet; bytes stay in `out` until a
                // live socket is attached.
                continue;
            };
            let to_write = std::mem::take(out);
            let write_result = sink.write_all(to_write.as_slice());
            match write_result {
                Ok(()) => {
                    let _ = sink.flush();
                }
                Err(e) => {
                    debug!(error = %e, "flusher write failed, reverting to pending buffer");
                    state.out = to_write;
                    state.sink = Sink::Pending {
                        buf: Buffer::new(),
                        cap: 0,
                    };
                }
            }
            if state.closed && state.out.is_empty() {
                return;
            }
        }
    }
}
