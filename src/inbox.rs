// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Inbox subject generation and the request/reply token allocator (§4.F,
//! §6 "Inbox format").

use std::sync::Mutex;

use rand::RngExt;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
const INBOX_ID_LEN: usize = 22;

/// Generate `<inbox_prefix><22-char base-32 unique id>`.
pub fn generate_inbox(prefix: &str) -> String {
    let mut rng = rand::rng();
    let mut id = String::with_capacity(prefix.len() + INBOX_ID_LEN);
    id.push_str(prefix);
    for _ in 0..INBOX_ID_LEN {
        let idx = rng.random_range(0..ALPHABET.len());
        id.push(ALPHABET[idx] as char);
    }
    id
}

/// A base-10 counter encoded as ASCII digits, most-significant digit first.
/// Overflowing the current width grows the counter by one digit rather than
/// wrapping, per §4.F.
pub struct TokenCounter {
    digits: Mutex<Vec<u8>>,
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCounter {
    pub fn new() -> Self {
        Self {
            digits: Mutex::new(vec![b'0']),
        }
    }

    /// Advance the counter by one and return its new value as a token
    /// string, e.g. `"0" -> "1"`, `"99" -> "100"`.
    pub fn next(&self) -> String {
        let mut digits = self
            .digits
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let mut idx = digits.len();
        loop {
            if idx == 0 {
                digits.insert(0, b'1');
                break;
            }
            idx -= 1;
            if digits[idx] == b'9' {
                digits[idx] = b'0';
                if idx == 0 {
                    digits.insert(0, b'1');
                    break;
                }
            } else {
                digits[idx] += 1;
                break;
            }
        }

        String::from_utf8(digits.clone()).unwrap_or_else(|_| "0".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbox_has_prefix_and_fixed_length_suffix() {
        let inbox = generate_inbox("_INBOX.");
        assert!(inbox.starts_with("_INBOX."));
        assert_eq!(inbox.len(), "_INBOX.".len() + INBOX_ID_LEN);
    }

    #[test]
    fn two_inboxes_are_not_equal() {
        assert_ne!(generate_inbox("_INBOX."), generate_inbox("_INBOX."));
    }

    #[test]
    fn token_counter_increments() {
        let c = TokenCounter::new();
        assert_eq!(c.next(), "1");
        assert_eq!(c.next(), "2");
    }

    #[test]
    fn token_counter_carries_into_new_digit() {
        let c = TokenCounter::new();
        for _ in 0..9 {
            c.next();
        }
        // After 9 calls the counter holds "9"; the 10th call must carry.
        assert_eq!(c.next(), "10");
    }
}
