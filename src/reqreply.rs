// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Component F: request/reply multiplexing over a single wildcard inbox
//! (§4.F).
//!
//! Grounded on the teacher's closure-based dispatch in
//! `client::pool_sessions::Pool::execute_with` (build a context, inject
//! shared counters, run it) and on `utils::generate_isid` for unique-token
//! generation; here the "context" is a [`ResponseHandle`] slot filled by
//! whichever thread observes the matching reply.

use std::{
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use dashmap::DashMap;

use crate::{
    error::{Error, ErrorKind},
    inbox::{generate_inbox, TokenCounter},
    message::Message,
};

const POOL_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleStatus {
    Waiting,
    Filled,
    ConnectionClosed,
    Disconnected,
}

/// `{cond, msg slot, closed, removed, pooled, closed_status}` from §3
/// "Response handle".
struct ResponseHandle {
    cond: Condvar,
    state: Mutex<(HandleStatus, Option<Message>)>,
    pooled: bool,
}

impl ResponseHandle {
    fn new(pooled: bool) -> Arc<Self> {
        Arc::new(Self {
            cond: Condvar::new(),
            state: Mutex::new((HandleStatus::Waiting, None)),
            pooled,
        })
    }

    fn reset(&self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *state = (HandleStatus::Waiting, None);
    }

    fn fill(&self, msg: Message) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.0 = HandleStatus::Filled;
        state.1 = Some(msg);
        drop(state);
        self.cond.notify_all();
    }

    fn close(&self, status: HandleStatus) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.0 = status;
        drop(state);
        self.cond.notify_all();
    }

    fn wait(&self, timeout: Duration) -> Result<Message, Error> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let deadline = Instant::now() + timeout;
        loop {
            match &state.0 {
                HandleStatus::Filled => {
                    return state
                        .1
                        .take()
                        .ok_or_else(|| Error::new(ErrorKind::Timeout));
                }
                HandleStatus::ConnectionClosed => return Err(Error::new(ErrorKind::ConnectionClosed)),
                HandleStatus::Disconnected => {
                    return Err(Error::new(ErrorKind::ConnectionDisconnected))
                }
                HandleStatus::Waiting => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::new(ErrorKind::Timeout));
            }
            let (guard, result) = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state = guard;
            if result.timed_out() && state.0 == HandleStatus::Waiting {
                return Err(Error::new(ErrorKind::Timeout));
            }
        }
    }
}

/// Callback the mux uses to publish the outgoing request; kept generic
/// over the connection's own `publish` so this module doesn't need to
/// depend on `crate::connection` directly.
pub type PublishFn<'a> = dyn Fn(&str, Option<&str>, &[u8]) -> Result<(), Error> + 'a;

pub struct RequestMux {
    prefix: String,
    installed: Mutex<bool>,
    counter: TokenCounter,
    pool: Mutex<Vec<Arc<ResponseHandle>>>,
    in_flight: DashMap<String, Arc<ResponseHandle>>,
}

impl RequestMux {
    pub fn new(inbox_prefix: &str) -> Self {
        let prefix = format!("{inbox_prefix}{}", short_nonce());
        let pool = (0..POOL_SIZE).map(|_| ResponseHandle::new(true)).collect();
        Self {
            prefix,
            installed: Mutex::new(false),
            counter: TokenCounter::new(),
            pool: Mutex::new(pool),
            in_flight: DashMap::new(),
        }
    }

    /// The wildcard subject to subscribe on, e.g. `_INBOX.ab12.*`.
    pub fn wildcard_subject(&self) -> String {
        format!("{}.*", self.prefix)
    }

    /// This mux's reply-subject prefix (includes the per-connection nonce
    /// segment, unlike [`Options::inbox_prefix`]). Used by the connection
    /// core to route inbound replies without re-deriving the prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn is_installed(&self) -> bool {
        *self
            .installed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn mark_installed(&self) {
        *self
            .installed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = true;
    }

    fn take_handle(&self) -> Arc<ResponseHandle> {
        let mut pool = self
            .pool
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match pool.pop() {
            Some(h) => {
                h.reset();
                h
            }
            None => ResponseHandle::new(false),
        }
    }

    fn return_handle(&self, handle: Arc<ResponseHandle>) {
        if handle.pooled {
            let mut pool = self
                .pool
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if pool.len() < POOL_SIZE {
                pool.push(handle);
            }
        }
    }

    /// Issue one request: allocate a token, publish with the derived reply
    /// subject, and block for the matching reply (§4.F).
    pub fn request(
        &self,
        publish: &PublishFn<'_>,
        subject: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Message, Error> {
        let token = self.counter.next();
        let reply_to = format!("{}.{token}", self.prefix);
        let handle = self.take_handle();
        self.in_flight.insert(token.clone(), Arc::clone(&handle));

        let publish_result = publish(subject, Some(&reply_to), payload);
        if let Err(e) = publish_result {
            self.in_flight.remove(&token);
            self.return_handle(handle);
            return Err(e);
        }

        let result = handle.wait(timeout);
        self.in_flight.remove(&token);
        if result.is_ok() {
            self.return_handle(handle);
        }
        result
    }

    /// Route an inbound reply on the wildcard subject: the token segment
    /// after the prefix indexes the in-flight map.
    pub fn deliver_reply(&self, subject: &str, msg: Message) -> bool {
        let Some(token) = subject.strip_prefix(&format!("{}.", self.prefix)) else {
            return false;
        };
        if let Some((_, handle)) = self.in_flight.remove(token) {
            handle.fill(msg);
            true
        } else {
            false
        }
    }

    /// Wake every in-flight request with a terminal status (connection
    /// closed/disconnected); used during teardown and reconnect.
    pub fn fail_all(&self, closed: bool) {
        let status = if closed {
            HandleStatus::ConnectionClosed
        } else {
            HandleStatus::Disconnected
        };
        for entry in self.in_flight.iter() {
            entry.value().close(status);
        }
        self.in_flight.clear();
    }
}

fn short_nonce() -> String {
    generate_inbox("")[..8].to_string()
}
