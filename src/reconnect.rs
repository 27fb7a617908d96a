// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Component I: the reconnect supervisor (§4.I).
//!
//! Grounded on the teacher's `Pool::login_and_insert` retry shape (walk a
//! set of candidates, attempt each, give up only once every candidate has
//! failed) combined with `client::client::ClientConnection::graceful_quiesce`
//! for the "stop everything, then restart" sequencing. The teacher has no
//! jittered backoff of its own (iSCSI targets are usually a fixed pair), so
//! the backoff math here follows §4.I directly rather than a teacher
//! pattern; it's noted as such in the grounding ledger.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use rand::RngExt;
use tracing::{info, warn};

use crate::{
    error::Error,
    options::{Callbacks, Options},
    server_pool::{ServerInPool, ServerPool},
};

/// One attempt's outcome, reported by the connection core's own
/// connect-and-replay closure so the supervisor doesn't need to know how a
/// socket is actually established.
pub enum AttemptOutcome {
    Connected,
    /// `code` is set only for an explicit `-ERR` authorization failure, so
    /// the supervisor can apply §4.I's auth-error-repeat suppression.
    Failed { auth_error_code: Option<u16> },
}

/// Per-attempt callback the connection core supplies: dial `server`,
/// perform the INFO/CONNECT/PING/PONG handshake, replay subscriptions, and
/// flush anything buffered while disconnected.
pub type ConnectAttempt = dyn Fn(&ServerInPool) -> AttemptOutcome + Send + Sync;

pub struct ReconnectSupervisor {
    options: Arc<Options>,
    aborted: AtomicBool,
}

impl ReconnectSupervisor {
    pub fn new(options: Arc<Options>) -> Self {
        Self {
            options,
            aborted: AtomicBool::new(false),
        }
    }

    /// Stop the current or next reconnect loop at its earliest check point
    /// (used when the connection is explicitly closed while reconnecting).
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Compute the backoff for the `attempt`-th try against one server,
    /// applying jitter (§4.I "Backoff"). `tls` selects the wider TLS jitter
    /// window per §6.
    fn backoff(&self, attempt: u32, tls: bool, callbacks: &Callbacks) -> Duration {
        if let Some(custom) = &callbacks.custom_reconnect_delay {
            return custom(attempt);
        }
        let jitter_max = if tls {
            self.options.reconnect_jitter_tls
        } else {
            self.options.reconnect_jitter
        };
        let jitter = if jitter_max.is_zero() {
            Duration::ZERO
        } else {
            let millis = rand::rng().random_range(0..=jitter_max.as_millis() as u64);
            Duration::from_millis(millis)
        };
        self.options.reconnect_wait + jitter
    }

    /// Walk the server pool, attempting each candidate in turn with backoff
    /// between rounds, until `attempt` succeeds or the pool is exhausted
    /// (§4.I "Reconnect loop"). Returns `true` once connected, `false` if
    /// the pool emptied or the supervisor was aborted.
    pub fn run(&self, pool: &Arc<std::sync::Mutex<ServerPool>>, callbacks: &Callbacks, attempt: &ConnectAttempt) -> bool {
        self.aborted.store(false, Ordering::SeqCst);
        loop {
            if self.is_aborted() {
                return false;
            }

            let server = {
                let mut pool = lock(pool);
                pool.current().cloned()
            };
            let Some(server) = server else {
                warn!("reconnect supervisor exhausted the server pool");
                return false;
            };

            let tls = server.addr.is_tls();
            let outcome = attempt(&server);
            match outcome {
                AttemptOutcome::Connected => {
                    let mut pool = lock(pool);
                    pool.record_connected();
                    info!(server = %server.url, "reconnected");
                    return true;
                }
                AttemptOutcome::Failed { auth_error_code } => {
                    let mut pool = lock(pool);
                    pool.record_attempt_failed();
                    if let Some(code) = auth_error_code {
                        let repeat = pool.record_auth_error(code);
                        if repeat {
                            warn!(server = %server.url, code, "repeated auth error, skipping server");
                        }
                    }
                    let attempts = pool.current().map(|s| s.reconnect_attempts).unwrap_or(0);
                    let next = pool.advance(self.options.max_reconnect).cloned();
                    drop(pool);
                    if next.is_none() {
                        return false;
                    }
                    if self.is_aborted() {
                        return false;
                    }
                    let wait = self.backoff(attempts, tls, callbacks);
                    if !wait.is_zero() {
                        std::thread::sleep(wait);
                    }
                }
            }
        }
    }
}

fn lock(
    m: &std::sync::Mutex<ServerPool>,
) -> std::sync::MutexGuard<'_, ServerPool> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Thin wrapper error surfaced when the supervisor gives up entirely; the
/// connection core maps this to `Status::Closed` plus an `on_closed`
/// callback (§4.I "Giving up").
pub fn no_servers_left() -> Error {
    Error::new(crate::error::ErrorKind::NoServers)
}
