// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Component H: the heartbeat timer (§4.H).
//!
//! Grounded on the teacher's NOP-in keepalive handling
//! (`client::client::ClientConnection::try_handle_unsolicited_nop_in`,
//! which detects an idle target and answers in-band) turned around into the
//! client-initiated direction: this side emits PING on a fixed tick and
//! declares the connection stale once too many go unanswered.

use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc, Condvar, Mutex,
};
use std::time::Duration;

/// Tracks in-flight PINGs and decides when the connection should be
/// considered stale (§3 "Heartbeat state", §4.H).
pub struct Heartbeat {
    pings_out: AtomicU32,
    max_pings_out: u32,
    interval: Duration,
    stopped: Mutex<bool>,
    cond: Condvar,
    generation: AtomicU64,
}

pub enum Tick {
    /// Send a PING now.
    SendPing,
    /// Too many PINGs went unanswered; the connection is stale.
    Stale,
}

impl Heartbeat {
    pub fn new(interval: Duration, max_pings_out: u32) -> Arc<Self> {
        Arc::new(Self {
            pings_out: AtomicU32::new(0),
            max_pings_out: max_pings_out.max(1),
            interval,
            stopped: Mutex::new(false),
            cond: Condvar::new(),
            generation: AtomicU64::new(0),
        })
    }

    /// Record that a PONG was received, clearing the outstanding count
    /// (§4.H "PONG resets the counter to zero", matching the spec's
    /// head-of-line PONG matching rather than per-ping correlation).
    pub fn on_pong(&self) {
        self.pings_out.store(0, Ordering::SeqCst);
    }

    pub fn pings_outstanding(&self) -> u32 {
        self.pings_out.load(Ordering::SeqCst)
    }

    /// Stop the timer thread permanently; called on disconnect/close so a
    /// stale reader from a prior connection generation can't fire.
    pub fn stop(&self) {
        let mut stopped = self.lock();
        *stopped = true;
        drop(stopped);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cond.notify_all();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, bool> {
        self.stopped
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Run the timer loop on the calling thread, invoking `on_tick` for
    /// each `SendPing`/`Stale` event until [`Heartbeat::stop`] is called.
    /// Spawned once per connection attempt by the connection core.
    pub fn run(self: Arc<Self>, on_tick: impl Fn(Tick) + Send + 'static) {
        let my_generation = self.generation.load(Ordering::SeqCst);
        loop {
            let stopped = self.lock();
            let (guard, _) = self
                .cond
                .wait_timeout(stopped, self.interval)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if *guard || self.generation.load(Ordering::SeqCst) != my_generation {
                return;
            }
            drop(guard);

            let now_out = self.pings_out.fetch_add(1, Ordering::SeqCst) + 1;
            if now_out > self.max_pings_out {
                on_tick(Tick::Stale);
                return;
            }
            on_tick(Tick::SendPing);
        }
    }
}
