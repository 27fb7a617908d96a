// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Component E: the delivery engine (§4.E).
//!
//! Two modes, selected per subscription: a dedicated per-subscription
//! thread, or a fixed-size shared worker pool that statically binds many
//! subscriptions to one thread. Grounded on the teacher's `read_loop`
//! pattern of "one thread owns one queue and drains it to completion
//! before looping" (`client::client::ClientConnection::read_loop`), here
//! applied to per-subscription queues instead of per-ITT channels, and on
//! `Weak<Pool>` back-references (`client::client::SessionRef`) to avoid a
//! reference cycle between a worker and the connection that owns it.

use std::sync::{atomic::Ordering, Arc, Mutex, Weak};

use tracing::{debug, warn};

use crate::subscription::{control_kind, ControlKind, Subscription, SubscriptionTable};

/// Back-reference used by delivery threads to remove an exhausted
/// subscription from the table without holding a strong `Arc` to it (which
/// would keep the table alive past the connection's own lifetime).
pub trait TableHandle: Send + Sync {
    fn remove(&self, sid: u64);
    fn async_error_slow_consumer(&self, sub: Arc<Subscription>);
    fn async_error_max_delivered(&self, sub: Arc<Subscription>);
}

/// Spawn a dedicated consumer thread for one async subscription (§4.E
/// "Per-subscription thread").
pub fn spawn_per_subscription(sub: Arc<Subscription>, table: Weak<dyn TableHandle>) {
    std::thread::spawn(move || per_subscription_loop(sub, table));
}

fn per_subscription_loop(sub: Arc<Subscription>, table: Weak<dyn TableHandle>) {
    loop {
        let Some(msg) = sub.pop_blocking() else {
            debug!(sid = sub.sid, "delivery thread exiting: subscription closed");
            return;
        };

        if let Some(kind) = control_kind(&msg) {
            match kind {
                ControlKind::Close | ControlKind::DrainComplete => return,
                ControlKind::TimedOut => continue,
            }
        }

        let Some(callback) = sub.callback() else {
            warn!(sid = sub.sid, "per-subscription thread on a sync subscription");
            return;
        };
        callback(msg);
        sub.delivered.fetch_add(1, Ordering::SeqCst);

        if sub.is_exhausted() {
            if let Some(table) = table.upgrade() {
                table.async_error_max_delivered(Arc::clone(&sub));
                table.remove(sub.sid);
            }
            return;
        }
    }
}

/// A fixed ring of worker threads; each subscription is statically bound
/// to exactly one worker at creation time (§4.E "Shared worker pool").
pub struct SharedWorkerPool {
    workers: Vec<Arc<Worker>>,
}

struct Worker {
    index: usize,
    bound: Mutex<Vec<Arc<Subscription>>>,
}

impl SharedWorkerPool {
    pub fn new(size: usize, table: Weak<dyn TableHandle>) -> Arc<Self> {
        let workers: Vec<Arc<Worker>> = (0..size.max(1))
            .map(|index| {
                Arc::new(Worker {
                    index,
                    bound: Mutex::new(Vec::new()),
                })
            })
            .collect();
        let pool = Arc::new(Self { workers });
        for worker in &pool.workers {
            let worker = Arc::clone(worker);
            let table = table.clone();
            std::thread::spawn(move || shared_worker_loop(worker, table));
        }
        pool
    }

    /// Statically assign `sub` to `sid % worker_count`, matching §4.E.
    pub fn bind(&self, sub: &Arc<Subscription>) -> usize {
        let index = (sub.sid as usize) % self.workers.len();
        let worker = &self.workers[index];
        worker
            .bound
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(Arc::clone(sub));
        index
    }

    pub fn unbind(&self, sub: &Subscription) {
        if let Some(index) = sub.worker_index {
            let worker = &self.workers[index];
            let mut bound = worker
                .bound
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            bound.retain(|s| s.sid != sub.sid);
        }
    }
}

/// A worker multiplexes every subscription bound to it over their own
/// per-subscription queues: it round-robins a `pop_blocking`-with-backoff
/// scan across its bound set. This keeps relative ordering between
/// subscriptions sharing a worker equal to *enqueue* order while never
/// needing a second, separately-locked shared queue.
fn shared_worker_loop(worker: Arc<Worker>, table: Weak<dyn TableHandle>) {
    loop {
        let bound = {
            let guard = worker
                .bound
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.clone()
        };

        if bound.is_empty() {
            std::thread::sleep(std::time::Duration::from_millis(5));
            continue;
        }

        let mut did_work = false;
        for sub in &bound {
            let Some(msg) = sub.try_pop() else {
                continue;
            };
            did_work = true;

            if let Some(kind) = control_kind(&msg) {
                match kind {
                    ControlKind::Close | ControlKind::DrainComplete => {
                        worker
                            .bound
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner)
                            .retain(|s| s.sid != sub.sid);
                        continue;
                    }
                    ControlKind::TimedOut => continue,
                }
            }

            if let Some(callback) = sub.callback() {
                callback(msg);
                sub.delivered.fetch_add(1, Ordering::SeqCst);
                if sub.is_exhausted() {
                    if let Some(table) = table.upgrade() {
                        table.async_error_max_delivered(Arc::clone(sub));
                        table.remove(sub.sid);
                    }
                    worker
                        .bound
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .retain(|s| s.sid != sub.sid);
                }
            }
        }

        if !did_work {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }
}

/// Choose a delivery mode for a freshly created subscription and wire it
/// up. `shared: Some(pool)` selects the shared worker pool; `None` spawns a
/// dedicated thread.
pub fn start_delivery(
    sub: &Arc<Subscription>,
    shared: Option<&Arc<SharedWorkerPool>>,
    table: Weak<dyn TableHandle>,
) -> Option<usize> {
    if sub.is_sync() {
        // Synchronous subscriptions have no delivery thread; callers pull
        // via `Subscription::pop_blocking`/`pop_timeout` directly.
        return None;
    }
    match shared {
        Some(pool) => Some(pool.bind(sub)),
        None => {
            spawn_per_subscription(Arc::clone(sub), table);
            None
        }
    }
}
