// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Component D: the subscription table (§3 "Subscription", §4.D).
//!
//! Grounded on the teacher's `sending`/`reciver` `DashMap<u32, mpsc::...>`
//! pairing in `client::client::ClientConnection` — a concurrent map keyed
//! by a small numeric tag, with per-entry queues owned by the entry itself
//! rather than by the table. The async variant there uses Tokio's `mpsc`;
//! here each [`Subscription`] owns a `Mutex<VecDeque<Message>>` + `Condvar`
//! pair instead, per §5's OS-thread concurrency model.

use std::{
    any::Any,
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Condvar, Mutex,
    },
    time::Duration,
};

use dashmap::DashMap;

use crate::message::Message;

/// Control signal encoded as an empty-subject message (§4.E). Kept separate
/// from wire `Message`s conceptually, but travels through the same queue so
/// the delivery loop doesn't need a second wakeup path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Close,
    DrainComplete,
    TimedOut,
}

impl ControlKind {
    fn tag(self) -> &'static str {
        match self {
            ControlKind::Close => "close",
            ControlKind::DrainComplete => "drain_complete",
            ControlKind::TimedOut => "timed_out",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "close" => Some(ControlKind::Close),
            "drain_complete" => Some(ControlKind::DrainComplete),
            "timed_out" => Some(ControlKind::TimedOut),
            _ => None,
        }
    }
}

pub fn control_message(sid: u64, kind: ControlKind) -> Message {
    Message {
        subject: String::new(),
        reply: Some(kind.tag().to_string()),
        data: Vec::new(),
        sid,
        headers: None,
    }
}

pub fn control_kind(msg: &Message) -> Option<ControlKind> {
    if !msg.is_control() {
        return None;
    }
    msg.reply.as_deref().and_then(ControlKind::from_tag)
}

pub type Callback = Box<dyn Fn(Message) + Send + Sync>;

pub enum Dispatch {
    /// Asynchronous delivery: a callback invoked by a delivery thread.
    Async(Callback),
    /// Synchronous delivery: the caller pulls messages with `next_msg`.
    Sync,
}

#[derive(Debug, Clone, Copy)]
pub struct SubLimits {
    pub max_msgs: usize,
    pub max_bytes: usize,
}

impl Default for SubLimits {
    fn default() -> Self {
        Self {
            max_msgs: 65536,
            max_bytes: 64 * 1024 * 1024,
        }
    }
}

pub enum EnqueueOutcome {
    Delivered,
    DroppedNewSlowConsumer,
    DroppedAlreadySlow,
    Closed,
}

struct Queue {
    items: VecDeque<Message>,
    pending_bytes: usize,
}

pub struct Subscription {
    pub sid: u64,
    pub subject: String,
    pub queue_group: Option<String>,
    pub max: AtomicU64,
    pub delivered: AtomicU64,
    pub dropped: AtomicU64,
    pub slow_consumer: AtomicBool,
    pub draining: AtomicBool,
    pub closed: AtomicBool,
    pub limits: SubLimits,
    pub timeout: Option<Duration>,
    pub worker_index: Option<usize>,
    dispatch: Dispatch,
    queue: Mutex<Queue>,
    cond: Condvar,
    /// Extension point referenced in §9's design notes for flow-control
    /// control messages (e.g. JetStream); unused by this crate.
    pub extension: Mutex<Option<Box<dyn Any + Send + Sync>>>,
}

impl Subscription {
    pub fn new(
        sid: u64,
        subject: String,
        queue_group: Option<String>,
        dispatch: Dispatch,
        limits: SubLimits,
        timeout: Option<Duration>,
        worker_index: Option<usize>,
    ) -> Self {
        Self {
            sid,
            subject,
            queue_group,
            max: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            slow_consumer: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            limits,
            timeout,
            worker_index,
            dispatch,
            queue: Mutex::new(Queue {
                items: VecDeque::new(),
                pending_bytes: 0,
            }),
            cond: Condvar::new(),
            extension: Mutex::new(None),
        }
    }

    pub fn is_sync(&self) -> bool {
        matches!(self.dispatch, Dispatch::Sync)
    }

    pub fn set_max(&self, max: u64) {
        self.max.store(max, Ordering::SeqCst);
    }

    pub fn is_exhausted(&self) -> bool {
        let max = self.max.load(Ordering::SeqCst);
        max != 0 && self.delivered.load(Ordering::SeqCst) >= max
    }

    /// Enqueue a message, applying the per-subscription bound (§4.D). A
    /// closed subscription drops everything except control messages, which
    /// always go through so the delivery loop can wake up and exit.
    pub fn enqueue(&self, msg: Message) -> EnqueueOutcome {
        if self.closed.load(Ordering::SeqCst) && !msg.is_control() {
            return EnqueueOutcome::Closed;
        }
        let mut q = lock(&self.queue);
        if !msg.is_control()
            && (q.items.len() >= self.limits.max_msgs
                || q.pending_bytes + msg.data.len() > self.limits.max_bytes)
        {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            let was_slow = self.slow_consumer.swap(true, Ordering::SeqCst);
            return if was_slow {
                EnqueueOutcome::DroppedAlreadySlow
            } else {
                EnqueueOutcome::DroppedNewSlowConsumer
            };
        }
        if !msg.is_control() {
            self.slow_consumer.store(false, Ordering::SeqCst);
        }
        q.pending_bytes += msg.data.len();
        q.items.push_back(msg);
        drop(q);
        self.cond.notify_one();
        EnqueueOutcome::Delivered
    }

    /// Pop the next queued item, blocking until one is available or the
    /// subscription is closed (in which case `None` is returned once the
    /// queue has drained).
    pub fn pop_blocking(&self) -> Option<Message> {
        let mut q = lock(&self.queue);
        loop {
            if let Some(msg) = q.items.pop_front() {
                q.pending_bytes = q.pending_bytes.saturating_sub(msg.data.len());
                return Some(msg);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            q = self
                .cond
                .wait(q)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Pop the next queued item, blocking up to `timeout`. Used by sync
    /// subscriptions' `next_msg`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Message> {
        let mut q = lock(&self.queue);
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(msg) = q.items.pop_front() {
                q.pending_bytes = q.pending_bytes.saturating_sub(msg.data.len());
                return Some(msg);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, result) = self
                .cond
                .wait_timeout(q, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            q = guard;
            if result.timed_out() && q.items.is_empty() {
                return None;
            }
        }
    }

    /// Pop the next queued item without blocking; `None` if nothing is
    /// ready right now. Used by the shared worker pool's round-robin scan.
    pub fn try_pop(&self) -> Option<Message> {
        let mut q = lock(&self.queue);
        let msg = q.items.pop_front()?;
        q.pending_bytes = q.pending_bytes.saturating_sub(msg.data.len());
        Some(msg)
    }

    pub fn callback(&self) -> Option<&Callback> {
        match &self.dispatch {
            Dispatch::Async(cb) => Some(cb),
            Dispatch::Sync => None,
        }
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.queue).items.len()
    }

    /// Close the queue: wakes any blocked consumer, which observes `closed`
    /// and stops after draining what's left per §3's invariant.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cond.notify_all();
    }

    pub fn push_control(&self, kind: ControlKind) {
        let _ = self.enqueue(control_message(self.sid, kind));
    }
}

fn lock(m: &Mutex<Queue>) -> std::sync::MutexGuard<'_, Queue> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Unique keyed map from sid to subscription (§4.D). Sid allocation is
/// monotonic per connection and never reused.
pub struct SubscriptionTable {
    subs: DashMap<u64, Arc<Subscription>>,
    next_sid: AtomicU64,
}

impl Default for SubscriptionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self {
            subs: DashMap::new(),
            next_sid: AtomicU64::new(1),
        }
    }

    pub fn next_sid(&self) -> u64 {
        self.next_sid.fetch_add(1, Ordering::SeqCst)
    }

    pub fn insert(&self, sub: Arc<Subscription>) {
        self.subs.insert(sub.sid, sub);
    }

    pub fn get(&self, sid: u64) -> Option<Arc<Subscription>> {
        self.subs.get(&sid).map(|e| Arc::clone(e.value()))
    }

    /// Remove and close the subscription, releasing the table's reference.
    pub fn remove(&self, sid: u64) -> Option<Arc<Subscription>> {
        let removed = self.subs.remove(&sid).map(|(_, sub)| sub);
        if let Some(sub) = &removed {
            sub.close();
        }
        removed
    }

    pub fn iter(&self) -> Vec<Arc<Subscription>> {
        self.subs.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    /// Route an inbound `MSG` to its subscription (§4.D "process_msg"):
    /// retain the target outside any table-wide lock, enqueue under the
    /// subscription's own lock, and report whether delivery, a slow
    /// consumer drop, or neither occurred so the caller can decide on an
    /// async error dispatch.
    pub fn process_msg(&self, sid: u64, msg: Message) -> Option<EnqueueOutcome> {
        let sub = self.get(sid)?;
        let outcome = sub.enqueue(msg);
        if sub.is_exhausted() {
            self.remove(sid);
        }
        Some(outcome)
    }
}
