// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Component C: the ordered set of candidate servers (§3 "Server
//! endpoint", §4.C).
//!
//! Grounded on the teacher's `client::pool_sessions::Pool`: a small
//! registry struct owning its entries directly (no internal locking here —
//! the pool lives behind the connection's own `conn.lock`, same as the
//! teacher wraps `Pool`'s `DashMap` fields behind `Arc` ownership rather
//! than adding a second lock layer).

use rand::seq::SliceRandom;

use crate::{addr::ServerAddr, options::Options};

#[derive(Debug, Clone)]
pub struct ServerInPool {
    pub addr: ServerAddr,
    pub url: String,
    pub reconnect_attempts: u32,
    pub did_connect: bool,
    pub last_auth_error_code: Option<u16>,
    pub tls_name: Option<String>,
    /// An explicitly configured URL (via `url`/`servers`) is never removed
    /// by discovery, even once it has exhausted `max_reconnect`.
    pub explicit: bool,
}

impl ServerInPool {
    fn new(addr: ServerAddr, explicit: bool) -> Self {
        let url = addr.to_url_string();
        Self {
            addr,
            url,
            reconnect_attempts: 0,
            did_connect: false,
            last_auth_error_code: None,
            tls_name: None,
            explicit,
        }
    }
}

/// Ordered set of endpoints with per-server stats and failover selection
/// (§4.C). The "current" server is always index 0.
#[derive(Debug, Default)]
pub struct ServerPool {
    servers: Vec<ServerInPool>,
}

const DEFAULT_URL: &str = "nats://127.0.0.1:4222";

impl ServerPool {
    /// Build the initial pool from `options.url`/`options.servers`,
    /// falling back to the well-known default when neither is set, then
    /// randomizing order unless `no_randomize` is set (§4.C).
    pub fn new(options: &Options) -> Result<Self, crate::error::Error> {
        let mut addrs: Vec<ServerAddr> = Vec::new();

        if let Some(url) = &options.url {
            for raw in url.split(',') {
                let raw = raw.trim();
                if !raw.is_empty() {
                    addrs.push(ServerAddr::parse(raw)?);
                }
            }
        }
        for s in &options.servers {
            addrs.push(ServerAddr::parse(s)?);
        }
        if addrs.is_empty() {
            addrs.push(ServerAddr::parse(DEFAULT_URL)?);
        }

        let mut servers: Vec<ServerInPool> =
            addrs.into_iter().map(|a| ServerInPool::new(a, true)).collect();

        if !options.no_randomize {
            let mut rng = rand::rng();
            servers.shuffle(&mut rng);
        }

        Ok(Self { servers })
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn current(&self) -> Option<&ServerInPool> {
        self.servers.first()
    }

    pub fn current_mut(&mut self) -> Option<&mut ServerInPool> {
        self.servers.first_mut()
    }

    /// Rotate the current (head) server to the tail unless it has exhausted
    /// `max_reconnect`, in which case it is dropped instead. Returns the
    /// new head, or `None` if the pool is now empty (§4.C "failover returns
    /// null").
    pub fn advance(&mut self, max_reconnect: Option<u32>) -> Option<&ServerInPool> {
        if self.servers.is_empty() {
            return None;
        }
        let head = self.servers.remove(0);
        let exhausted = match max_reconnect {
            Some(max) => head.reconnect_attempts >= max,
            None => false,
        };
        if !exhausted || head.explicit {
            self.servers.push(head);
        }
        self.current()
    }

    pub fn record_attempt_failed(&mut self) {
        if let Some(head) = self.current_mut() {
            head.reconnect_attempts += 1;
        }
    }

    pub fn record_connected(&mut self) {
        if let Some(head) = self.current_mut() {
            head.reconnect_attempts = 0;
            head.did_connect = true;
        }
    }

    pub fn record_auth_error(&mut self, code: u16) -> bool {
        // Returns true if this is a *repeat* of the same code seen on the
        // previous attempt against this same (head) server.
        if let Some(head) = self.current_mut() {
            let repeat = head.last_auth_error_code == Some(code);
            head.last_auth_error_code = Some(code);
            repeat
        } else {
            false
        }
    }

    /// Append servers learned from an asynchronous `INFO` frame,
    /// deduplicating by `host:port`. Only the newly added URLs are
    /// shuffled; the relative order of already-known servers is preserved
    /// (§4.C).
    pub fn add_discovered(&mut self, urls: &[String], tls_name: Option<&str>) {
        let mut fresh = Vec::new();
        for raw in urls {
            let Ok(addr) = ServerAddr::parse(raw) else {
                continue;
            };
            let host_port = addr.host_port();
            if self.servers.iter().any(|s| s.addr.host_port() == host_port) {
                continue;
            }
            let mut entry = ServerInPool::new(addr, false);
            entry.tls_name = tls_name.map(str::to_string);
            fresh.push(entry);
        }
        let mut rng = rand::rng();
        fresh.shuffle(&mut rng);
        self.servers.extend(fresh);
    }

    pub fn urls(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.url.clone()).collect()
    }

    /// Test-only escape hatch so other modules' tests can force exhaustion
    /// scenarios without duplicating `ServerPool`'s construction logic.
    #[cfg(test)]
    pub(crate) fn mark_all_implicit(&mut self) {
        for s in &mut self.servers {
            s.explicit = false;
        }
    }
}
