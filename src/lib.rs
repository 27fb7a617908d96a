// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A connection engine for a publish/subscribe and request/reply messaging
//! client speaking a line-oriented text protocol over TCP (§1).
//!
//! [`Connection::connect`] dials a server pool, performs the INFO/CONNECT/
//! PING/PONG handshake, and returns a handle good for `publish`/`subscribe`/
//! `request`/`drain`/`close` across reconnects. Concurrency runs on plain OS
//! threads: one reader, one batching flusher, one heartbeat timer, and
//! either a thread per async subscription or a small shared worker pool
//! (§5), never tokio — the one deliberate divergence from the teacher this
//! crate reuses idioms from, since the host still owns its own event loop
//! or threading model and this library should not impose one.

pub mod addr;
pub mod buffer;
pub mod connection;
pub mod delivery;
pub mod error;
pub mod flusher;
pub mod heartbeat;
pub mod inbox;
pub mod info;
pub mod message;
pub mod options;
pub mod parser;
pub mod reconnect;
pub mod reqreply;
pub mod server_pool;
pub mod stats;
pub mod status;
pub mod subscription;

pub use addr::ServerAddr;
pub use connection::Connection;
pub use error::{Error, ErrorKind, Result};
pub use message::Message;
pub use options::{Callbacks, EventLoopHooks, Options, OptionsBuilder};
pub use stats::StatsSnapshot;
pub use status::Status;
pub use subscription::Subscription;
