// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Connection options (§6 "Options surface").
//!
//! Structured the way the teacher groups its negotiated parameters in
//! `cfg::config::Config` (nested structs by concern, `Default` impls), but
//! built programmatically through [`OptionsBuilder`] rather than loaded
//! from a YAML file, since these options are constructed by the embedding
//! application rather than read off disk.

use std::{path::PathBuf, sync::Arc, time::Duration};

use crate::{connection::Connection, error::Error, message::Message, subscription::Subscription};

/// IP family preference for DNS resolution (§6 `order_ip`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderIp {
    #[default]
    Any,
    V4Only,
    V6Only,
    V4ThenV6,
    V6ThenV4,
}

/// Callback that receives a handle to the connection on a lifecycle event
/// (`connected`, `disconnected`, `reconnected`, `closed`, `lame_duck`,
/// `discovered_servers`).
pub type ConnCallback = Box<dyn Fn(Arc<Connection>) + Send + Sync>;
/// Async, out-of-band error notification (`slow_consumer`, `not_permitted`,
/// drain timeouts, ...), optionally scoped to a subscription.
pub type AsyncErrorCallback =
    Box<dyn Fn(Arc<Connection>, Option<Arc<Subscription>>, Error) + Send + Sync>;
/// Custom back-off override for the reconnect supervisor (§4.I).
pub type ReconnectDelayCallback = Box<dyn Fn(u32) -> Duration + Send + Sync>;
/// Token/credential providers, called lazily at CONNECT time.
pub type TokenCallback = Box<dyn Fn() -> Result<String, Error> + Send + Sync>;
pub type JwtCallback = Box<dyn Fn() -> Result<String, Error> + Send + Sync>;
pub type SignCallback = Box<dyn Fn(&[u8]) -> Result<Vec<u8>, Error> + Send + Sync>;

/// Host-driven I/O embedding (§6 "Event-loop embedding"). When present, the
/// connection core does not spawn its own reader/flusher threads; the host
/// calls `process_read_event`/`process_write_event` when the socket is
/// ready. The host guarantees single-threaded invocation per connection.
pub trait EventLoopHooks: Send + Sync {
    fn attach(&self, conn: Arc<Connection>);
    fn detach(&self, conn: Arc<Connection>);
}

/// The small capability set over opaque closures referenced in §9's design
/// notes ("a small capability set over an opaque closure value is
/// sufficient").
#[derive(Default)]
pub struct Callbacks {
    pub connected: Option<ConnCallback>,
    pub disconnected: Option<ConnCallback>,
    pub reconnected: Option<ConnCallback>,
    pub closed: Option<ConnCallback>,
    pub discovered_servers: Option<ConnCallback>,
    pub lame_duck: Option<ConnCallback>,
    pub async_error: Option<AsyncErrorCallback>,
    pub custom_reconnect_delay: Option<ReconnectDelayCallback>,
    pub token_cb: Option<TokenCallback>,
    pub user_jwt_cb: Option<JwtCallback>,
    pub sig_cb: Option<SignCallback>,
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks").finish_non_exhaustive()
    }
}

pub type MsgHandler = Box<dyn Fn(Message) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct Options {
    pub url: Option<String>,
    pub servers: Vec<String>,
    pub no_randomize: bool,

    pub name: Option<String>,
    pub verbose: bool,
    pub pedantic: bool,
    pub secure: bool,

    pub timeout: Duration,
    pub ping_interval: Duration,
    pub max_pings_out: u32,

    pub allow_reconnect: bool,
    /// `None` means unlimited reconnect attempts per server.
    pub max_reconnect: Option<u32>,
    pub reconnect_wait: Duration,
    pub reconnect_jitter: Duration,
    pub reconnect_jitter_tls: Duration,
    pub reconnect_buf_size: usize,
    pub retry_on_failed_connect: bool,

    pub max_pending_msgs: usize,
    pub max_pending_bytes: usize,
    pub write_deadline: Duration,
    pub io_buf_size: usize,

    pub send_asap: bool,
    pub no_echo: bool,
    pub disable_no_responders: bool,
    pub ignore_discovered_servers: bool,
    pub order_ip: OrderIp,

    pub user: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub nkey: Option<String>,
    pub user_creds_file: Option<PathBuf>,

    pub inbox_prefix: String,
    /// Use one temporary subscription per request rather than the shared
    /// wildcard-inbox multiplexer (§4.F "Legacy request style").
    pub use_old_request_style: bool,

    /// Number of delivery threads for subscriptions using the shared
    /// worker pool mode (§4.E). `0` forces per-subscription threads.
    pub shared_delivery_workers: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            url: None,
            servers: Vec::new(),
            no_randomize: false,
            name: None,
            verbose: false,
            pedantic: false,
            secure: false,
            timeout: Duration::from_secs(2),
            ping_interval: Duration::from_secs(120),
            max_pings_out: 2,
            allow_reconnect: true,
            max_reconnect: Some(60),
            reconnect_wait: Duration::from_millis(2000),
            reconnect_jitter: Duration::from_millis(100),
            reconnect_jitter_tls: Duration::from_millis(1000),
            reconnect_buf_size: 8 * 1024 * 1024,
            retry_on_failed_connect: false,
            max_pending_msgs: 65536,
            max_pending_bytes: 64 * 1024 * 1024,
            write_deadline: Duration::from_secs(2),
            io_buf_size: 32 * 1024,
            send_asap: false,
            no_echo: false,
            disable_no_responders: false,
            ignore_discovered_servers: false,
            order_ip: OrderIp::default(),
            user: None,
            password: None,
            token: None,
            nkey: None,
            user_creds_file: None,
            inbox_prefix: "_INBOX.".to_string(),
            use_old_request_style: false,
            shared_delivery_workers: 0,
        }
    }
}

/// Builder for [`Options`]; the callback set lives separately since it is
/// not `Clone` (closures aren't) while the rest of `Options` is, matching
/// the split the teacher makes between its `Clone`-able `Config` and the
/// non-cloneable runtime handles layered on top of it.
pub struct OptionsBuilder {
    options: Options,
    callbacks: Callbacks,
    event_loop: Option<Arc<dyn EventLoopHooks>>,
}

impl Default for OptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OptionsBuilder {
    pub fn new() -> Self {
        Self {
            options: Options::default(),
            callbacks: Callbacks::default(),
            event_loop: None,
        }
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.options.url = Some(url.into());
        self
    }

    pub fn servers(mut self, servers: Vec<String>) -> Self {
        self.options.servers = servers;
        self
    }

    pub fn no_randomize(mut self, yes: bool) -> Self {
        self.options.no_randomize = yes;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.options.name = Some(name.into());
        self
    }

    pub fn ping_interval(mut self, d: Duration) -> Self {
        self.options.ping_interval = d;
        self
    }

    pub fn max_pings_out(mut self, n: u32) -> Self {
        self.options.max_pings_out = n;
        self
    }

    pub fn max_reconnect(mut self, n: Option<u32>) -> Self {
        self.options.max_reconnect = n;
        self
    }

    pub fn reconnect_wait(mut self, d: Duration) -> Self {
        self.options.reconnect_wait = d;
        self
    }

    pub fn retry_on_failed_connect(mut self, yes: bool) -> Self {
        self.options.retry_on_failed_connect = yes;
        self
    }

    pub fn no_echo(mut self, yes: bool) -> Self {
        self.options.no_echo = yes;
        self
    }

    pub fn user_pass(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.options.user = Some(user.into());
        self.options.password = Some(pass.into());
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.options.token = Some(token.into());
        self
    }

    pub fn inbox_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.options.inbox_prefix = prefix.into();
        self
    }

    pub fn use_old_request_style(mut self, yes: bool) -> Self {
        self.options.use_old_request_style = yes;
        self
    }

    pub fn on_connected(mut self, cb: ConnCallback) -> Self {
        self.callbacks.connected = Some(cb);
        self
    }

    pub fn on_disconnected(mut self, cb: ConnCallback) -> Self {
        self.callbacks.disconnected = Some(cb);
        self
    }

    pub fn on_reconnected(mut self, cb: ConnCallback) -> Self {
        self.callbacks.reconnected = Some(cb);
        self
    }

    pub fn on_closed(mut self, cb: ConnCallback) -> Self {
        self.callbacks.closed = Some(cb);
        self
    }

    pub fn on_async_error(mut self, cb: AsyncErrorCallback) -> Self {
        self.callbacks.async_error = Some(cb);
        self
    }

    pub fn custom_reconnect_delay(mut self, cb: ReconnectDelayCallback) -> Self {
        self.callbacks.custom_reconnect_delay = Some(cb);
        self
    }

    pub fn event_loop(mut self, hooks: Arc<dyn EventLoopHooks>) -> Self {
        self.event_loop = Some(hooks);
        self
    }

    pub fn build(self) -> (Options, Callbacks, Option<Arc<dyn EventLoopHooks>>) {
        (self.options, self.callbacks, self.event_loop)
    }
}
