// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Component J: the connection core — public API, lifecycle, lock
//! discipline, status, callbacks (§4.J).
//!
//! Grounded on the teacher's `client::client::ClientConnection`: the
//! struct that owns the socket halves and exposes the public
//! request/response surface, with `graceful_quiesce` driving an orderly
//! shutdown sequence. The lock discipline here (`conn.lock` ->
//! `subs.lock` -> `sub.lock`/`worker.lock`, §5) has no teacher analogue
//! (the teacher runs single-threaded-per-session under Tokio) and follows
//! spec.md directly.

use std::{
    collections::VecDeque,
    io::{BufReader, Read, Write},
    net::TcpStream,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex, Weak,
    },
    time::{Duration, Instant},
};

use tracing::{debug, error, info, instrument, warn};

use crate::{
    addr::ServerAddr,
    delivery::{self, SharedWorkerPool, TableHandle},
    error::{Error, ErrorKind},
    flusher::Flusher,
    heartbeat::{Heartbeat, Tick},
    inbox::generate_inbox,
    info::{ConnectInfo, ServerInfo},
    message::Message,
    options::{Callbacks, EventLoopHooks, Options},
    parser::{Parser, ParserEvent},
    reconnect::{AttemptOutcome, ReconnectSupervisor},
    reqreply::RequestMux,
    server_pool::{ServerInPool, ServerPool},
    stats::Statistics,
    status::Status,
    subscription::{ControlKind, Dispatch, SubLimits, Subscription, SubscriptionTable},
};

const MAX_CONTROL_LINE: usize = 1024;

struct PongWaiter {
    state: Mutex<Option<bool>>,
    cond: Condvar,
}

impl PongWaiter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    fn signal(&self, ok: bool) {
        let mut s = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *s = Some(ok);
        drop(s);
        self.cond.notify_all();
    }

    fn wait(&self, timeout: Duration) -> Result<(), Error> {
        let mut s = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(ok) = *s {
                return if ok {
                    Ok(())
                } else {
                    Err(Error::new(ErrorKind::ConnectionDisconnected))
                };
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::new(ErrorKind::Timeout));
            }
            let (guard, result) = self
                .cond
                .wait_timeout(s, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            s = guard;
            if result.timed_out() && s.is_none() {
                return Err(Error::new(ErrorKind::Timeout));
            }
        }
    }
}

/// Public handle for a connection (§3 "Connection"). Cheap to clone: it is
/// always handed around as `Arc<Connection>`.
pub struct Connection {
    options: Arc<Options>,
    callbacks: Callbacks,
    pool: Arc<Mutex<ServerPool>>,
    subs: Arc<SubscriptionTable>,
    flusher: Arc<Flusher>,
    heartbeat: Mutex<Arc<Heartbeat>>,
    reconnect: Arc<ReconnectSupervisor>,
    mux: Arc<RequestMux>,
    shared_workers: Mutex<Option<Arc<SharedWorkerPool>>>,
    status: Mutex<Status>,
    status_cond: Condvar,
    stats: Statistics,
    last_error: Mutex<Option<Error>>,
    server_info: Mutex<Option<ServerInfo>>,
    pong_queue: Mutex<VecDeque<Arc<PongWaiter>>>,
    reader_generation: AtomicU64,
    self_ref: Mutex<Weak<Connection>>,
    /// Host-driven I/O embedding (§6 "Event-loop embedding"). When set, the
    /// connection core spawns no reader/flusher/heartbeat threads; the host
    /// calls [`Connection::process_read_event`]/[`Connection::process_write_event`]
    /// when the socket is ready.
    event_loop: Option<Arc<dyn EventLoopHooks>>,
    /// The live socket clone used by `process_read_event` in event-loop
    /// mode only; unused (always `None`) under the default threaded mode.
    event_socket: Mutex<Option<TcpStream>>,
    /// Parser state for event-loop mode, where reads happen across many
    /// short-lived `process_read_event` calls instead of one owned thread.
    parser: Mutex<Parser>,
}

struct NoOpTable;
impl TableHandle for NoOpTable {
    fn remove(&self, _sid: u64) {}
    fn async_error_slow_consumer(&self, _sub: Arc<Subscription>) {}
    fn async_error_max_delivered(&self, _sub: Arc<Subscription>) {}
}

impl TableHandle for Connection {
    fn remove(&self, sid: u64) {
        self.subs.remove(sid);
    }

    fn async_error_slow_consumer(&self, sub: Arc<Subscription>) {
        if let Some(cb) = &self.callbacks.async_error {
            if let Some(me) = self.self_ref.lock().unwrap_or_else(std::sync::PoisonError::into_inner).upgrade() {
                cb(me, Some(sub), Error::new(ErrorKind::SlowConsumer));
            }
        }
    }

    fn async_error_max_delivered(&self, sub: Arc<Subscription>) {
        if let Some(cb) = &self.callbacks.async_error {
            if let Some(me) = self.self_ref.lock().unwrap_or_else(std::sync::PoisonError::into_inner).upgrade() {
                cb(me, Some(sub), Error::new(ErrorKind::MaxDelivered));
            }
        }
    }
}

impl Connection {
    /// Establish the initial connection (§4.J "connect"). Walks the pool;
    /// the first successful handshake wins. When `retry_on_failed_connect`
    /// is set and no `connected` callback is registered, blocks until
    /// success or the pool is exhausted; otherwise (callback mode) returns
    /// `not-yet-connected` immediately and lets the supervisor drive the
    /// first connection in the background (§9 open question, resolved).
    #[instrument(skip(options, callbacks, event_loop))]
    pub fn connect(
        options: Options,
        callbacks: Callbacks,
        event_loop: Option<Arc<dyn EventLoopHooks>>,
    ) -> Result<Arc<Connection>, Error> {
        let options = Arc::new(options);
        let pool = Arc::new(Mutex::new(ServerPool::new(&options)?));

        let conn = Arc::new(Connection {
            flusher: Flusher::new(options.reconnect_buf_size),
            heartbeat: Mutex::new(Heartbeat::new(options.ping_interval, options.max_pings_out)),
            reconnect: Arc::new(ReconnectSupervisor::new(Arc::clone(&options))),
            mux: Arc::new(RequestMux::new(&options.inbox_prefix)),
            subs: Arc::new(SubscriptionTable::new()),
            shared_workers: Mutex::new(None),
            status: Mutex::new(Status::Connecting),
            status_cond: Condvar::new(),
            stats: Statistics::default(),
            last_error: Mutex::new(None),
            server_info: Mutex::new(None),
            pong_queue: Mutex::new(VecDeque::new()),
            reader_generation: AtomicU64::new(0),
            self_ref: Mutex::new(Weak::new()),
            event_loop,
            event_socket: Mutex::new(None),
            parser: Mutex::new(Parser::new()),
            options,
            callbacks,
            pool,
        });
        *conn.self_ref.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::downgrade(&conn);

        if conn.options.shared_delivery_workers > 0 {
            let conn_dyn: Arc<dyn TableHandle> = conn.clone();
            let table: Weak<dyn TableHandle> = Arc::downgrade(&conn_dyn);
            let pool = SharedWorkerPool::new(conn.options.shared_delivery_workers, table);
            *conn
                .shared_workers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(pool);
        }

        let server = {
            let pool = conn.lock_pool();
            pool.current().cloned()
        };
        let Some(server) = server else {
            return Err(Error::new(ErrorKind::NoServers));
        };

        match conn.dial_and_handshake(&server) {
            Ok(()) => {
                conn.set_status(Status::Connected);
                conn.lock_pool().record_connected();
                conn.spawn_steady_state_threads();
                if let Some(cb) = &conn.callbacks.connected {
                    if let Some(me) = conn.upgrade_self() {
                        cb(me);
                    }
                }
                Ok(conn)
            }
            Err(e) if conn.options.retry_on_failed_connect && conn.callbacks.connected.is_none() => {
                warn!(error = %e, "initial connect failed, retrying per retry_on_failed_connect");
                conn.lock_pool().record_attempt_failed();
                let attempt_cb = conn.reconnect_attempt_closure();
                let connected = conn.reconnect.run(&conn.pool, &conn.callbacks, &*attempt_cb);
                if connected {
                    conn.set_status(Status::Connected);
                    conn.spawn_steady_state_threads();
                    Ok(conn)
                } else {
                    conn.set_status(Status::Closed);
                    Err(Error::new(ErrorKind::NoServers))
                }
            }
            Err(e) if conn.options.retry_on_failed_connect => {
                // A `connected` callback is set: async retry, return
                // not-yet-connected now (§9 open question resolution).
                debug!(error = %e, "initial connect failed, deferring to async supervisor");
                conn.set_status(Status::Reconnecting);
                let conn2 = Arc::clone(&conn);
                std::thread::spawn(move || conn2.run_reconnect_supervisor(true));
                Err(Error::new(ErrorKind::NotYetConnected))
            }
            Err(e) => Err(e),
        }
    }

    fn upgrade_self(&self) -> Option<Arc<Connection>> {
        self.self_ref
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .upgrade()
    }

    fn lock_pool(&self) -> std::sync::MutexGuard<'_, ServerPool> {
        self.pool.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn set_status(&self, status: Status) {
        let mut s = self
            .status
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *s = status;
        drop(s);
        self.status_cond.notify_all();
    }

    pub fn status(&self) -> Status {
        *self.status.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn stats(&self) -> crate::stats::StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn last_error(&self) -> Option<Error> {
        self.last_error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn set_last_error(&self, e: Error) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(e);
    }

    fn clear_last_error(&self) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    }

    /// Dial one server and run the INFO/CONNECT/PING/PONG handshake
    /// (§4.I step 3). On success the flusher is attached to the live
    /// socket, the reader thread is (re)spawned, and the heartbeat timer
    /// restarted.
    fn dial_and_handshake(&self, server: &ServerInPool) -> Result<(), Error> {
        let stream = TcpStream::connect((server.addr.host.as_str(), server.addr.port))
            .map_err(Error::from)?;
        stream.set_nodelay(true).ok();
        stream
            .set_read_timeout(Some(self.options.timeout))
            .map_err(Error::from)?;

        let mut reader = BufReader::new(stream.try_clone().map_err(Error::from)?);
        let info_line = read_control_line(&mut reader)?;
        let info_text = info_line
            .strip_prefix("INFO ")
            .ok_or_else(|| Error::with_detail(ErrorKind::ProtocolError, "expected INFO"))?;
        let server_info = ServerInfo::parse(info_text.as_bytes())?;

        let connect_info = ConnectInfo {
            verbose: self.options.verbose,
            pedantic: self.options.pedantic,
            tls_required: self.options.secure,
            name: self.options.name.clone(),
            lang: crate::info::CLIENT_LANG,
            version: crate::info::CLIENT_VERSION,
            protocol: crate::info::PROTOCOL_VERSION,
            echo: !self.options.no_echo,
            user: self.options.user.clone(),
            pass: self.options.password.clone(),
            auth_token: self.options.token.clone(),
            nkey: self.options.nkey.clone(),
            jwt: None,
            sig: None,
            headers: true,
            no_responders: !self.options.disable_no_responders,
        };
        let mut writer = stream.try_clone().map_err(Error::from)?;
        writer.write_all(b"CONNECT ").map_err(Error::from)?;
        writer.write_all(&connect_info.to_json()?).map_err(Error::from)?;
        writer.write_all(b"\r\n").map_err(Error::from)?;
        writer.write_all(b"PING\r\n").map_err(Error::from)?;
        writer.flush().map_err(Error::from)?;

        let reply = read_control_line(&mut reader)?;
        if reply.trim_end() != "PONG" {
            return Err(Error::with_detail(
                ErrorKind::ProtocolError,
                format!("expected PONG during handshake, got '{reply}'"),
            ));
        }

        *self
            .server_info
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(server_info.clone());
        if !self.options.ignore_discovered_servers {
            self.lock_pool()
                .add_discovered(&server_info.connect_urls, None);
        }

        self.replay_subscriptions(&mut writer)?;
        self.flusher.attach(Box::new(writer));

        if let Some(hooks) = self.event_loop.clone() {
            // `reader` may already hold bytes the server pipelined right
            // after PONG in the same read syscall; `into_inner` would
            // silently drop them, so drain the scratch buffer first.
            let leftover = reader.buffer().to_vec();
            let read_stream = reader.into_inner();
            read_stream.set_nonblocking(true).map_err(Error::from)?;
            *self
                .event_socket
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(read_stream);
            *self
                .parser
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = Parser::new();
            if !leftover.is_empty() {
                self.stats.record_in(leftover.len());
                let events = {
                    let mut parser = self
                        .parser
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    parser.parse(&leftover)
                };
                match events {
                    Ok(events) => {
                        for event in events {
                            self.handle_event(event);
                        }
                    }
                    Err(e) => self.set_last_error(e),
                }
            }
            if let Some(me) = self.upgrade_self() {
                hooks.attach(me);
            }
        } else {
            let generation = self.reader_generation.fetch_add(1, Ordering::SeqCst) + 1;
            let me = self.upgrade_self();
            if let Some(me) = me {
                std::thread::spawn(move || me.reader_loop(reader, generation));
            }
        }
        Ok(())
    }

    /// Host-driven read readiness (§6 "Event-loop embedding"). No-op unless
    /// `options.event_loop` was set at `connect` time.
    pub fn process_read_event(&self) {
        let Some(mut stream) = self
            .event_socket
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .and_then(|s| s.try_clone().ok())
        else {
            return;
        };
        let mut buf = [0u8; 8192];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => {
                    debug!("event-loop reader observed EOF");
                    if let Some(me) = self.upgrade_self() {
                        me.begin_reconnect(false);
                    }
                    return;
                }
                Ok(n) => {
                    self.stats.record_in(n);
                    let events = {
                        let mut parser = self
                            .parser
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner);
                        match parser.parse(&buf[..n]) {
                            Ok(events) => events,
                            Err(e) => {
                                error!(error = %e, "protocol error on event-loop socket");
                                self.set_last_error(e);
                                if let Some(me) = self.upgrade_self() {
                                    me.begin_reconnect(false);
                                }
                                return;
                            }
                        }
                    };
                    for event in events {
                        self.handle_event(event);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    debug!(error = %e, "event-loop socket error");
                    if let Some(me) = self.upgrade_self() {
                        me.begin_reconnect(false);
                    }
                    return;
                }
            }
        }
    }

    /// Host-driven write readiness (§6 "Event-loop embedding"): drain
    /// whatever the flusher has queued in a single write. No-op unless
    /// `options.event_loop` was set at `connect` time.
    pub fn process_write_event(&self) {
        if let Err(e) = self.flusher.drain_once() {
            debug!(error = %e, "event-loop write failed");
            if let Some(me) = self.upgrade_self() {
                me.begin_reconnect(false);
            }
        }
    }

    /// Spawn the reader/flusher/heartbeat threads this connection owns
    /// under the default threaded mode. Skipped entirely when embedded in
    /// a host event loop (§6 "do not own any threads" when embedded); the
    /// host is then responsible for calling `process_read_event`/
    /// `process_write_event`, and PING emission is left to the host too.
    fn spawn_steady_state_threads(self: &Arc<Self>) {
        if self.event_loop.is_some() {
            return;
        }
        let flusher = Arc::clone(&self.flusher);
        std::thread::spawn(move || flusher.run());

        let hb = Arc::clone(&self.heartbeat.lock().unwrap_or_else(std::sync::PoisonError::into_inner));
        let me = Arc::clone(self);
        std::thread::spawn(move || {
            hb.run(move |tick| me.on_heartbeat_tick(tick));
        });
    }

    fn on_heartbeat_tick(self: &Arc<Self>, tick: Tick) {
        match tick {
            Tick::SendPing => {
                self.flusher.enqueue(b"PING\r\n");
                self.flusher.kick();
            }
            Tick::Stale => {
                warn!("stale connection: max pings out exceeded");
                self.begin_reconnect(false);
            }
        }
    }

    fn reader_loop(self: Arc<Self>, mut reader: BufReader<TcpStream>, generation: u64) {
        let mut parser = Parser::new();
        let mut buf = [0u8; 8192];
        loop {
            if self.reader_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            let n = match reader.read(&mut buf) {
                Ok(0) => {
                    debug!("reader observed EOF");
                    self.begin_reconnect(false);
                    return;
                }
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                    continue;
                }
                Err(e) => {
                    debug!(error = %e, "reader socket error");
                    self.begin_reconnect(false);
                    return;
                }
            };
            self.stats.record_in(n);
            let events = match parser.parse(&buf[..n]) {
                Ok(events) => events,
                Err(e) => {
                    error!(error = %e, "protocol error, tearing down socket");
                    self.set_last_error(e);
                    self.begin_reconnect(false);
                    return;
                }
            };
            for event in events {
                self.handle_event(event);
            }
        }
    }

    fn handle_event(&self, event: ParserEvent) {
        match event {
            ParserEvent::Msg {
                subject,
                sid,
                reply,
                payload,
            } => {
                self.stats.record_in(payload.len());
                let mut msg = Message::new(&subject, sid, payload);
                msg.reply = reply;
                if self.mux.is_installed() && subject.starts_with(&format!("{}.", self.mux.prefix())) {
                    if self.mux.deliver_reply(&subject, msg) {
                        return;
                    }
                    return;
                }
                if let Some(outcome) = self.subs.process_msg(sid, msg) {
                    if let crate::subscription::EnqueueOutcome::DroppedNewSlowConsumer = outcome {
                        if let Some(sub) = self.subs.get(sid) {
                            self.async_error_slow_consumer(sub);
                        }
                    }
                }
            }
            ParserEvent::Ok => {}
            ParserEvent::Err(text) => {
                warn!(text = %text, "-ERR from server");
                let lowered = text.to_ascii_lowercase();
                let kind = if lowered.contains("permissions violation") {
                    ErrorKind::NotPermitted
                } else if lowered.contains("authentication expired") || lowered.contains("auth expired") {
                    ErrorKind::AuthExpired
                } else if lowered.contains("stale connection") {
                    ErrorKind::StaleConnection
                } else if lowered.contains("authorization") {
                    ErrorKind::AuthFailed
                } else {
                    ErrorKind::ProtocolError
                };
                let err = Error::with_detail(kind, text);
                self.set_last_error(err.clone());
                if let Some(cb) = &self.callbacks.async_error {
                    if let Some(me) = self.upgrade_self() {
                        cb(me, None, err);
                    }
                }
            }
            ParserEvent::Ping => {
                self.flusher.enqueue(b"PONG\r\n");
                self.flusher.kick();
            }
            ParserEvent::Pong => {
                self.heartbeat
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .on_pong();
                let waiter = {
                    let mut q = self
                        .pong_queue
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    q.pop_front()
                };
                if let Some(w) = waiter {
                    w.signal(true);
                }
            }
            ParserEvent::AsyncInfo(bytes) => {
                if let Ok(info) = ServerInfo::parse(&bytes) {
                    if !self.options.ignore_discovered_servers {
                        self.lock_pool().add_discovered(&info.connect_urls, None);
                        if let Some(cb) = &self.callbacks.discovered_servers {
                            if let Some(me) = self.upgrade_self() {
                                cb(me);
                            }
                        }
                    }
                    if info.lame_duck_mode {
                        if let Some(cb) = &self.callbacks.lame_duck {
                            if let Some(me) = self.upgrade_self() {
                                cb(me);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Validate a subject per §6: non-empty, no whitespace.
    fn validate_subject(subject: &str) -> Result<(), Error> {
        if subject.is_empty() || subject.chars().any(char::is_whitespace) {
            return Err(Error::new(ErrorKind::InvalidSubject));
        }
        Ok(())
    }

    fn validate_queue(queue: &str) -> Result<(), Error> {
        if queue.is_empty() || queue.chars().any(char::is_whitespace) {
            return Err(Error::new(ErrorKind::InvalidQueueName));
        }
        Ok(())
    }

    /// Publish a message (§4.J "publish").
    pub fn publish(&self, subject: &str, reply: Option<&str>, payload: &[u8]) -> Result<(), Error> {
        Self::validate_subject(subject)?;
        match self.status() {
            Status::Closed => return Err(Error::new(ErrorKind::ConnectionClosed)),
            Status::DrainingPubs => return Err(Error::new(ErrorKind::Draining)),
            _ => {}
        }
        let mp = self
            .server_info
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .map_or(0, |info| info.max_payload);
        if mp != 0 && payload.len() > mp {
            return Err(Error::new(ErrorKind::MaxPayloadExceeded));
        }
        let header = match reply {
            Some(r) => format!("PUB {subject} {r} {}\r\n", payload.len()),
            None => format!("PUB {subject} {}\r\n", payload.len()),
        };
        let mut bytes = Vec::with_capacity(header.len() + payload.len() + 2);
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(payload);
        bytes.extend_from_slice(b"\r\n");

        self.flusher.enqueue(&bytes);
        if self.options.send_asap {
            self.flusher.kick();
        }
        self.stats.record_out(payload.len());
        self.clear_last_error();
        Ok(())
    }

    /// Subscribe to `subject`, optionally as part of `queue_group`, with an
    /// async callback (§4.J "subscribe").
    pub fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        callback: Option<Box<dyn Fn(Message) + Send + Sync>>,
        timeout: Option<Duration>,
    ) -> Result<Arc<Subscription>, Error> {
        Self::validate_subject(subject)?;
        if let Some(q) = queue_group {
            Self::validate_queue(q)?;
        }
        if matches!(self.status(), Status::DrainingSubs | Status::DrainingPubs | Status::Closed) {
            return Err(Error::new(ErrorKind::Draining));
        }

        let sid = self.subs.next_sid();
        let dispatch = match callback {
            Some(cb) => Dispatch::Async(cb),
            None => Dispatch::Sync,
        };
        let sub = Arc::new(Subscription::new(
            sid,
            subject.to_string(),
            queue_group.map(str::to_string),
            dispatch,
            SubLimits {
                max_msgs: self.options.max_pending_msgs,
                max_bytes: self.options.max_pending_bytes,
            },
            timeout,
            None,
        ));
        self.subs.insert(Arc::clone(&sub));

        let table: Arc<dyn TableHandle> = match self.upgrade_self() {
            Some(me) => me,
            None => Arc::new(NoOpTable),
        };
        let shared = self
            .shared_workers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        delivery::start_delivery(&sub, shared.as_ref(), Arc::downgrade(&table));

        if !matches!(self.status(), Status::Reconnecting) {
            let line = match queue_group {
                Some(q) => format!("SUB {subject} {q} {sid}\r\n"),
                None => format!("SUB {subject} {sid}\r\n"),
            };
            self.flusher.enqueue(line.as_bytes());
        }
        Ok(sub)
    }

    /// Unsubscribe, optionally installing an auto-unsubscribe cap
    /// (§4.J "unsubscribe"). `max == 0` removes immediately.
    pub fn unsubscribe(&self, sub: &Arc<Subscription>, max: u64) -> Result<(), Error> {
        if max == 0 {
            self.flusher.enqueue(format!("UNSUB {}\r\n", sub.sid).as_bytes());
            self.subs.remove(sub.sid);
        } else {
            sub.set_max(max);
            self.flusher
                .enqueue(format!("UNSUB {} {}\r\n", sub.sid, max).as_bytes());
        }
        Ok(())
    }

    /// Flush outstanding writes and wait for the server to acknowledge
    /// (§4.J "flush"): enqueue a PONG waiter, send PING, wait.
    pub fn flush(&self, timeout: Duration) -> Result<(), Error> {
        match self.status() {
            Status::Closed => return Err(Error::new(ErrorKind::ConnectionClosed)),
            Status::Reconnecting => return Err(Error::new(ErrorKind::ConnectionDisconnected)),
            _ => {}
        }
        let waiter = PongWaiter::new();
        self.pong_queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(Arc::clone(&waiter));
        self.flusher.enqueue(b"PING\r\n");
        self.flusher.kick();
        waiter.wait(timeout)
    }

    /// Enqueue a bare PING without waiting for the PONG (§4.J). Event-loop
    /// embedders own no heartbeat thread of their own and are expected to
    /// call this on their own timer if they want liveness detection.
    pub fn ping(&self) {
        self.flusher.enqueue(b"PING\r\n");
        self.flusher.kick();
    }

    /// Issue a request and block for the reply (§4.J "request").
    pub fn request(&self, subject: &str, payload: &[u8], timeout: Duration) -> Result<Message, Error> {
        Self::validate_subject(subject)?;
        if self.options.use_old_request_style {
            return self.request_legacy(subject, payload, timeout);
        }
        if !self.mux.is_installed() {
            let wildcard = self.mux.wildcard_subject();
            let mux = Arc::clone(&self.mux);
            self.subscribe(
                &wildcard,
                None,
                Some(Box::new(move |msg| {
                    mux.deliver_reply(&msg.subject, msg.clone());
                })),
                None,
            )?;
            self.mux.mark_installed();
        }
        let publish_fn = |subject: &str, reply: Option<&str>, payload: &[u8]| self.publish(subject, reply, payload);
        self.mux.request(&publish_fn, subject, payload, timeout)
    }

    fn request_legacy(&self, subject: &str, payload: &[u8], timeout: Duration) -> Result<Message, Error> {
        let reply_to = generate_inbox(&self.options.inbox_prefix);
        let slot: Arc<Mutex<Option<Message>>> = Arc::new(Mutex::new(None));
        let cond = Arc::new(Condvar::new());
        let slot2 = Arc::clone(&slot);
        let cond2 = Arc::clone(&cond);
        let sub = self.subscribe(
            &reply_to,
            None,
            Some(Box::new(move |msg| {
                *slot2.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(msg);
                cond2.notify_all();
            })),
            None,
        )?;
        self.publish(subject, Some(&reply_to), payload)?;

        let mut guard = slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let deadline = Instant::now() + timeout;
        while guard.is_none() {
            let now = Instant::now();
            if now >= deadline {
                let _ = self.unsubscribe(&sub, 0);
                return Err(Error::new(ErrorKind::Timeout));
            }
            let (g, result) = cond
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard = g;
            if result.timed_out() && guard.is_none() {
                let _ = self.unsubscribe(&sub, 0);
                return Err(Error::new(ErrorKind::Timeout));
            }
        }
        let _ = self.unsubscribe(&sub, 0);
        guard.take().ok_or_else(|| Error::new(ErrorKind::Timeout))
    }

    /// Graceful shutdown (§4.J "drain"): CONNECTED -> DRAINING_SUBS ->
    /// DRAINING_PUBS -> CLOSED.
    pub fn drain(self: &Arc<Self>, timeout: Duration) -> Result<(), Error> {
        self.set_status(Status::DrainingSubs);
        let deadline = Instant::now() + timeout;
        let subs = self.subs.iter();
        for sub in &subs {
            self.flusher.enqueue(format!("UNSUB {}\r\n", sub.sid).as_bytes());
            sub.push_control(ControlKind::DrainComplete);
        }
        for sub in &subs {
            while self.subs.get(sub.sid).is_some() && sub.pending_len() > 0 {
                if Instant::now() >= deadline {
                    if let Some(cb) = &self.callbacks.async_error {
                        if let Some(me) = self.upgrade_self() {
                            cb(me, Some(Arc::clone(sub)), Error::new(ErrorKind::Timeout));
                        }
                    }
                    break;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            self.subs.remove(sub.sid);
        }

        self.set_status(Status::DrainingPubs);
        let _ = self.flush(deadline.saturating_duration_since(Instant::now()));

        self.close();
        Ok(())
    }

    /// Best-effort final flush then teardown (§4.J "close/destroy").
    pub fn close(self: &Arc<Self>) {
        if matches!(self.status(), Status::Closed) {
            return;
        }
        if matches!(self.status(), Status::Connected) {
            let _ = self.flush(Duration::from_millis(500));
        }
        self.reconnect.abort();
        self.heartbeat
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .stop();
        self.flusher.shutdown();
        self.reader_generation.fetch_add(1, Ordering::SeqCst);
        if let Some(hooks) = self.event_loop.clone() {
            *self
                .event_socket
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
            if let Some(me) = self.upgrade_self() {
                hooks.detach(me);
            }
        }
        self.mux.fail_all(true);
        {
            let mut q = self
                .pong_queue
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            for w in q.drain(..) {
                w.signal(false);
            }
        }
        for sub in self.subs.iter() {
            sub.push_control(ControlKind::Close);
            self.subs.remove(sub.sid);
        }
        self.set_status(Status::Closed);
        if let Some(cb) = &self.callbacks.closed {
            if let Some(me) = self.upgrade_self() {
                cb(me);
            }
        }
    }

    fn reconnect_attempt_closure(self: &Arc<Self>) -> Box<dyn Fn(&ServerInPool) -> AttemptOutcome + Send + Sync> {
        let me = Arc::clone(self);
        Box::new(move |server| match me.dial_and_handshake(server) {
            Ok(()) => AttemptOutcome::Connected,
            Err(e) => {
                let code = match e.kind() {
                    ErrorKind::AuthFailed | ErrorKind::AuthRequired => Some(1u16),
                    _ => None,
                };
                AttemptOutcome::Failed {
                    auth_error_code: code,
                }
            }
        })
    }

    /// Re-issue `SUB`/`UNSUB` lines for every live subscription directly
    /// onto `writer`, so replay lands on the wire before the flusher's
    /// pending buffer (anything queued while disconnected) is merged in by
    /// `attach` (§4.I "resubscribe before replaying buffered publishes").
    fn replay_subscriptions(&self, writer: &mut TcpStream) -> Result<(), Error> {
        for sub in self.subs.iter() {
            let line = match &sub.queue_group {
                Some(q) => format!("SUB {} {q} {}\r\n", sub.subject, sub.sid),
                None => format!("SUB {} {}\r\n", sub.subject, sub.sid),
            };
            writer.write_all(line.as_bytes()).map_err(Error::from)?;
            let max = sub.max.load(Ordering::SeqCst);
            if max != 0 {
                writer
                    .write_all(format!("UNSUB {} {}\r\n", sub.sid, max).as_bytes())
                    .map_err(Error::from)?;
            }
        }
        Ok(())
    }

    /// Begin the reconnect sequence (§4.I steps 1-2) and hand off to the
    /// supervisor thread.
    fn begin_reconnect(self: &Arc<Self>, initial: bool) {
        if matches!(self.status(), Status::Closed | Status::Reconnecting) {
            return;
        }
        self.heartbeat
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .stop();
        self.reader_generation.fetch_add(1, Ordering::SeqCst);
        {
            let mut q = self
                .pong_queue
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            for w in q.drain(..) {
                w.signal(false);
            }
        }
        self.flusher.detach(self.options.reconnect_buf_size);
        if let Some(hooks) = self.event_loop.clone() {
            *self
                .event_socket
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
            if let Some(me) = self.upgrade_self() {
                hooks.detach(me);
            }
        }
        self.set_status(Status::Reconnecting);

        if !initial {
            if let Some(cb) = &self.callbacks.disconnected {
                if let Some(me) = self.upgrade_self() {
                    cb(me);
                }
            }
        }

        let me = Arc::clone(self);
        std::thread::spawn(move || me.run_reconnect_supervisor(initial));
    }

    fn run_reconnect_supervisor(self: Arc<Self>, initial: bool) {
        let attempt = self.reconnect_attempt_closure();
        let connected = self.reconnect.run(&self.pool, &self.callbacks, &*attempt);
        if connected {
            self.set_status(Status::Connected);
            if !initial {
                self.stats.record_reconnect();
            }
            *self
                .heartbeat
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) =
                Heartbeat::new(self.options.ping_interval, self.options.max_pings_out);
            self.spawn_steady_state_threads();
            let cb = if initial {
                &self.callbacks.connected
            } else {
                &self.callbacks.reconnected
            };
            if let Some(cb) = cb {
                if let Some(me) = self.upgrade_self() {
                    cb(me);
                }
            }
        } else {
            info!("reconnect supervisor exhausted the pool, closing");
            if let Some(cb) = &self.callbacks.disconnected {
                if let Some(me) = self.upgrade_self() {
                    cb(me);
                }
            }
            self.set_status(Status::Closed);
            if let Some(cb) = &self.callbacks.closed {
                if let Some(me) = self.upgrade_self() {
                    cb(me);
                }
            }
        }
    }
}

fn read_control_line(reader: &mut BufReader<TcpStream>) -> Result<String, Error> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = reader.read(&mut byte).map_err(Error::from)?;
        if n == 0 {
            return Err(Error::new(ErrorKind::ConnectionClosed));
        }
        if line.len() >= MAX_CONTROL_LINE * 32 {
            return Err(Error::with_detail(ErrorKind::ProtocolError, "control line too long"));
        }
        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            line.truncate(line.len() - 2);
            break;
        }
    }
    String::from_utf8(line).map_err(|_| Error::with_detail(ErrorKind::ProtocolError, "non-utf8 control line"))
}

/// Public constructor mirroring `ServerAddr::parse` for callers that only
/// want to validate a single URL before building `Options`.
pub fn validate_url(url: &str) -> Result<(), Error> {
    ServerAddr::parse(url).map(|_| ())
}
