// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The public error currency of the connection engine.
//!
//! Every fallible operation returns a short, matchable [`ErrorKind`] plus a
//! free-form diagnostic string. The diagnostic text is also mirrored onto
//! the owning [`crate::connection::Connection`] as the "last error", so
//! callers that only care about the short kind can still recover the long
//! story later without threading a logger through every call site.

use std::fmt;

use thiserror::Error;

/// Stable, matchable error categories. Names follow §7 of the design
/// document; they are not meant to be exhaustive strings for humans (use
/// [`Error`]'s `Display` impl for that).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NoServers,
    ConnectionClosed,
    ConnectionDisconnected,
    StaleConnection,
    ProtocolError,
    AuthRequired,
    AuthFailed,
    AuthExpired,
    NotPermitted,
    TlsError,
    SecureWanted,
    InvalidSubject,
    InvalidQueueName,
    MaxPayloadExceeded,
    SlowConsumer,
    MaxDelivered,
    Draining,
    Timeout,
    NoMemory,
    InvalidArg,
    NoServerSupport,
    NotYetConnected,
    Io,
}

impl ErrorKind {
    /// Fixed, human-readable summary for this kind; used as the default
    /// message when no extra context is supplied.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NoServers => "no servers available",
            ErrorKind::ConnectionClosed => "connection closed",
            ErrorKind::ConnectionDisconnected => "connection disconnected",
            ErrorKind::StaleConnection => "stale connection",
            ErrorKind::ProtocolError => "protocol error",
            ErrorKind::AuthRequired => "authorization required",
            ErrorKind::AuthFailed => "authorization failed",
            ErrorKind::AuthExpired => "authorization expired",
            ErrorKind::NotPermitted => "not permitted",
            ErrorKind::TlsError => "tls error",
            ErrorKind::SecureWanted => "secure connection wanted",
            ErrorKind::InvalidSubject => "invalid subject",
            ErrorKind::InvalidQueueName => "invalid queue name",
            ErrorKind::MaxPayloadExceeded => "maximum payload exceeded",
            ErrorKind::SlowConsumer => "slow consumer",
            ErrorKind::MaxDelivered => "maximum messages delivered",
            ErrorKind::Draining => "connection is draining",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NoMemory => "no memory",
            ErrorKind::InvalidArg => "invalid argument",
            ErrorKind::NoServerSupport => "server does not support this feature",
            ErrorKind::NotYetConnected => "not yet connected",
            ErrorKind::Io => "i/o error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A [`ErrorKind`] paired with an optional longer diagnostic.
///
/// Kept intentionally cheap to clone (the message is an `Arc<str>`-free
/// owned `String` only when it differs from the kind's canonical text) so
/// it can be stashed as the connection's "last error" without extra
/// allocation churn on the hot path.
#[derive(Error, Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    detail: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, detail: None }
    }

    pub fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: Some(detail.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {detail}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::with_detail(ErrorKind::Io, e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
