// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Server `INFO` and client `CONNECT` JSON bodies (§3, §6).
//!
//! JSON (de)serialization itself is an external collaborator (§1); this
//! module only defines the shapes and leans on `serde`/`serde_json`, the
//! same crates the teacher already pulls in for its own config file.

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind};

/// Parsed server `INFO` frame, sent once at handshake time and again
/// asynchronously whenever the cluster topology changes.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ServerInfo {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub max_payload: usize,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub tls_required: bool,
    #[serde(default)]
    pub tls_available: bool,
    #[serde(default)]
    pub connect_urls: Vec<String>,
    #[serde(default)]
    pub proto: i32,
    #[serde(default)]
    pub client_id: u64,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub client_ip: String,
    #[serde(default)]
    pub lame_duck_mode: bool,
    #[serde(default)]
    pub headers: bool,
}

impl ServerInfo {
    pub fn parse(json: &[u8]) -> Result<Self, Error> {
        // anyhow::Context chains the parse failure with the raw frame the
        // way the teacher wraps its own decode call sites in pool_sessions.rs,
        // before it is flattened into the crate's own error currency.
        serde_json::from_slice(json)
            .context("decoding server INFO frame")
            .map_err(|e| Error::with_detail(ErrorKind::ProtocolError, format!("{e:#}")))
    }
}

/// Client `CONNECT` JSON body (§6). `lang` mirrors the teacher's own
/// implementation-tag convention (a short fixed string identifying the
/// client implementation), here set to this crate's own tag rather than
/// the original "C"-equivalent value.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectInfo {
    pub verbose: bool,
    pub pedantic: bool,
    pub tls_required: bool,
    pub name: Option<String>,
    pub lang: &'static str,
    pub version: &'static str,
    pub protocol: i32,
    pub echo: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
    pub headers: bool,
    pub no_responders: bool,
}

impl ConnectInfo {
    pub fn to_json(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self)
            .context("encoding CONNECT frame")
            .map_err(|e| Error::with_detail(ErrorKind::ProtocolError, format!("{e:#}")))
    }
}

pub const CLIENT_LANG: &str = "rust-engine";
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PROTOCOL_VERSION: i32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_info_frame() {
        let json =
            br#"{"server_id":"abc","version":"2.10.0","host":"0.0.0.0","port":4222,"max_payload":1048576,"proto":1}"#;
        let info = ServerInfo::parse(json).expect("parse info");
        assert_eq!(info.server_id, "abc");
        assert_eq!(info.max_payload, 1_048_576);
    }

    #[test]
    fn connect_info_omits_absent_credentials() {
        let c = ConnectInfo {
            verbose: false,
            pedantic: false,
            tls_required: false,
            name: None,
            lang: CLIENT_LANG,
            version: CLIENT_VERSION,
            protocol: PROTOCOL_VERSION,
            echo: true,
            user: None,
            pass: None,
            auth_token: None,
            nkey: None,
            jwt: None,
            sig: None,
            headers: true,
            no_responders: true,
        };
        let json = c.to_json().expect("serialize");
        let text = String::from_utf8(json).expect("utf8");
        assert!(!text.contains("\"user\""));
        assert!(text.contains("\"echo\":true"));
    }
}
