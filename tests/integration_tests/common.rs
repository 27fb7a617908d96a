// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    io::{BufRead, BufReader, Read, Write},
    net::{TcpListener, TcpStream},
    sync::Arc,
};

use anyhow::Result;
use nats_engine::{Connection, OptionsBuilder};

/// An in-process stand-in for a server: binds an ephemeral port and hands
/// out `TcpStream`s to whichever test wants to drive the handshake itself.
/// Mirrors the teacher's `load_config`/`connect_cfg` fixture role, minus
/// the on-disk config since there is no real target to dial here.
pub struct StubServer {
    pub listener: TcpListener,
}

impl StubServer {
    pub fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub listener");
        Self { listener }
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().expect("local addr").port()
    }

    pub fn url(&self) -> String {
        format!("nats://127.0.0.1:{}", self.port())
    }
}

/// Write the INFO line, read CONNECT + PING, reply PONG: the fixed prefix
/// every scenario below needs before its own behavior can diverge.
pub fn server_handshake(stream: &TcpStream) -> BufReader<TcpStream> {
    let mut writer = stream.try_clone().expect("clone for writer");
    writer
        .write_all(
            b"INFO {\"server_id\":\"stub\",\"version\":\"2.10.16\",\"proto\":1,\"host\":\"0.0.0.0\",\"port\":4222,\"max_payload\":1048576,\"headers\":true}\r\n",
        )
        .expect("write info");

    let mut reader = BufReader::new(stream.try_clone().expect("clone for reader"));
    let mut line = String::new();
    reader.read_line(&mut line).expect("read connect line");
    line.clear();
    reader.read_line(&mut line).expect("read ping line");
    writer.write_all(b"PONG\r\n").expect("write pong");
    reader
}

/// One parsed client->server protocol line, enough of the wire grammar for
/// the scenarios in this file; anything else collapses to `Other`.
#[derive(Debug)]
pub enum WireFrame {
    Sub {
        subject: String,
        queue: Option<String>,
        sid: String,
    },
    Unsub {
        sid: String,
        max: Option<u64>,
    },
    Pub {
        subject: String,
        reply: Option<String>,
        payload: Vec<u8>,
    },
    Ping,
    Other(String),
}

pub fn read_frame(reader: &mut BufReader<TcpStream>) -> Option<WireFrame> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).ok()?;
    if n == 0 {
        return None;
    }
    let line = line.trim_end().to_string();
    let mut parts = line.split(' ');
    match parts.next()? {
        "PING" => Some(WireFrame::Ping),
        "SUB" => {
            let subject = parts.next()?.to_string();
            let rest: Vec<&str> = parts.collect();
            match rest.len() {
                1 => Some(WireFrame::Sub {
                    subject,
                    queue: None,
                    sid: rest[0].to_string(),
                }),
                2 => Some(WireFrame::Sub {
                    subject,
                    queue: Some(rest[0].to_string()),
                    sid: rest[1].to_string(),
                }),
                _ => None,
            }
        }
        "UNSUB" => {
            let sid = parts.next()?.to_string();
            let max = parts.next().and_then(|s| s.parse().ok());
            Some(WireFrame::Unsub { sid, max })
        }
        "PUB" => {
            let subject = parts.next()?.to_string();
            let rest: Vec<&str> = parts.collect();
            let (reply, size): (Option<String>, usize) = match rest.len() {
                1 => (None, rest[0].parse().ok()?),
                2 => (Some(rest[0].to_string()), rest[1].parse().ok()?),
                _ => return None,
            };
            let mut payload = vec![0u8; size];
            reader.read_exact(&mut payload).ok()?;
            let mut crlf = [0u8; 2];
            reader.read_exact(&mut crlf).ok()?;
            Some(WireFrame::Pub {
                subject,
                reply,
                payload,
            })
        }
        _ => Some(WireFrame::Other(line)),
    }
}

pub fn connect_to(server: &StubServer) -> Result<Arc<Connection>> {
    let (options, callbacks, event_loop) = OptionsBuilder::new()
        .url(server.url())
        .no_randomize(true)
        .build();
    Ok(Connection::connect(options, callbacks, event_loop)?)
}
