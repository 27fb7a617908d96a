// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Component B: the incremental wire parser (§4.B).
//!
//! Modeled after the teacher's BHS state machine (`models/parse.rs`,
//! `state_machine/*_states.rs`): a small `enum` of states plus a `match`
//! advanced one byte at a time, so the parser can resume correctly no
//! matter how the underlying socket happens to chunk reads.
//!
//! The parser never blocks or touches the socket itself; it is fed bytes by
//! the connection core's reader loop and hands back a batch of
//! [`ParserEvent`]s, which is the same one-callback-per-frame contract as
//! §4.B's `on_msg`/`on_ok`/... description, expressed as return values
//! instead of trait-object callbacks (simpler to test in isolation).

use crate::{
    buffer::Buffer,
    error::{Error, ErrorKind},
};

const MAX_CONTROL_LINE: usize = 1024;
const MAX_INFO_LINE: usize = 32 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParserEvent {
    Msg {
        subject: String,
        sid: u64,
        reply: Option<String>,
        payload: Vec<u8>,
    },
    Ok,
    Err(String),
    Ping,
    Pong,
    AsyncInfo(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    OpPlusO,
    OpPlusOk,
    OpMinus,
    OpMinusE,
    OpMinusErr,
    MinusErrArg,
    OpM,
    OpMs,
    OpMsg,
    MsgArg,
    MsgPayload,
    MsgEnd,
    OpP,
    OpPi,
    OpPing,
    OpPo,
    OpPong,
    OpI,
    OpIn,
    OpInf,
    OpInfo,
    InfoArg,
}

#[derive(Debug, Clone)]
struct PendingMsg {
    subject: String,
    sid: u64,
    reply: Option<String>,
    size: usize,
}

/// Incremental line+payload tokenizer. One instance per connection,
/// recreated on every reconnect (it has no cross-socket state).
pub struct Parser {
    state: State,
    scratch: Buffer,
    pending_msg: Option<PendingMsg>,
    payload: Vec<u8>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self {
            state: State::Start,
            scratch: Buffer::with_capacity(256),
            pending_msg: None,
            payload: Vec::new(),
        }
    }

    /// Feed newly-read bytes and return every complete frame found. On a
    /// malformed token the parser returns a `ProtocolError` and must be
    /// discarded — per §4.B this is fatal for the current socket, not
    /// recoverable in place.
    pub fn parse(&mut self, bytes: &[u8]) -> Result<Vec<ParserEvent>, Error> {
        let mut events = Vec::new();
        for &b in bytes {
            if let Some(ev) = self.step(b)? {
                events.push(ev);
            }
        }
        Ok(events)
    }

    fn step(&mut self, b: u8) -> Result<Option<ParserEvent>, Error> {
        match self.state {
            State::Start => match b {
                b'+' => {
                    self.state = State::OpPlusO;
                    Ok(None)
                }
                b'-' => {
                    self.state = State::OpMinus;
                    Ok(None)
                }
                b'M' | b'm' => {
                    self.state = State::OpM;
                    Ok(None)
                }
                b'P' | b'p' => {
                    self.state = State::OpP;
                    Ok(None)
                }
                b'I' | b'i' => {
                    self.state = State::OpI;
                    Ok(None)
                }
                b'\r' | b'\n' => Ok(None),
                other => Err(protocol_err(format!("unexpected op start byte {other:#04x}"))),
            },

            State::OpPlusO => self.expect_byte(b, b'O', State::OpPlusOk),
            State::OpPlusOk => match b {
                b'K' | b'k' => Ok(None),
                b'\r' => Ok(None),
                b'\n' => {
                    self.state = State::Start;
                    Ok(Some(ParserEvent::Ok))
                }
                other => Err(protocol_err(format!("malformed +OK, got {other:#04x}"))),
            },

            State::OpMinus => self.expect_byte(b, b'E', State::OpMinusE),
            State::OpMinusE => self.expect_byte(b, b'R', State::OpMinusErr),
            State::OpMinusErr => match b {
                b'R' | b'r' => {
                    self.state = State::MinusErrArg;
                    self.scratch.clear();
                    Ok(None)
                }
                other => Err(protocol_err(format!("malformed -ERR, got {other:#04x}"))),
            },
            State::MinusErrArg => match b {
                b'\r' => Ok(None),
                b'\n' => {
                    let text = String::from_utf8_lossy(self.scratch.as_slice())
                        .trim_matches('\'')
                        .to_string();
                    self.scratch.clear();
                    self.state = State::Start;
                    Ok(Some(ParserEvent::Err(text)))
                }
                other => {
                    self.push_control_byte(other, MAX_CONTROL_LINE)?;
                    Ok(None)
                }
            },

            State::OpM => self.expect_byte_ci(b, b'S', State::OpMs),
            State::OpMs => self.expect_byte_ci(b, b'G', State::OpMsg),
            State::OpMsg => match b {
                b' ' | b'\t' => Ok(None),
                b'\r' | b'\n' => Err(protocol_err("MSG with no arguments")),
                other => {
                    self.state = State::MsgArg;
                    self.scratch.clear();
                    self.push_control_byte(other, MAX_CONTROL_LINE)?;
                    Ok(None)
                }
            },
            State::MsgArg => match b {
                b'\r' => Ok(None),
                b'\n' => {
                    let line = String::from_utf8_lossy(self.scratch.as_slice()).to_string();
                    self.scratch.clear();
                    let pending = parse_msg_args(&line)?;
                    self.payload = Vec::with_capacity(pending.size);
                    self.pending_msg = Some(pending);
                    self.state = if self
                        .pending_msg
                        .as_ref()
                        .map(|m| m.size == 0)
                        .unwrap_or(false)
                    {
                        State::MsgEnd
                    } else {
                        State::MsgPayload
                    };
                    Ok(None)
                }
                other => {
                    self.push_control_byte(other, MAX_CONTROL_LINE)?;
                    Ok(None)
                }
            },
            State::MsgPayload => {
                self.payload.push(b);
                let needed = self
                    .pending_msg
                    .as_ref()
                    .map(|m| m.size)
                    .unwrap_or_default();
                if self.payload.len() >= needed {
                    self.state = State::MsgEnd;
                }
                Ok(None)
            }
            State::MsgEnd => match b {
                b'\r' => Ok(None),
                b'\n' => {
                    self.state = State::Start;
                    let pending = self
                        .pending_msg
                        .take()
                        .ok_or_else(|| protocol_err("MSG end with no pending header"))?;
                    let payload = std::mem::take(&mut self.payload);
                    Ok(Some(ParserEvent::Msg {
                        subject: pending.subject,
                        sid: pending.sid,
                        reply: pending.reply,
                        payload,
                    }))
                }
                other => Err(protocol_err(format!(
                    "expected CRLF after MSG payload, got {other:#04x}"
                ))),
            },

            State::OpP => match b {
                b'I' | b'i' => {
                    self.state = State::OpPi;
                    Ok(None)
                }
                b'O' | b'o' => {
                    self.state = State::OpPo;
                    Ok(None)
                }
                other => Err(protocol_err(format!("malformed PING/PONG, got {other:#04x}"))),
            },
            State::OpPi => self.expect_byte_ci(b, b'N', State::OpPing),
            State::OpPing => match b {
                b'G' | b'g' => Ok(None),
                b'\r' => Ok(None),
                b'\n' => {
                    self.state = State::Start;
                    Ok(Some(ParserEvent::Ping))
                }
                other => Err(protocol_err(format!("malformed PING, got {other:#04x}"))),
            },
            State::OpPo => self.expect_byte_ci(b, b'N', State::OpPong),
            State::OpPong => match b {
                b'G' | b'g' => Ok(None),
                b'\r' => Ok(None),
                b'\n' => {
                    self.state = State::Start;
                    Ok(Some(ParserEvent::Pong))
                }
                other => Err(protocol_err(format!("malformed PONG, got {other:#04x}"))),
            },

            State::OpI => self.expect_byte_ci(b, b'N', State::OpIn),
            State::OpIn => self.expect_byte_ci(b, b'F', State::OpInf),
            State::OpInf => self.expect_byte_ci(b, b'O', State::OpInfo),
            State::OpInfo => match b {
                b' ' | b'\t' => Ok(None),
                other => {
                    self.state = State::InfoArg;
                    self.scratch.clear();
                    self.push_control_byte(other, MAX_INFO_LINE)?;
                    Ok(None)
                }
            },
            State::InfoArg => match b {
                b'\r' => Ok(None),
                b'\n' => {
                    let json = self.scratch.as_slice().to_vec();
                    self.scratch.clear();
                    self.state = State::Start;
                    Ok(Some(ParserEvent::AsyncInfo(json)))
                }
                other => {
                    self.push_control_byte(other, MAX_INFO_LINE)?;
                    Ok(None)
                }
            },
        }
    }

    fn expect_byte(&mut self, got: u8, want: u8, next: State) -> Result<Option<ParserEvent>, Error> {
        if got == want {
            self.state = next;
            Ok(None)
        } else {
            Err(protocol_err(format!(
                "expected {:#04x}, got {got:#04x}",
                want
            )))
        }
    }

    fn expect_byte_ci(
        &mut self,
        got: u8,
        want_upper: u8,
        next: State,
    ) -> Result<Option<ParserEvent>, Error> {
        if got.to_ascii_uppercase() == want_upper {
            self.state = next;
            Ok(None)
        } else {
            Err(protocol_err(format!(
                "expected {:#04x} (case-insensitive), got {got:#04x}",
                want_upper
            )))
        }
    }

    fn push_control_byte(&mut self, b: u8, limit: usize) -> Result<(), Error> {
        if self.scratch.len() >= limit {
            return Err(protocol_err("control line too long"));
        }
        self.scratch.append_byte(b);
        Ok(())
    }
}

fn parse_msg_args(line: &str) -> Result<PendingMsg, Error> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let (subject, sid, reply, size) = match tokens.as_slice() {
        [subject, sid, size] => (*subject, *sid, None, *size),
        [subject, sid, reply, size] => (*subject, *sid, Some(*reply), *size),
        _ => return Err(protocol_err(format!("malformed MSG arguments: '{line}'"))),
    };

    let sid = sid
        .parse::<u64>()
        .map_err(|_| protocol_err(format!("malformed MSG sid: '{sid}'")))?;
    let size = size
        .parse::<usize>()
        .map_err(|_| protocol_err(format!("malformed MSG size: '{size}'")))?;

    Ok(PendingMsg {
        subject: subject.to_string(),
        sid,
        reply: reply.map(str::to_string),
        size,
    })
}

fn protocol_err(detail: impl Into<String>) -> Error {
    Error::with_detail(ErrorKind::ProtocolError, detail.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ok_ping_pong() {
        let mut p = Parser::new();
        let events = p.parse(b"+OK\r\nPING\r\nPONG\r\n").expect("parse");
        assert_eq!(
            events,
            vec![ParserEvent::Ok, ParserEvent::Ping, ParserEvent::Pong]
        );
    }

    #[test]
    fn parses_err_with_quoted_text() {
        let mut p = Parser::new();
        let events = p
            .parse(b"-ERR 'Authorization Violation'\r\n")
            .expect("parse");
        assert_eq!(
            events,
            vec![ParserEvent::Err("Authorization Violation".to_string())]
        );
    }

    #[test]
    fn parses_msg_without_reply() {
        let mut p = Parser::new();
        let events = p.parse(b"MSG foo 1 5\r\nhello\r\n").expect("parse");
        assert_eq!(
            events,
            vec![ParserEvent::Msg {
                subject: "foo".to_string(),
                sid: 1,
                reply: None,
                payload: b"hello".to_vec(),
            }]
        );
    }

    #[test]
    fn parses_msg_with_reply() {
        let mut p = Parser::new();
        let events = p
            .parse(b"MSG foo.bar 42 INBOX.reply 3\r\nabc\r\n")
            .expect("parse");
        assert_eq!(
            events,
            vec![ParserEvent::Msg {
                subject: "foo.bar".to_string(),
                sid: 42,
                reply: Some("INBOX.reply".to_string()),
                payload: b"abc".to_vec(),
            }]
        );
    }

    #[test]
    fn parses_msg_split_across_multiple_feeds() {
        let mut p = Parser::new();
        let mut events = p.parse(b"MS").expect("parse");
        events.extend(p.parse(b"G foo 1 5\r\nhel").expect("parse"));
        events.extend(p.parse(b"lo\r\n").expect("parse"));
        assert_eq!(
            events,
            vec![ParserEvent::Msg {
                subject: "foo".to_string(),
                sid: 1,
                reply: None,
                payload: b"hello".to_vec(),
            }]
        );
    }

    #[test]
    fn parses_zero_length_payload() {
        let mut p = Parser::new();
        let events = p.parse(b"MSG foo 1 0\r\n\r\n").expect("parse");
        assert_eq!(
            events,
            vec![ParserEvent::Msg {
                subject: "foo".to_string(),
                sid: 1,
                reply: None,
                payload: Vec::new(),
            }]
        );
    }

    #[test]
    fn parses_async_info() {
        let mut p = Parser::new();
        let events = p.parse(b"INFO {\"server_id\":\"x\"}\r\n").expect("parse");
        assert_eq!(
            events,
            vec![ParserEvent::AsyncInfo(b"{\"server_id\":\"x\"}".to_vec())]
        );
    }

    #[test]
    fn malformed_token_is_a_protocol_error() {
        let mut p = Parser::new();
        let err = p.parse(b"XYZ\r\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
    }

    #[test]
    fn control_line_over_limit_is_rejected() {
        let mut p = Parser::new();
        let long = vec![b'x'; MAX_CONTROL_LINE + 1];
        let mut frame = b"-ERR ".to_vec();
        frame.extend_from_slice(&long);
        let err = p.parse(&frame).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
    }
}
