// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    io::Write,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use nats_engine::Message;

use crate::integration_tests::common::{connect_to, read_frame, server_handshake, StubServer, WireFrame};

#[test]
fn echoed_publish_reaches_the_subscriber() -> Result<()> {
    let server = StubServer::bind();
    let listener = server.listener.try_clone()?;
    std::thread::spawn(move || {
        let Ok((stream, _)) = listener.accept() else {
            return;
        };
        let mut reader = server_handshake(&stream);
        let mut writer = stream.try_clone().expect("writer clone");
        loop {
            match read_frame(&mut reader) {
                Some(WireFrame::Pub {
                    subject, payload, ..
                }) => {
                    let header = format!("MSG {subject} 1 {}\r\n", payload.len());
                    writer.write_all(header.as_bytes()).expect("write msg header");
                    writer.write_all(&payload).expect("write payload");
                    writer.write_all(b"\r\n").expect("write crlf");
                }
                Some(WireFrame::Ping) => writer.write_all(b"PONG\r\n").expect("write pong"),
                Some(_) => continue,
                None => return,
            }
        }
    });

    let conn = connect_to(&server)?;
    let received: Arc<Mutex<Option<(String, Vec<u8>)>>> = Arc::new(Mutex::new(None));
    let received2 = Arc::clone(&received);
    conn.subscribe(
        "foo",
        None,
        Some(Box::new(move |msg: Message| {
            *received2.lock().expect("lock") = Some((msg.subject, msg.data));
        })),
        None,
    )?;
    conn.flush(Duration::from_secs(1))?;
    conn.publish("foo", None, b"hello")?;

    let deadline = std::time::Instant::now() + Duration::from_secs(1);
    while received.lock().expect("lock").is_none() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    let got = received
        .lock()
        .expect("lock")
        .take()
        .expect("echoed message delivered within 1s");
    assert_eq!(got.0, "foo");
    assert_eq!(got.1, b"hello");

    conn.close();
    Ok(())
}
