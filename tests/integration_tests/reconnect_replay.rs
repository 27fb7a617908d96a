// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    io::Write,
    net::TcpListener,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use nats_engine::{Connection, Message, OptionsBuilder};

use crate::integration_tests::common::{read_frame, server_handshake, WireFrame};

#[test]
fn reconnect_replays_subscriptions_before_buffered_publishes() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let url = format!("nats://127.0.0.1:{port}");

    let wire_order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let wire_order2 = Arc::clone(&wire_order);
    let listener2 = listener.try_clone()?;
    let server_thread = std::thread::spawn(move || -> Result<()> {
        // First connection: record the initial SUB, then drop the socket
        // to simulate the server dying mid-session.
        let (stream, _) = listener2.accept().context("first accept")?;
        let mut reader = server_handshake(&stream);
        loop {
            match read_frame(&mut reader) {
                Some(WireFrame::Sub { .. }) => break,
                Some(WireFrame::Ping) => {
                    stream.try_clone()?.write_all(b"PONG\r\n")?;
                }
                Some(_) => continue,
                None => return Ok(()),
            }
        }
        drop(stream);

        // Second connection: the reconnect. Record replay order, then
        // deliver one MSG once all 3 buffered publishes have arrived.
        let (stream, _) = listener2.accept().context("second accept")?;
        let mut reader = server_handshake(&stream);
        let mut writer = stream.try_clone()?;
        let mut sub_sid = "1".to_string();
        let mut pubs_seen = 0;
        loop {
            match read_frame(&mut reader) {
                Some(WireFrame::Sub { subject, sid, .. }) => {
                    sub_sid = sid.clone();
                    wire_order2.lock().expect("lock").push(format!("SUB {subject} {sid}"));
                }
                Some(WireFrame::Pub {
                    subject, payload, ..
                }) => {
                    wire_order2
                        .lock()
                        .expect("lock")
                        .push(format!("PUB {subject} {}", payload.len()));
                    pubs_seen += 1;
                    if pubs_seen == 3 {
                        writer.write_all(format!("MSG a {sub_sid} 5\r\n").as_bytes())?;
                        writer.write_all(b"hello")?;
                        writer.write_all(b"\r\n")?;
                    }
                }
                Some(WireFrame::Ping) => writer.write_all(b"PONG\r\n")?,
                Some(_) => continue,
                None => return Ok(()),
            }
        }
    });

    let reconnected = Arc::new(Mutex::new(false));
    let reconnected2 = Arc::clone(&reconnected);
    let (options, callbacks, event_loop) = OptionsBuilder::new()
        .url(url)
        .no_randomize(true)
        .reconnect_wait(Duration::from_millis(20))
        .on_reconnected(Box::new(move |_conn| {
            *reconnected2.lock().expect("lock") = true;
        }))
        .build();
    let conn = Connection::connect(options, callbacks, event_loop)?;

    let received: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let received2 = Arc::clone(&received);
    conn.subscribe(
        "a",
        None,
        Some(Box::new(move |msg: Message| {
            *received2.lock().expect("lock") = Some(msg.data);
        })),
        None,
    )?;
    // Best-effort: gives the SUB a chance to reach the server before it
    // gets killed. The server's own kill trigger is "saw one SUB frame",
    // so this is not required for correctness, only to avoid the publishes
    // below racing ahead of the subscribe on the first (doomed) socket.
    let _ = conn.flush(Duration::from_millis(500));

    conn.publish("a", None, b"one")?;
    conn.publish("a", None, b"two")?;
    conn.publish("a", None, b"three")?;

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !*reconnected.lock().expect("lock") && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(*reconnected.lock().expect("lock"), "reconnected callback did not fire");

    while received.lock().expect("lock").is_none() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(
        received.lock().expect("lock").take().expect("message delivered after reconnect"),
        b"hello"
    );

    conn.close();
    let order = wire_order.lock().expect("lock").clone();
    assert!(order[0].starts_with("SUB a"), "replay order was {order:?}");
    assert_eq!(&order[1..], &["PUB a 3", "PUB a 3", "PUB a 5"]);

    // Drop the client's socket so the server thread observes EOF and can
    // join instead of blocking on another read forever.
    drop(conn);
    server_thread.join().expect("server thread").context("server thread")?;
    Ok(())
}
