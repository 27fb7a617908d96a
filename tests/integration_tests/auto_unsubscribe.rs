// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    io::Write,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use nats_engine::Message;

use crate::integration_tests::common::{connect_to, read_frame, server_handshake, StubServer, WireFrame};

#[test]
fn auto_unsubscribe_stops_the_callback_at_the_configured_max() -> Result<()> {
    let server = StubServer::bind();
    let listener = server.listener.try_clone()?;
    let server_thread = std::thread::spawn(move || -> Result<()> {
        let (stream, _) = listener.accept()?;
        let mut reader = server_handshake(&stream);
        let mut writer = stream.try_clone()?;

        // Wait for the client's SUB before sending anything, then fire 10
        // MSG frames regardless of the UNSUB the client sends after 5.
        loop {
            match read_frame(&mut reader) {
                Some(WireFrame::Sub { .. }) => break,
                Some(WireFrame::Ping) => writer.write_all(b"PONG\r\n")?,
                Some(_) => continue,
                None => return Ok(()),
            }
        }
        for _ in 0..10 {
            writer.write_all(b"MSG t 1 1\r\nx\r\n")?;
        }
        // Drain whatever the client still has queued (the UNSUB line) so
        // the socket can close cleanly instead of resetting mid-write.
        let mut saw_unsub_error = false;
        loop {
            match read_frame(&mut reader) {
                Some(WireFrame::Unsub { .. }) => continue,
                Some(WireFrame::Other(line)) if line.starts_with("-ERR") => {
                    saw_unsub_error = true;
                }
                Some(WireFrame::Ping) => writer.write_all(b"PONG\r\n")?,
                Some(_) => continue,
                None => break,
            }
        }
        assert!(!saw_unsub_error, "server should never see an -ERR about UNSUB");
        Ok(())
    });

    let conn = connect_to(&server)?;
    let count = Arc::new(AtomicUsize::new(0));
    let count2 = Arc::clone(&count);
    let sub = conn.subscribe(
        "t",
        None,
        Some(Box::new(move |_msg: Message| {
            count2.fetch_add(1, Ordering::SeqCst);
        })),
        None,
    )?;
    conn.unsubscribe(&sub, 5)?;
    conn.flush(Duration::from_secs(1))?;

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while count.load(Ordering::SeqCst) < 5 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    // Give a slow consumer a moment to (incorrectly) process a 6th message
    // if the cap were not honored.
    std::thread::sleep(Duration::from_millis(50));

    assert_eq!(count.load(Ordering::SeqCst), 5);
    assert!(conn.stats().in_msgs >= 5);

    conn.close();
    server_thread.join().expect("server thread").map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}
