// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::{Duration, Instant};

use anyhow::Result;
use nats_engine::ErrorKind;

use crate::integration_tests::common::{connect_to, server_handshake, StubServer};

#[test]
fn flush_times_out_when_the_server_never_answers_ping() -> Result<()> {
    let server = StubServer::bind();
    let listener = server.listener.try_clone()?;
    std::thread::spawn(move || {
        let Ok((stream, _)) = listener.accept() else {
            return;
        };
        // Complete the handshake, then go silent forever: no PONG for any
        // PING the client sends afterward.
        let _reader = server_handshake(&stream);
        loop {
            std::thread::sleep(Duration::from_secs(1));
        }
    });

    let conn = connect_to(&server)?;
    let start = Instant::now();
    let result = conn.flush(Duration::from_millis(100));
    let elapsed = start.elapsed();

    let err = result.expect_err("flush must time out");
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(
        elapsed >= Duration::from_millis(100) && elapsed <= Duration::from_millis(150),
        "flush took {elapsed:?}, expected 100-150ms"
    );

    conn.close();
    Ok(())
}
