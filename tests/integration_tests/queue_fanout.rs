// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    io::Write,
    net::TcpStream,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use nats_engine::Message;

use crate::integration_tests::common::{connect_to, read_frame, server_handshake, StubServer, WireFrame};

struct Subscriber {
    sid: String,
    queue: Option<String>,
    writer: TcpStream,
}

#[derive(Default)]
struct Registry {
    subs: Vec<Subscriber>,
    next_queue_pick: usize,
}

/// Minimal broker behavior needed by this scenario: deliver each published
/// payload to exactly one queue-group member, round-robin.
fn deliver(registry: &Arc<Mutex<Registry>>, subject: &str, payload: &[u8]) {
    let mut reg = registry.lock().expect("lock");
    let matching: Vec<usize> = reg
        .subs
        .iter()
        .enumerate()
        .filter(|(_, s)| s.queue.is_some())
        .map(|(i, _)| i)
        .collect();
    if matching.is_empty() {
        return;
    }
    let pick = matching[reg.next_queue_pick % matching.len()];
    reg.next_queue_pick += 1;
    let header = format!("MSG {subject} {} {}\r\n", reg.subs[pick].sid, payload.len());
    let mut writer = reg.subs[pick].writer.try_clone().expect("writer clone");
    drop(reg);
    writer.write_all(header.as_bytes()).expect("write header");
    writer.write_all(payload).expect("write payload");
    writer.write_all(b"\r\n").expect("write crlf");
}

fn handle_connection(stream: TcpStream, registry: Arc<Mutex<Registry>>) {
    let mut reader = server_handshake(&stream);
    loop {
        match read_frame(&mut reader) {
            Some(WireFrame::Sub { queue, sid, .. }) => {
                let writer = stream.try_clone().expect("writer clone");
                registry.lock().expect("lock").subs.push(Subscriber { sid, queue, writer });
            }
            Some(WireFrame::Pub {
                subject, payload, ..
            }) => deliver(&registry, &subject, &payload),
            Some(WireFrame::Ping) => {
                let mut w = stream.try_clone().expect("writer clone");
                w.write_all(b"PONG\r\n").expect("write pong");
            }
            Some(_) => continue,
            None => return,
        }
    }
}

#[test]
fn queue_group_delivers_each_payload_exactly_once() -> Result<()> {
    const TOTAL: usize = 100;

    let server = StubServer::bind();
    let registry: Arc<Mutex<Registry>> = Arc::new(Mutex::new(Registry::default()));
    let listener = server.listener.try_clone()?;
    let registry2 = Arc::clone(&registry);
    let acceptor = std::thread::spawn(move || {
        for _ in 0..3 {
            let Ok((stream, _)) = listener.accept() else {
                return;
            };
            let registry3 = Arc::clone(&registry2);
            std::thread::spawn(move || handle_connection(stream, registry3));
        }
    });

    let sub_a = connect_to(&server)?;
    let sub_b = connect_to(&server)?;

    let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_a = Arc::clone(&seen);
    sub_a.subscribe(
        "jobs",
        Some("workers"),
        Some(Box::new(move |msg: Message| {
            seen_a.lock().expect("lock").push(msg.data);
        })),
        None,
    )?;
    let seen_b = Arc::clone(&seen);
    sub_b.subscribe(
        "jobs",
        Some("workers"),
        Some(Box::new(move |msg: Message| {
            seen_b.lock().expect("lock").push(msg.data);
        })),
        None,
    )?;
    sub_a.flush(Duration::from_secs(1))?;
    sub_b.flush(Duration::from_secs(1))?;

    let publisher = connect_to(&server)?;
    for i in 0..TOTAL {
        publisher.publish("jobs", None, i.to_string().as_bytes())?;
    }
    publisher.flush(Duration::from_secs(1))?;

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while seen.lock().expect("lock").len() < TOTAL && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }

    let mut got: Vec<usize> = seen
        .lock()
        .expect("lock")
        .iter()
        .map(|b| String::from_utf8(b.clone()).expect("utf8").parse().expect("number"))
        .collect();
    got.sort_unstable();
    assert_eq!(got, (0..TOTAL).collect::<Vec<_>>());

    sub_a.close();
    sub_b.close();
    publisher.close();
    let _ = acceptor.join();
    Ok(())
}
