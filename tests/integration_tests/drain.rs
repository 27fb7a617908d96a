// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    io::Write,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use nats_engine::{Connection, Message, OptionsBuilder, Status};

use crate::integration_tests::common::{read_frame, server_handshake, StubServer, WireFrame};

#[test]
fn drain_flushes_every_queued_message_before_closing() -> Result<()> {
    let server = StubServer::bind();
    let first_frame: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let first_frame2 = Arc::clone(&first_frame);
    let listener = server.listener.try_clone()?;
    std::thread::spawn(move || {
        let Ok((stream, _)) = listener.accept() else {
            return;
        };
        let mut reader = server_handshake(&stream);
        let mut writer = stream.try_clone().expect("writer clone");
        loop {
            match read_frame(&mut reader) {
                Some(WireFrame::Unsub { sid, .. }) => {
                    let mut f = first_frame2.lock().expect("lock");
                    if f.is_none() {
                        *f = Some(format!("UNSUB {sid}"));
                    }
                }
                Some(WireFrame::Ping) => writer.write_all(b"PONG\r\n").expect("write pong"),
                Some(_) => continue,
                None => return,
            }
        }
    });

    let count = Arc::new(Mutex::new(0usize));
    let closed = Arc::new(Mutex::new(false));
    let delivered_at_close = Arc::new(Mutex::new(0usize));
    let after_close = Arc::new(Mutex::new(false));

    let closed_for_cb = Arc::clone(&closed);
    let count_for_cb = Arc::clone(&count);
    let delivered_at_close_for_cb = Arc::clone(&delivered_at_close);
    let (options, callbacks, event_loop) = OptionsBuilder::new()
        .url(server.url())
        .no_randomize(true)
        .on_closed(Box::new(move |_conn| {
            *delivered_at_close_for_cb.lock().expect("lock") = *count_for_cb.lock().expect("lock");
            *closed_for_cb.lock().expect("lock") = true;
        }))
        .build();
    let conn = Connection::connect(options, callbacks, event_loop)?;

    let count_for_sub = Arc::clone(&count);
    let closed_for_sub = Arc::clone(&closed);
    let after_close_for_sub = Arc::clone(&after_close);
    let sub = conn.subscribe(
        "q",
        None,
        Some(Box::new(move |_msg: Message| {
            *count_for_sub.lock().expect("lock") += 1;
            if *closed_for_sub.lock().expect("lock") {
                *after_close_for_sub.lock().expect("lock") = true;
            }
        })),
        None,
    )?;
    conn.flush(Duration::from_secs(1))?;

    // Inject 50 messages straight into the subscription's own queue,
    // bypassing the wire entirely, per §8 scenario 6's "inject via test
    // hook" (the hook is `Subscription::enqueue` itself, already public).
    for i in 0..50u8 {
        sub.enqueue(Message::new("q", sub.sid, vec![i]));
    }

    conn.drain(Duration::from_secs(2))?;

    assert_eq!(*count.lock().expect("lock"), 50);
    assert_eq!(*delivered_at_close.lock().expect("lock"), 50);
    assert!(*closed.lock().expect("lock"));
    assert!(!*after_close.lock().expect("lock"), "a callback ran after closed fired");
    assert_eq!(conn.status(), Status::Closed);
    assert_eq!(first_frame.lock().expect("lock").as_deref(), Some("UNSUB 1"));

    Ok(())
}
