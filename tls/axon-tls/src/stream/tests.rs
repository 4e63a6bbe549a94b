// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    config::Config,
    engine::{
        testing::{Op, ScriptedEngine},
        HandshakeStatus, Status, MAX_RECORD_OVERHEAD,
    },
    frame::{self, Frame},
    route::{Role, Route},
    stream::id::Id,
    testing::{
        empty_store, provision_stores, scripted_accept, OwnedFrame, ServerHarness, TestEnv,
        ACCEPT_ID, NET_ROUTE_ID,
    },
    worker::Worker,
};
use std::sync::{atomic::Ordering, Arc};

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|index| (index * 31 % 251) as u8).collect()
}

fn worker() -> Worker<TestEnv> {
    Worker::new(Config::new("/nonexistent"), TestEnv::new())
}

fn insert_route(worker: &Worker<TestEnv>, route_id: u64, hostname: Option<&str>) {
    let registry = worker.registry();
    let mut registry = registry.write();
    assert!(registry.routes.insert(Route {
        route_id,
        role: Role::Server,
        local_address: "net#0".to_string(),
        remote_address: "app#0".to_string(),
        authorization: 0,
        store: None,
        hostname: hostname.map(str::to_string),
        application_protocol: None,
        context: Arc::new(empty_store()),
    }));
}

fn data(stream: u64, payload: &[u8]) -> Frame<'_> {
    Frame::Data(frame::Data {
        stream_id: Id::new(stream),
        trace_id: 0,
        group_id: 0,
        padding: 0,
        payload,
    })
}

fn signal(stream: u64) -> Frame<'static> {
    Frame::Signal(frame::Signal {
        stream_id: Id::new(stream),
        trace_id: 0,
        signal_id: frame::signal::FLUSH_HANDSHAKE,
    })
}

// ---- end-to-end scenarios over a real rustls client ----

#[test]
fn connection_established_no_payload() {
    let mut harness = ServerHarness::new(None, None, "localhost", &[]);
    harness.handshake();

    assert!(!harness.accept_reset);
    let (hostname, protocol) = harness.app_ext.clone().expect("application BEGIN");
    assert_eq!(hostname.as_deref(), Some("localhost"));
    assert_eq!(protocol, None);
    assert!(harness.app_data.is_empty());

    harness.client_close();
    assert!(harness.app_end);
    // the application reply never opened, so the network reply ends too
    assert!(harness.reply_end);
    assert!(harness.worker.correlations.is_empty());

    let (acquires, releases) = harness.slot_balance();
    assert_eq!(acquires, releases);
}

#[test]
fn echo_10k() {
    let mut harness = ServerHarness::new(None, None, "localhost", &[]);
    harness.handshake();
    harness.open_app_reply();

    // padding toward the application reserves one record of overhead
    assert_eq!(harness.app_reply_padding, MAX_RECORD_OVERHEAD as u32);

    let message = payload(10_240);
    harness.client_write(&message);
    assert_eq!(harness.app_data, message);

    harness.app_write(&message);
    assert_eq!(harness.client_data, message);

    harness.client_close();
    harness.app_end_reply();
    assert!(harness.client_closed);

    let (acquires, releases) = harness.slot_balance();
    assert_eq!(acquires, releases);
    assert!(harness.worker.correlations.is_empty());
}

#[test]
fn echo_1000k_with_backpressure() {
    let mut harness = ServerHarness::new(None, None, "localhost", &[]);
    harness.app_window_step = Some(8 * 1024);
    harness.handshake();
    harness.open_app_reply();

    let message = payload(1_024_000);
    harness.client_write(&message);
    assert_eq!(harness.app_data.len(), message.len());
    assert_eq!(harness.app_data, message);

    harness.app_write(&message);
    assert_eq!(harness.client_data.len(), message.len());
    assert_eq!(harness.client_data, message);

    // the reply budget never went negative: every emitted ciphertext byte
    // stayed within granted credit
    assert!(harness.reply_consumed <= harness.reply_granted);
}

#[test]
fn server_write_close_sends_close_notify() {
    let mut harness = ServerHarness::new(None, None, "localhost", &[]);
    harness.handshake();
    harness.open_app_reply();

    harness.app_write(b"goodbye");
    harness.app_end_reply();

    assert_eq!(harness.client_data, b"goodbye");
    // close_notify reached the client before the transport END
    assert!(harness.client_closed);
    assert!(harness.reply_end);
    assert!(harness.worker.correlations.is_empty());
}

#[test]
fn client_abort_releases_everything() {
    let mut harness = ServerHarness::new(None, None, "localhost", &[]);
    harness.handshake();
    harness.open_app_reply();

    harness.client_write(b"partial");
    harness.client_abort();

    assert!(harness.app_abort);
    let (acquires, releases) = harness.slot_balance();
    assert_eq!(acquires, releases);
}

#[test]
fn alpn_mismatch_rejects_handshake() {
    let mut harness = ServerHarness::new(None, Some("http/1.1"), "localhost", &[&b"h2"[..]]);
    harness.begin();
    for _ in 0..64 {
        harness.pump();
        if harness.accept_reset {
            break;
        }
    }

    assert!(harness.accept_reset);
    assert!(harness.reply_abort);
    assert!(harness.app_id.is_none());
}

#[test]
fn alpn_match_negotiates() {
    let mut harness =
        ServerHarness::new(None, Some("h2"), "localhost", &[&b"h2"[..], &b"http/1.1"[..]]);
    harness.handshake();

    let (_, protocol) = harness.app_ext.clone().expect("application BEGIN");
    assert_eq!(protocol.as_deref(), Some("h2"));
    assert_eq!(harness.client.alpn_protocol(), Some(&b"h2"[..]));
}

#[test]
fn hostname_mismatch_rejects_handshake() {
    let mut harness = ServerHarness::new(Some("example.net"), None, "localhost", &[]);
    harness.begin();
    for _ in 0..64 {
        harness.pump();
        if harness.accept_reset {
            break;
        }
    }

    assert!(harness.accept_reset);
    assert!(harness.reply_abort);
}

#[test]
fn sni_selects_the_matching_route() {
    let mut harness = ServerHarness::new(Some("example.net"), None, "example.net", &[]);
    harness.handshake();

    let (hostname, _) = harness.app_ext.clone().expect("application BEGIN");
    assert_eq!(hostname.as_deref(), Some("example.net"));
}

// ---- coordinator behavior over the scripted engine ----

#[test]
fn delegated_tasks_park_the_engine() {
    let mut worker = worker();
    let engine = ScriptedEngine::new(HandshakeStatus::NeedUnwrap)
        .op(Op::Unwrap {
            consume: 5,
            produce: 0,
            status: Status::Ok,
            handshake: HandshakeStatus::NeedTask,
        })
        .tasks(2)
        .after_tasks(HandshakeStatus::NeedUnwrap);
    let outstanding = engine.outstanding();
    scripted_accept(&mut worker, ACCEPT_ID, engine);

    worker.dispatch(&data(ACCEPT_ID, &[0u8; 5]));
    assert_eq!(worker.env.tasks.len(), 2);
    assert_eq!(outstanding.load(Ordering::SeqCst), 2);

    // while parked, more data stages without touching the engine
    worker.dispatch(&data(ACCEPT_ID, &[0u8; 5]));
    assert_eq!(
        worker.accepts.get(&ACCEPT_ID).unwrap().network_slot_offset,
        5
    );

    let completed = worker.env.run_tasks();
    assert_eq!(completed.len(), 2);
    assert_eq!(outstanding.load(Ordering::SeqCst), 0);

    worker.dispatch(&signal(ACCEPT_ID));
    worker.dispatch(&signal(ACCEPT_ID));

    // resumed: the staged bytes reached the engine and the residue stalled
    assert!(worker.accepts.contains_key(&ACCEPT_ID));
}

#[test]
fn handshake_wrap_waits_for_reply_credit() {
    let mut worker = worker();
    let engine = ScriptedEngine::new(HandshakeStatus::NeedWrap).op(Op::Wrap {
        produce: 300,
        status: Status::Ok,
        handshake: HandshakeStatus::NeedUnwrap,
    });
    scripted_accept(&mut worker, ACCEPT_ID, engine);
    let reply_id = Id::new(ACCEPT_ID).reply();

    // credit below the claimed padding cannot flush anything
    worker.dispatch(&Frame::Window(frame::Window {
        stream_id: reply_id,
        trace_id: 0,
        credit: 5,
        padding: 10,
        group_id: 0,
    }));
    assert!(worker.env.take_frames().is_empty());

    worker.dispatch(&Frame::Window(frame::Window {
        stream_id: reply_id,
        trace_id: 0,
        credit: 1000,
        padding: 10,
        group_id: 0,
    }));

    let frames = worker.env.take_frames();
    let [OwnedFrame::Data { stream_id, padding, payload }] = &frames[..] else {
        panic!("expected one ciphertext frame, got {frames:?}");
    };
    assert_eq!(*stream_id, reply_id);
    assert_eq!(*padding, 10);
    assert_eq!(payload.len(), 300);
}

#[test]
fn full_slot_underflow_is_fatal() {
    let mut worker = worker();
    // the default script never consumes: a record larger than the slot
    let engine = ScriptedEngine::new(HandshakeStatus::NeedUnwrap);
    scripted_accept(&mut worker, ACCEPT_ID, engine);

    let capacity = worker.config.slot_capacity;
    worker.dispatch(&data(ACCEPT_ID, &payload(capacity)));

    let frames = worker.env.take_frames();
    assert!(frames.contains(&OwnedFrame::Reset {
        stream_id: Id::new(ACCEPT_ID)
    }));
    assert!(frames.contains(&OwnedFrame::Abort {
        stream_id: Id::new(ACCEPT_ID).reply()
    }));
    assert!(worker.accepts.is_empty());
    assert!(worker.engines.is_empty());

    let counters = worker.counters();
    assert_eq!(
        counters.counter("server.network.acquires").count(),
        counters.counter("server.network.releases").count()
    );
}

#[test]
fn budget_overrun_resets_the_stream() {
    let mut worker = worker();
    let engine = ScriptedEngine::new(HandshakeStatus::NeedUnwrap);
    scripted_accept(&mut worker, ACCEPT_ID, engine);

    let over = worker.config.handshake_window_bytes + 1;
    worker.dispatch(&data(ACCEPT_ID, &payload(over)));

    let frames = worker.env.take_frames();
    assert!(frames.contains(&OwnedFrame::Reset {
        stream_id: Id::new(ACCEPT_ID)
    }));
    assert!(worker.accepts.is_empty());
}

#[test]
fn finished_without_application_route_resets() {
    let mut worker = worker();
    let engine = ScriptedEngine::new(HandshakeStatus::NeedUnwrap)
        .op(Op::Unwrap {
            consume: 1,
            produce: 0,
            status: Status::Ok,
            handshake: HandshakeStatus::Finished,
        })
        .sni("nowhere.example");
    scripted_accept(&mut worker, ACCEPT_ID, engine);

    worker.dispatch(&data(ACCEPT_ID, &[0u8; 1]));

    let frames = worker.env.take_frames();
    assert!(frames.contains(&OwnedFrame::Reset {
        stream_id: Id::new(ACCEPT_ID)
    }));
    assert!(frames.contains(&OwnedFrame::Abort {
        stream_id: Id::new(ACCEPT_ID).reply()
    }));
    assert!(worker.correlations.is_empty());
}

#[test]
fn finished_parks_the_handshake_for_the_reply() {
    let mut worker = worker();
    insert_route(&worker, NET_ROUTE_ID, None);
    let engine = ScriptedEngine::new(HandshakeStatus::NeedUnwrap)
        .op(Op::Unwrap {
            consume: 1,
            produce: 0,
            status: Status::Ok,
            handshake: HandshakeStatus::Finished,
        })
        .sni("localhost");
    scripted_accept(&mut worker, ACCEPT_ID, engine);

    worker.dispatch(&data(ACCEPT_ID, &[0u8; 1]));

    let frames = worker.env.take_frames();
    let begin = frames.iter().find_map(|frame| match frame {
        OwnedFrame::Begin {
            stream_id,
            correlation_id,
            ..
        } if !stream_id.is_reply() => Some((*stream_id, *correlation_id)),
        _ => None,
    });
    let (app_id, correlation_id) = begin.expect("application BEGIN");
    assert!(worker.correlations.contains(correlation_id));

    // the application answers: the handshake moves into a reply connection
    let app_reply = Id::new(0x7000).reply();
    worker.dispatch(&Frame::Begin(frame::Begin {
        stream_id: app_reply,
        route_id: NET_ROUTE_ID,
        trace_id: 0,
        authorization: 0,
        correlation_id,
        extension: &[],
    }));
    assert!(worker.correlations.is_empty());
    assert!(worker.replies.contains_key(&app_reply.as_u64()));

    // a second BEGIN for the same correlation is rejected idempotently
    let duplicate = Id::new(0x7001).reply();
    worker.dispatch(&Frame::Begin(frame::Begin {
        stream_id: duplicate,
        route_id: NET_ROUTE_ID,
        trace_id: 0,
        authorization: 0,
        correlation_id,
        extension: &[],
    }));
    assert!(worker.env.take_frames().contains(&OwnedFrame::Reset {
        stream_id: duplicate
    }));

    let _ = app_id;
}

#[test]
fn reply_reset_sweeps_the_parked_handshake() {
    let mut worker = worker();
    insert_route(&worker, NET_ROUTE_ID, None);
    let engine = ScriptedEngine::new(HandshakeStatus::NeedUnwrap).op(Op::Unwrap {
        consume: 1,
        produce: 0,
        status: Status::Ok,
        handshake: HandshakeStatus::Finished,
    });
    scripted_accept(&mut worker, ACCEPT_ID, engine);
    worker.dispatch(&data(ACCEPT_ID, &[0u8; 1]));
    worker.env.take_frames();

    worker.dispatch(&Frame::Reset(frame::Reset {
        stream_id: Id::new(ACCEPT_ID).reply(),
        trace_id: 0,
    }));

    assert!(worker.correlations.is_empty());
    assert!(worker.accepts.is_empty());
    assert!(worker.engines.is_empty());
}

#[test]
fn end_during_handshake_cancels_and_aborts() {
    let mut worker = worker();
    let engine = ScriptedEngine::new(HandshakeStatus::NeedUnwrap)
        .op(Op::Unwrap {
            consume: 5,
            produce: 0,
            status: Status::Ok,
            handshake: HandshakeStatus::NeedTask,
        })
        .tasks(1);
    scripted_accept(&mut worker, ACCEPT_ID, engine);

    worker.dispatch(&data(ACCEPT_ID, &[0u8; 5]));
    worker.env.take_frames();

    worker.dispatch(&Frame::End(frame::End {
        stream_id: Id::new(ACCEPT_ID),
        trace_id: 0,
    }));

    let frames = worker.env.take_frames();
    assert!(frames.contains(&OwnedFrame::Abort {
        stream_id: Id::new(ACCEPT_ID).reply()
    }));
    assert!(worker.accepts.is_empty());
    assert!(worker.engines.is_empty());

    // the pending task was cancelled: running the queue does nothing
    let (_, _, cancel) = &worker.env.tasks[0];
    assert!(cancel.is_cancelled());
}

#[test]
fn frozen_worker_rejects_new_streams() {
    let stores = provision_stores("freeze");
    let mut worker = Worker::new(Config::new(&stores.dir), TestEnv::new());
    assert!(worker.handle_route(crate::control::RouteCommand {
        route_id: NET_ROUTE_ID,
        role: Role::Server,
        local_address: "net#0".to_string(),
        remote_address: "app#0".to_string(),
        authorization: 0,
        store: None,
        hostname: None,
        application_protocol: None,
    }));

    worker.handle_freeze();
    worker.dispatch(&Frame::Begin(frame::Begin {
        stream_id: Id::new(9),
        route_id: NET_ROUTE_ID,
        trace_id: 0,
        authorization: 0,
        correlation_id: 1,
        extension: &[],
    }));

    assert!(worker
        .env
        .take_frames()
        .contains(&OwnedFrame::Reset { stream_id: Id::new(9) }));
    assert!(worker.accepts.is_empty());
}

// ---- client role against a real rustls server peer ----

struct NetPeer {
    server: rustls::ServerConnection,
    net_out: Id,
    net_in: Id,
    /// Credit the worker granted us on the reply stream
    credit: i64,
    pending: Vec<u8>,
    received: Vec<u8>,
    end_seen: bool,
}

struct AppPeer {
    app_in: Id,
    app_out: Option<Id>,
    credit: i64,
    padding: u32,
    out_granted: bool,
    received: Vec<u8>,
    end_seen: bool,
}

fn drive_client(worker: &mut Worker<TestEnv>, net: &mut NetPeer, app: &mut AppPeer) {
    for _ in 0..256 {
        let frames = worker.env.take_frames();
        let mut progress = !frames.is_empty();

        for frame in frames {
            match frame {
                OwnedFrame::Data { stream_id, payload, .. } if stream_id == net.net_out => {
                    let mut reader = &payload[..];
                    while !reader.is_empty() {
                        net.server.read_tls(&mut reader).expect("server read");
                        net.server.process_new_packets().expect("server process");
                        let mut plaintext = [0u8; 4096];
                        loop {
                            use std::io::Read as _;
                            match net.server.reader().read(&mut plaintext) {
                                Ok(0) => break,
                                Ok(len) => net.received.extend_from_slice(&plaintext[..len]),
                                Err(error)
                                    if error.kind() == std::io::ErrorKind::WouldBlock =>
                                {
                                    break
                                }
                                Err(error) => panic!("server plaintext: {error}"),
                            }
                        }
                    }
                }
                OwnedFrame::Window { stream_id, credit, .. } if stream_id == net.net_in => {
                    net.credit += credit as i64;
                }
                OwnedFrame::End { stream_id } if stream_id == net.net_out => {
                    net.end_seen = true;
                }
                OwnedFrame::Begin { stream_id, .. } if stream_id == app.app_in.reply() => {
                    app.app_out = Some(stream_id);
                }
                OwnedFrame::Window { stream_id, credit, padding }
                    if stream_id == app.app_in =>
                {
                    app.credit += credit as i64;
                    app.padding = padding;
                }
                OwnedFrame::Data { stream_id, payload, .. }
                    if Some(stream_id) == app.app_out =>
                {
                    app.received.extend_from_slice(&payload);
                }
                OwnedFrame::End { stream_id } if Some(stream_id) == app.app_out => {
                    app.end_seen = true;
                }
                _ => {}
            }
        }

        // the application grants its reply window once the stream exists
        if let (Some(app_out), false) = (app.app_out, app.out_granted) {
            app.out_granted = true;
            worker.dispatch(&Frame::Window(frame::Window {
                stream_id: app_out,
                trace_id: 0,
                credit: 1 << 20,
                padding: 0,
                group_id: 0,
            }));
            progress = true;
        }

        // server handshake/application bytes flow back within credit
        loop {
            use std::io::Write as _;
            if !net.server.wants_write() {
                break;
            }
            if net.server.write_tls(&mut net.pending).expect("server write") == 0 {
                break;
            }
        }
        while !net.pending.is_empty() && net.credit > 0 {
            let len = net.pending.len().min(net.credit as usize);
            net.credit -= len as i64;
            let chunk: Vec<u8> = net.pending.drain(..len).collect();
            worker.dispatch(&data(net.net_in.as_u64(), &chunk));
            progress = true;
        }

        if !progress {
            return;
        }
    }
    panic!("client drive did not converge");
}

#[test]
fn client_role_round_trip() {
    let stores = provision_stores("client");
    let mut worker = Worker::new(Config::new(&stores.dir), TestEnv::new());
    assert!(worker.handle_route(crate::control::RouteCommand {
        route_id: 0x33,
        role: Role::Client,
        local_address: "app#0".to_string(),
        remote_address: "localhost:443".to_string(),
        authorization: 0,
        store: None,
        hostname: Some("localhost".to_string()),
        application_protocol: None,
    }));

    let key = rustls::pki_types::PrivateKeyDer::Pkcs8(
        rustls::pki_types::PrivatePkcs8KeyDer::from(stores.key_der.clone()),
    );
    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![stores.cert.clone()], key)
        .expect("server config");
    let server = rustls::ServerConnection::new(Arc::new(server_config)).expect("server");

    // the application opens its stream toward the client route
    let app_in = Id::new(21);
    worker.dispatch(&Frame::Begin(frame::Begin {
        stream_id: app_in,
        route_id: 0x33,
        trace_id: 0,
        authorization: 0,
        correlation_id: 0x55,
        extension: &[],
    }));

    let frames = worker.env.take_frames();
    let (net_out, net_correlation) = frames
        .iter()
        .find_map(|frame| match frame {
            OwnedFrame::Begin {
                stream_id,
                correlation_id,
                ..
            } if !stream_id.is_reply() && *stream_id != app_in => {
                Some((*stream_id, *correlation_id))
            }
            _ => None,
        })
        .expect("network BEGIN");

    let mut net = NetPeer {
        server,
        net_out,
        net_in: net_out.reply(),
        credit: 0,
        pending: Vec::new(),
        received: Vec::new(),
        end_seen: false,
    };
    let mut app = AppPeer {
        app_in,
        app_out: None,
        credit: 0,
        padding: 0,
        out_granted: false,
        received: Vec::new(),
        end_seen: false,
    };

    // the network answers: credit for the initial stream, then the reply
    worker.dispatch(&Frame::Window(frame::Window {
        stream_id: net_out,
        trace_id: 0,
        credit: 1 << 20,
        padding: 0,
        group_id: 0,
    }));
    worker.dispatch(&Frame::Begin(frame::Begin {
        stream_id: net.net_in,
        route_id: 0x33,
        trace_id: 0,
        authorization: 0,
        correlation_id: net_correlation,
        extension: &[],
    }));

    drive_client(&mut worker, &mut net, &mut app);
    assert!(app.app_out.is_some(), "client handshake did not finish");
    assert!(app.credit > 0);

    // application cleartext wraps onto the network
    let message = payload(4096);
    assert!(app.credit >= message.len() as i64 + app.padding as i64);
    worker.dispatch(&Frame::Data(frame::Data {
        stream_id: app_in,
        trace_id: 0,
        group_id: 0,
        padding: app.padding,
        payload: &message,
    }));
    drive_client(&mut worker, &mut net, &mut app);
    assert_eq!(net.received, message);

    // and the server's answer unwraps back to the application
    {
        use std::io::Write as _;
        net.server.writer().write_all(b"answer").expect("server answer");
    }
    drive_client(&mut worker, &mut net, &mut app);
    assert_eq!(app.received, b"answer");

    // application closes; the worker flushes close_notify and ends
    worker.dispatch(&Frame::End(frame::End {
        stream_id: app_in,
        trace_id: 0,
    }));
    drive_client(&mut worker, &mut net, &mut app);
    assert!(net.end_seen);
}

#[test]
fn unroute_drops_the_store_at_zero_references() {
    let stores = provision_stores("unroute");
    let mut worker = Worker::new(Config::new(&stores.dir), TestEnv::new());

    let command = crate::control::RouteCommand {
        route_id: 1,
        role: Role::Server,
        local_address: "net#0".to_string(),
        remote_address: "app#0".to_string(),
        authorization: 0,
        store: None,
        hostname: None,
        application_protocol: None,
    };
    assert!(worker.handle_route(command.clone()));
    assert!(worker.handle_route(crate::control::RouteCommand {
        route_id: 2,
        ..command.clone()
    }));
    // duplicate ids are rejected without leaking a store reference
    assert!(!worker.handle_route(command));

    {
        let registry = worker.registry();
        let registry = registry.read();
        assert!(registry.stores.loaded(None));
    }

    assert!(worker.handle_unroute(1));
    assert!(worker.handle_unroute(2));
    assert!(!worker.handle_unroute(2));

    let registry = worker.registry();
    let registry = registry.read();
    assert!(!registry.stores.loaded(None));
}
