// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-memory host harness
//!
//! `TestEnv` records emitted frames and defers delegated tasks so tests can
//! observe the parked window. `ServerHarness` wires a worker to a real
//! rustls client over the frame protocol, playing both the network peer and
//! the application.

use crate::{
    config::Config,
    control::RouteCommand,
    engine::{testing::ScriptedEngine, DelegatedTask},
    frame::{extension::TlsBeginExt, Frame},
    route::Role,
    store::StoreContext,
    stream::{
        accept::{AcceptConnection, StreamState},
        handshake::Handshake,
        id::Id,
    },
    task::CancelHandle,
    worker::{Environment, StreamKind, Throttle, Worker},
};
use axon_codec::DecoderBuffer;
use rustls::pki_types::CertificateDer;
use std::{
    collections::VecDeque,
    io::{Read, Write},
    path::PathBuf,
    sync::atomic::{AtomicUsize, Ordering},
    sync::Arc,
};

pub(crate) fn init_tracing() {
    use std::sync::Once;

    static TRACING: Once = Once::new();

    // make sure this only gets initialized once
    TRACING.call_once(|| {
        let format = tracing_subscriber::fmt::format().compact();

        let env_filter = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(tracing::Level::DEBUG.into())
            .with_env_var("AXON_LOG")
            .from_env()
            .unwrap();

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .event_format(format)
            .with_test_writer()
            .init();
    });
}

pub(crate) fn empty_store() -> StoreContext {
    StoreContext::empty(0)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum OwnedFrame {
    Begin {
        stream_id: Id,
        route_id: u64,
        correlation_id: u64,
        extension: Vec<u8>,
    },
    Data {
        stream_id: Id,
        padding: u32,
        payload: Vec<u8>,
    },
    End {
        stream_id: Id,
    },
    Abort {
        stream_id: Id,
    },
    Window {
        stream_id: Id,
        credit: u32,
        padding: u32,
    },
    Reset {
        stream_id: Id,
    },
    Signal {
        stream_id: Id,
        signal_id: u64,
    },
}

impl OwnedFrame {
    fn from_frame(frame: &Frame) -> Self {
        match frame {
            Frame::Begin(begin) => OwnedFrame::Begin {
                stream_id: begin.stream_id,
                route_id: begin.route_id,
                correlation_id: begin.correlation_id,
                extension: begin.extension.to_vec(),
            },
            Frame::Data(data) => OwnedFrame::Data {
                stream_id: data.stream_id,
                padding: data.padding,
                payload: data.payload.to_vec(),
            },
            Frame::End(end) => OwnedFrame::End {
                stream_id: end.stream_id,
            },
            Frame::Abort(abort) => OwnedFrame::Abort {
                stream_id: abort.stream_id,
            },
            Frame::Window(window) => OwnedFrame::Window {
                stream_id: window.stream_id,
                credit: window.credit,
                padding: window.padding,
            },
            Frame::Reset(reset) => OwnedFrame::Reset {
                stream_id: reset.stream_id,
            },
            Frame::Signal(signal) => OwnedFrame::Signal {
                stream_id: signal.stream_id,
                signal_id: signal.signal_id,
            },
        }
    }
}

pub(crate) struct TestEnv {
    pub frames: VecDeque<OwnedFrame>,
    pub tasks: Vec<(Id, DelegatedTask, CancelHandle)>,
    next_initial: u64,
    next_correlation: u64,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            frames: VecDeque::new(),
            tasks: Vec::new(),
            next_initial: 0x100,
            next_correlation: 0x9000,
        }
    }

    pub fn take_frames(&mut self) -> Vec<OwnedFrame> {
        self.frames.drain(..).collect()
    }

    /// Runs the deferred delegated tasks; the ids returned want a
    /// `SIGNAL(FLUSH_HANDSHAKE)` dispatched
    pub fn run_tasks(&mut self) -> Vec<Id> {
        let mut completed = Vec::new();
        for (stream_id, task, cancel) in self.tasks.drain(..) {
            if !cancel.is_cancelled() {
                task.run();
            }
            completed.push(stream_id);
        }
        completed
    }
}

impl Environment for TestEnv {
    fn next_initial_id(&mut self) -> Id {
        let id = self.next_initial;
        self.next_initial += 1;
        Id::new(id)
    }

    fn next_correlation_id(&mut self) -> u64 {
        let id = self.next_correlation;
        self.next_correlation += 1;
        id
    }

    fn send(&mut self, frame: Frame<'_>) {
        self.frames.push_back(OwnedFrame::from_frame(&frame));
    }

    fn schedule(&mut self, stream_id: Id, task: DelegatedTask) -> CancelHandle {
        let cancel = CancelHandle::new();
        self.tasks.push((stream_id, task, cancel.clone()));
        cancel
    }
}

/// Installs an accept connection driven by a scripted engine, exactly as
/// the factory would have built it
pub(crate) fn scripted_accept(
    worker: &mut Worker<TestEnv>,
    accept: u64,
    engine: ScriptedEngine,
) -> u64 {
    let accept_id = Id::new(accept);
    let reply_id = accept_id.reply();
    let engine_id = worker.engines.insert(Box::new(engine));
    let credit = worker.config.handshake_window_bytes as i64;

    worker.streams.insert(accept, StreamKind::Accept);
    worker.throttles.insert(
        reply_id.as_u64(),
        Throttle::Handshake { accept_id: accept },
    );
    worker.accepts.insert(
        accept,
        AcceptConnection {
            stream_id: accept_id,
            reply_id,
            route_id: NET_ROUTE_ID,
            authorization: 0,
            trace_id: 0,
            engine: engine_id,
            state: StreamState::Handshaking(Handshake {
                accept_id: accept,
                reply_id,
                engine: engine_id,
                route_id: NET_ROUTE_ID,
                authorization: 0,
                pending_tasks: 0,
                cancels: Vec::new(),
                network_reply_budget: 0,
                network_reply_padding: 0,
            }),
            network_budget: credit,
            network_padding: 0,
            application_budget: 0,
            application_padding: 0,
            network_slot: None,
            network_slot_offset: 0,
            application_slot: None,
            application_slot_offset: 0,
            app_stream_id: None,
            app_correlation_id: None,
            app_route_id: None,
            inbound_ended: false,
            app_end_sent: false,
            reply_done: false,
            counters: worker.counters.route(NET_ROUTE_ID),
        },
    );
    engine_id
}

static STORE_SEQ: AtomicUsize = AtomicUsize::new(0);

pub(crate) struct TestStores {
    pub dir: PathBuf,
    /// The issuing root, what peers should trust
    pub ca: CertificateDer<'static>,
    /// The leaf certificate and its key
    pub cert: CertificateDer<'static>,
    pub key_der: Vec<u8>,
}

/// Mints a root and a leaf for `localhost`/`example.net` and lays out a
/// default store on disk
pub(crate) fn provision_stores(tag: &str) -> TestStores {
    let seq = STORE_SEQ.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "axon-tls-{}-{tag}-{seq}",
        std::process::id()
    ));
    let tls = dir.join("tls");
    std::fs::create_dir_all(&tls).expect("create store dir");

    let ca_key = rcgen::KeyPair::generate().expect("ca key");
    let mut ca_params = rcgen::CertificateParams::new(Vec::new()).expect("ca params");
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let ca_cert = ca_params.self_signed(&ca_key).expect("ca cert");

    let leaf_key = rcgen::KeyPair::generate().expect("leaf key");
    let leaf_params = rcgen::CertificateParams::new(vec![
        "localhost".to_string(),
        "example.net".to_string(),
    ])
    .expect("leaf params");
    let leaf_cert = leaf_params
        .signed_by(&leaf_key, &ca_cert, &ca_key)
        .expect("leaf cert");

    let keys = format!("{}{}", leaf_cert.pem(), leaf_key.serialize_pem());
    std::fs::write(tls.join("keys"), keys).expect("write keys");
    std::fs::write(tls.join("trust"), ca_cert.pem()).expect("write trust");

    TestStores {
        dir,
        ca: ca_cert.der().clone(),
        cert: leaf_cert.der().clone(),
        key_der: leaf_key.serialize_der(),
    }
}

pub(crate) fn test_client(
    cert: &CertificateDer<'static>,
    sni: &str,
    alpn: &[&[u8]],
) -> rustls::ClientConnection {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert.clone()).expect("trust anchor");
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|protocol| protocol.to_vec()).collect();
    rustls::ClientConnection::new(
        Arc::new(config),
        rustls::pki_types::ServerName::try_from(sni.to_string()).expect("server name"),
    )
    .expect("client connection")
}

pub(crate) const ACCEPT_ID: u64 = 5;
pub(crate) const NET_ROUTE_ID: u64 = 0x11;
pub(crate) const NET_CORRELATION: u64 = 0x77;
pub(crate) const APP_REPLY_ID: u64 = 0x900;

/// Plays the network peer (a real rustls client) and the application
/// against a server-role worker
pub(crate) struct ServerHarness {
    pub worker: Worker<TestEnv>,
    pub client: rustls::ClientConnection,
    pub accept_id: Id,
    pub reply_id: Id,
    /// Credit the worker granted us on the accept stream
    pub accept_credit: i64,
    /// Application-side observations
    pub app_id: Option<Id>,
    pub app_correlation: Option<u64>,
    pub app_ext: Option<(Option<String>, Option<String>)>,
    pub app_data: Vec<u8>,
    pub app_end: bool,
    pub app_abort: bool,
    /// Reply stream opened by the "application" for echoing
    pub app_reply_id: Id,
    pub app_reply_credit: i64,
    pub app_reply_padding: u32,
    /// Network-side observations
    pub client_data: Vec<u8>,
    pub client_closed: bool,
    pub reply_end: bool,
    pub reply_abort: bool,
    pub accept_reset: bool,
    /// Window the application grants per pump round; `None` grants freely
    pub app_window_step: Option<u32>,
    app_window_outstanding: i64,
    /// Network-side reply accounting: credit granted vs ciphertext received
    pub reply_granted: i64,
    pub reply_consumed: i64,
    /// Client TLS bytes awaiting accept-stream credit
    pending_net: Vec<u8>,
}

impl ServerHarness {
    pub fn new(
        route_hostname: Option<&str>,
        route_protocol: Option<&str>,
        client_sni: &str,
        client_alpn: &[&[u8]],
    ) -> Self {
        init_tracing();

        let stores = provision_stores("server");
        let config = Config::new(&stores.dir);
        let mut worker = Worker::new(config, TestEnv::new());

        assert!(worker.handle_route(RouteCommand {
            route_id: NET_ROUTE_ID,
            role: Role::Server,
            local_address: "net#0".to_string(),
            remote_address: "app#0".to_string(),
            authorization: 0,
            store: None,
            hostname: route_hostname.map(str::to_string),
            application_protocol: route_protocol.map(str::to_string),
        }));

        let client = test_client(&stores.ca, client_sni, client_alpn);
        let accept_id = Id::new(ACCEPT_ID);

        Self {
            worker,
            client,
            accept_id,
            reply_id: accept_id.reply(),
            accept_credit: 0,
            app_id: None,
            app_correlation: None,
            app_ext: None,
            app_data: Vec::new(),
            app_end: false,
            app_abort: false,
            app_reply_id: Id::new(APP_REPLY_ID | crate::stream::id::REPLY_BIT),
            app_reply_credit: 0,
            app_reply_padding: 0,
            client_data: Vec::new(),
            client_closed: false,
            reply_end: false,
            reply_abort: false,
            accept_reset: false,
            app_window_step: None,
            app_window_outstanding: 0,
            reply_granted: 0,
            reply_consumed: 0,
            pending_net: Vec::new(),
        }
    }

    /// Opens the accept stream and grants the network-side reply window
    pub fn begin(&mut self) {
        self.worker.dispatch(&Frame::Begin(crate::frame::Begin {
            stream_id: self.accept_id,
            route_id: NET_ROUTE_ID,
            trace_id: 1,
            authorization: 0,
            correlation_id: NET_CORRELATION,
            extension: &[],
        }));
        self.grant_reply_window(1 << 20);
        self.pump();
    }

    fn grant_reply_window(&mut self, credit: u32) {
        self.reply_granted += credit as i64;
        self.worker.dispatch(&Frame::Window(crate::frame::Window {
            stream_id: self.reply_id,
            trace_id: 1,
            credit,
            padding: 0,
            group_id: 0,
        }));
    }

    /// Runs the exchange until neither side can make progress
    pub fn pump(&mut self) {
        for _ in 0..256 {
            let mut progress = false;
            progress |= self.flush_client();
            progress |= self.drain_worker();
            progress |= self.grant_app_window();
            if !progress {
                return;
            }
        }
        panic!("harness did not converge");
    }

    /// Moves pending client TLS bytes onto the accept stream within credit
    fn flush_client(&mut self) -> bool {
        while self.client.wants_write() {
            if self.client.write_tls(&mut self.pending_net).expect("client write") == 0 {
                break;
            }
        }

        let mut progress = false;
        while !self.pending_net.is_empty() && self.accept_credit > 0 {
            let len = self.pending_net.len().min(self.accept_credit as usize);
            self.accept_credit -= len as i64;
            let chunk: Vec<u8> = self.pending_net.drain(..len).collect();
            self.worker.dispatch(&Frame::Data(crate::frame::Data {
                stream_id: self.accept_id,
                trace_id: 2,
                group_id: 0,
                padding: 0,
                payload: &chunk,
            }));
            progress = true;
        }
        progress
    }

    /// Routes worker output to the right peer
    fn drain_worker(&mut self) -> bool {
        let frames = self.worker.env.take_frames();
        let mut progress = !frames.is_empty();
        for frame in frames {
            match frame {
                OwnedFrame::Window { stream_id, credit, .. } if stream_id == self.accept_id => {
                    self.accept_credit += credit as i64;
                }
                OwnedFrame::Window { stream_id, credit, padding }
                    if stream_id == self.app_reply_id =>
                {
                    self.app_reply_credit += credit as i64;
                    self.app_reply_padding = padding;
                }
                OwnedFrame::Data { stream_id, payload, .. } if stream_id == self.reply_id => {
                    assert!(
                        payload.len() <= crate::frame::data::MAX_PAYLOAD_LEN,
                        "ciphertext frame exceeds the payload bound"
                    );
                    self.reply_consumed += payload.len() as i64;
                    assert!(
                        self.reply_consumed <= self.reply_granted,
                        "worker overran the reply credit"
                    );
                    // a live peer keeps the window topped up
                    self.grant_reply_window(payload.len() as u32);
                    let mut reader = &payload[..];
                    while !reader.is_empty() {
                        self.client.read_tls(&mut reader).expect("client read");
                        let state = self.client.process_new_packets().expect("client process");
                        if state.peer_has_closed() {
                            self.client_closed = true;
                        }
                        let mut plaintext = [0u8; 4096];
                        loop {
                            match self.client.reader().read(&mut plaintext) {
                                Ok(0) => break,
                                Ok(len) => self.client_data.extend_from_slice(&plaintext[..len]),
                                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                                    break
                                }
                                Err(error) => panic!("client plaintext: {error}"),
                            }
                        }
                    }
                }
                OwnedFrame::End { stream_id } if stream_id == self.reply_id => {
                    self.reply_end = true;
                }
                OwnedFrame::Abort { stream_id } if stream_id == self.reply_id => {
                    self.reply_abort = true;
                }
                OwnedFrame::Reset { stream_id } if stream_id == self.accept_id => {
                    self.accept_reset = true;
                }
                OwnedFrame::Begin { stream_id, correlation_id, extension, .. }
                    if !stream_id.is_reply() && stream_id != self.accept_id =>
                {
                    let ext = DecoderBuffer::new(&extension)
                        .decode::<TlsBeginExt>()
                        .map(|(ext, _)| {
                            (
                                ext.hostname.map(str::to_string),
                                ext.application_protocol.map(str::to_string),
                            )
                        })
                        .unwrap_or_default();
                    self.app_id = Some(stream_id);
                    self.app_correlation = Some(correlation_id);
                    self.app_ext = Some(ext);
                }
                OwnedFrame::Data { stream_id, payload, .. }
                    if Some(stream_id) == self.app_id =>
                {
                    self.app_window_outstanding -= payload.len() as i64;
                    self.app_data.extend_from_slice(&payload);
                }
                OwnedFrame::End { stream_id } if Some(stream_id) == self.app_id => {
                    self.app_end = true;
                }
                OwnedFrame::Abort { stream_id } if Some(stream_id) == self.app_id => {
                    self.app_abort = true;
                }
                _ => {}
            }
        }
        progress
    }

    /// The application grants window downstream once its stream exists
    fn grant_app_window(&mut self) -> bool {
        let Some(app_id) = self.app_id else {
            return false;
        };
        ensure!(!self.app_end && !self.app_abort, false);
        let step = self.app_window_step.unwrap_or(1 << 20) as i64;
        ensure!(self.app_window_outstanding < step, false);
        self.app_window_outstanding += step;
        self.worker.dispatch(&Frame::Window(crate::frame::Window {
            stream_id: app_id,
            trace_id: 3,
            credit: step as u32,
            padding: 0,
            group_id: 0,
        }));
        true
    }

    /// The application opens its reply stream, echoing the correlation
    pub fn open_app_reply(&mut self) {
        let correlation_id = self.app_correlation.expect("application stream");
        self.worker.dispatch(&Frame::Begin(crate::frame::Begin {
            stream_id: self.app_reply_id,
            route_id: NET_ROUTE_ID,
            trace_id: 4,
            authorization: 0,
            correlation_id,
            extension: &[],
        }));
        self.pump();
    }

    /// The application writes cleartext onto its reply stream within credit
    pub fn app_write(&mut self, mut payload: &[u8]) {
        while !payload.is_empty() {
            self.pump();
            let window = self.app_reply_credit - self.app_reply_padding as i64;
            assert!(window > 0, "application starved of reply credit");
            let len = payload
                .len()
                .min(window as usize)
                .min(crate::frame::data::MAX_PAYLOAD_LEN);
            self.app_reply_credit -= len as i64 + self.app_reply_padding as i64;
            let frame = Frame::Data(crate::frame::Data {
                stream_id: self.app_reply_id,
                trace_id: 5,
                group_id: 0,
                padding: self.app_reply_padding,
                payload: &payload[..len],
            });
            self.worker.dispatch(&frame);
            payload = &payload[len..];
        }
        self.pump();
    }

    pub fn app_end_reply(&mut self) {
        self.worker.dispatch(&Frame::End(crate::frame::End {
            stream_id: self.app_reply_id,
            trace_id: 6,
        }));
        self.pump();
    }

    /// The network peer writes cleartext through its TLS session
    ///
    /// rustls bounds its plaintext buffer, so large payloads interleave
    /// writing with draining the transport.
    pub fn client_write(&mut self, payload: &[u8]) {
        let mut at = 0;
        let mut stalls = 0;
        while at < payload.len() {
            let wrote = self.client.writer().write(&payload[at..]).expect("client write");
            at += wrote;
            self.pump();
            if wrote == 0 {
                stalls += 1;
                assert!(stalls < 64, "client write made no progress");
            } else {
                stalls = 0;
            }
        }
        self.pump();
    }

    pub fn client_close(&mut self) {
        self.client.send_close_notify();
        self.pump();
        self.worker.dispatch(&Frame::End(crate::frame::End {
            stream_id: self.accept_id,
            trace_id: 7,
        }));
        self.pump();
    }

    pub fn client_abort(&mut self) {
        self.worker.dispatch(&Frame::Abort(crate::frame::Abort {
            stream_id: self.accept_id,
            trace_id: 8,
        }));
        self.pump();
    }

    /// Drives until the handshake finishes and the application stream opens
    pub fn handshake(&mut self) {
        self.begin();
        for _ in 0..64 {
            self.pump();
            if self.app_id.is_some() || self.accept_reset {
                return;
            }
        }
        panic!("handshake did not complete");
    }

    pub fn slot_balance(&self) -> (u64, u64) {
        let counters = self.worker.counters();
        let acquires = counters.counter("server.network.acquires").count()
            + counters.counter("server.application.acquires").count();
        let releases = counters.counter("server.network.releases").count()
            + counters.counter("server.application.releases").count();
        (acquires, releases)
    }
}
