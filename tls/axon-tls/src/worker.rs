// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-dataplane-worker event loop state
//!
//! The worker owns every connection, engine, and slot; stream callbacks
//! re-enter through ids rather than holding references. All dispatch runs on
//! one thread; the only off-thread work is delegated TLS tasks, whose
//! completion arrives back as `SIGNAL(FLUSH_HANDSHAKE)` on the owning
//! stream.

use crate::{
    config::Config,
    counter::Counters,
    engine::{DelegatedTask, Engine},
    error::Error,
    frame::{self, data::MAX_PAYLOAD_LEN, Frame},
    route::{Registry, Role, RouteConfigSelector},
    slot::SlotPool,
    store::Stores,
    stream::{
        accept::AcceptConnection, client::ClientConnection, correlation::CorrelationMap, id::Id,
        reply::ReplyConnection,
    },
    task::CancelHandle,
};
use axon_codec::DecoderBuffer;
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};

/// What the core consumes from the host dataplane
pub trait Environment {
    /// Derives the reply id paired with an initial stream id
    fn supply_reply_id(&self, initial: Id) -> Id {
        initial.reply()
    }

    /// Allocates a fresh initial (non-reply) stream id
    fn next_initial_id(&mut self) -> Id;

    /// Allocates a correlation id, unique within the dataplane
    fn next_correlation_id(&mut self) -> u64;

    /// Emits a frame onto the shared-memory transport
    fn send(&mut self, frame: Frame<'_>);

    /// Runs a delegated task off the event loop; completion must surface as
    /// `SIGNAL(FLUSH_HANDSHAKE)` on `stream_id`
    fn schedule(&mut self, stream_id: Id, task: DelegatedTask) -> CancelHandle;
}

/// Where WINDOW/RESET frames for a stream we write to are routed
#[derive(Clone, Copy, Debug)]
pub(crate) enum Throttle {
    /// Network reply stream, owned by the accept-side handshake
    Handshake { accept_id: u64 },
    /// Network reply stream, parked in the correlation map
    Correlated { correlation_id: u64 },
    /// Network reply stream, owned by a reply connection (keyed by its
    /// inbound application stream id)
    Reply { reply_key: u64 },
    /// Application target stream of a server accept
    AcceptApp { accept_id: u64 },
    /// Network initial stream of a client connection
    ClientNet { client_id: u64 },
    /// Application reply stream of a client connection
    ClientApp { client_id: u64 },
}

/// Which connection an inbound stream id belongs to
#[derive(Clone, Copy, Debug)]
pub(crate) enum StreamKind {
    Accept,
    Reply,
    /// The application-facing accept stream of a client connection
    ClientApp { client_id: u64 },
    /// The network-facing reply stream of a client connection
    ClientNet { client_id: u64 },
}

struct EngineEntry {
    engine: Box<dyn Engine>,
    refs: u8,
}

/// Engines owned by the loop and shared by id between the paired pumps
#[derive(Default)]
pub(crate) struct Engines {
    map: HashMap<u64, EngineEntry>,
    next: u64,
}

impl Engines {
    pub(crate) fn insert(&mut self, engine: Box<dyn Engine>) -> u64 {
        let id = self.next;
        self.next += 1;
        self.map.insert(id, EngineEntry { engine, refs: 1 });
        id
    }

    pub(crate) fn get_mut(&mut self, id: u64) -> Option<&mut Box<dyn Engine>> {
        self.map.get_mut(&id).map(|entry| &mut entry.engine)
    }

    /// Adds an owner; the accept pump and the parked handshake (later the
    /// reply pump) each hold one
    pub(crate) fn retain(&mut self, id: u64) {
        if let Some(entry) = self.map.get_mut(&id) {
            entry.refs += 1;
        }
    }

    pub(crate) fn release(&mut self, id: u64) {
        if let Some(entry) = self.map.get_mut(&id) {
            entry.refs -= 1;
            if entry.refs == 0 {
                self.map.remove(&id);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Slot pools for one role
pub(crate) struct Pools {
    pub network: SlotPool,
    pub application: SlotPool,
}

impl Pools {
    fn new(config: &Config, counters: &Counters, role: &str) -> Self {
        Self {
            network: SlotPool::new(
                config.slot_count,
                config.slot_capacity,
                counters.pool(role, "network"),
            ),
            application: SlotPool::new(
                config.slot_count,
                config.slot_capacity,
                counters.pool(role, "application"),
            ),
        }
    }
}

pub struct Worker<E: Environment> {
    pub(crate) env: E,
    pub(crate) config: Config,
    pub(crate) registry: Arc<RwLock<Registry>>,
    pub(crate) counters: Counters,
    pub(crate) server_pools: Pools,
    pub(crate) client_pools: Pools,
    pub(crate) streams: HashMap<u64, StreamKind>,
    pub(crate) accepts: HashMap<u64, AcceptConnection>,
    pub(crate) replies: HashMap<u64, ReplyConnection>,
    pub(crate) clients: HashMap<u64, ClientConnection>,
    pub(crate) throttles: HashMap<u64, Throttle>,
    pub(crate) correlations: CorrelationMap,
    pub(crate) engines: Engines,
    /// Staging for wrap output; also the unwrap sink while handshaking
    pub(crate) scratch: Box<[u8]>,
    pub(crate) frozen: bool,
}

impl<E: Environment> Worker<E> {
    pub fn new(config: Config, env: E) -> Self {
        let counters = Counters::new();
        let registry = Registry::new(Stores::new(config.dataplane_dir.clone()));
        let server_pools = Pools::new(&config, &counters, "server");
        let client_pools = Pools::new(&config, &counters, "client");
        Self {
            env,
            registry: Arc::new(RwLock::new(registry)),
            counters,
            server_pools,
            client_pools,
            streams: HashMap::new(),
            accepts: HashMap::new(),
            replies: HashMap::new(),
            clients: HashMap::new(),
            throttles: HashMap::new(),
            correlations: CorrelationMap::default(),
            engines: Engines::default(),
            scratch: vec![0u8; MAX_PAYLOAD_LEN].into_boxed_slice(),
            frozen: false,
            config,
        }
    }

    #[inline]
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn registry(&self) -> Arc<RwLock<Registry>> {
        self.registry.clone()
    }

    /// Stops accepting new streams; existing connections drain
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Decodes and dispatches one host message
    pub fn on_message(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let (frame, _) = DecoderBuffer::new(bytes).decode::<Frame>()?;
        self.dispatch(&frame);
        Ok(())
    }

    pub fn dispatch(&mut self, frame: &Frame) {
        tracing::trace!(tag = frame.tag(), stream = %frame.stream_id(), "dispatch");
        match frame {
            Frame::Begin(begin) => self.on_begin(begin),
            Frame::Data(data) => self.on_stream_data(data),
            Frame::End(end) => self.on_stream_end(end),
            Frame::Abort(abort) => self.on_stream_abort(abort),
            Frame::Window(window) => self.on_throttle_window(window),
            Frame::Reset(reset) => self.on_throttle_reset(reset),
            Frame::Signal(signal) => self.on_stream_signal(signal),
        }
    }

    fn on_begin(&mut self, begin: &frame::Begin) {
        let id = begin.stream_id;

        if self.streams.contains_key(&id.as_u64()) {
            tracing::warn!(stream = %id, "duplicate BEGIN");
            send_reset(&mut self.env, id, begin.trace_id);
            return;
        }

        if id.is_reply() {
            self.on_reply_begin(begin);
            return;
        }

        if self.frozen {
            send_reset(&mut self.env, id, begin.trace_id);
            return;
        }

        // the route's role decides which factory answers this stream
        let route = {
            let registry = self.registry.read();
            registry
                .routes
                .accept(begin.route_id, begin.authorization)
                .map(|route| (route.role, route.context.clone()))
        };

        match route {
            Some((Role::Server, store)) if store.has_key_store() => {
                self.on_accept_begin(begin, store)
            }
            Some((Role::Client, store)) if store.has_trust_store() => {
                self.on_client_begin(begin, store)
            }
            _ => {
                // no handler for this stream
                tracing::warn!(route_id = begin.route_id, "unresolved BEGIN");
                send_reset(&mut self.env, id, begin.trace_id);
            }
        }
    }

    fn on_stream_data(&mut self, data: &frame::Data) {
        match self.streams.get(&data.stream_id.as_u64()).copied() {
            Some(StreamKind::Accept) => self.on_accept_data(data.stream_id.as_u64(), data),
            Some(StreamKind::Reply) => self.on_reply_data(data.stream_id.as_u64(), data),
            Some(StreamKind::ClientApp { client_id }) => self.on_client_app_data(client_id, data),
            Some(StreamKind::ClientNet { client_id }) => self.on_client_net_data(client_id, data),
            None => send_reset(&mut self.env, data.stream_id, data.trace_id),
        }
    }

    fn on_stream_end(&mut self, end: &frame::End) {
        match self.streams.get(&end.stream_id.as_u64()).copied() {
            Some(StreamKind::Accept) => self.on_accept_end(end.stream_id.as_u64(), end.trace_id),
            Some(StreamKind::Reply) => self.on_reply_end(end.stream_id.as_u64(), end.trace_id),
            Some(StreamKind::ClientApp { client_id }) => {
                self.on_client_app_end(client_id, end.trace_id)
            }
            Some(StreamKind::ClientNet { client_id }) => {
                self.on_client_net_end(client_id, end.trace_id)
            }
            // a late END for a torn-down stream is not an error
            None => {}
        }
    }

    fn on_stream_abort(&mut self, abort: &frame::Abort) {
        match self.streams.get(&abort.stream_id.as_u64()).copied() {
            Some(StreamKind::Accept) => {
                self.on_accept_abort(abort.stream_id.as_u64(), abort.trace_id)
            }
            Some(StreamKind::Reply) => self.on_reply_abort(abort.stream_id.as_u64(), abort.trace_id),
            Some(StreamKind::ClientApp { client_id }) => {
                self.on_client_app_abort(client_id, abort.trace_id)
            }
            Some(StreamKind::ClientNet { client_id }) => {
                self.on_client_net_abort(client_id, abort.trace_id)
            }
            None => {}
        }
    }

    fn on_stream_signal(&mut self, signal: &frame::Signal) {
        ensure!(signal.signal_id == frame::signal::FLUSH_HANDSHAKE);
        match self.streams.get(&signal.stream_id.as_u64()).copied() {
            Some(StreamKind::Accept) => self.on_accept_flush(signal.stream_id.as_u64()),
            Some(StreamKind::ClientApp { client_id }) => self.on_client_flush(client_id),
            // the connection is gone; the completion is stale
            _ => {}
        }
    }

    fn on_throttle_window(&mut self, window: &frame::Window) {
        match self.throttles.get(&window.stream_id.as_u64()).copied() {
            Some(Throttle::Handshake { accept_id }) => {
                self.on_handshake_window(accept_id, window)
            }
            Some(Throttle::Correlated { correlation_id }) => {
                self.correlations.add_reply_credit(
                    correlation_id,
                    window.credit,
                    window.padding,
                );
            }
            Some(Throttle::Reply { reply_key }) => self.on_reply_window(reply_key, window),
            Some(Throttle::AcceptApp { accept_id }) => self.on_accept_app_window(accept_id, window),
            Some(Throttle::ClientNet { client_id }) => self.on_client_net_window(client_id, window),
            Some(Throttle::ClientApp { client_id }) => self.on_client_app_window(client_id, window),
            None => {}
        }
    }

    fn on_throttle_reset(&mut self, reset: &frame::Reset) {
        match self.throttles.remove(&reset.stream_id.as_u64()) {
            Some(Throttle::Handshake { accept_id }) => {
                self.on_handshake_reset(accept_id, reset.trace_id)
            }
            Some(Throttle::Correlated { correlation_id }) => {
                // the reply stream died before the application answered
                if let Some(handshake) = self.correlations.remove_server(correlation_id) {
                    self.engines.release(handshake.engine);
                    self.fail_accept(handshake.accept_id);
                }
            }
            Some(Throttle::Reply { reply_key }) => self.on_reply_reset(reply_key, reset.trace_id),
            Some(Throttle::AcceptApp { accept_id }) => {
                self.on_accept_app_reset(accept_id, reset.trace_id)
            }
            Some(Throttle::ClientNet { client_id }) => {
                self.on_client_net_reset(client_id, reset.trace_id)
            }
            Some(Throttle::ClientApp { client_id }) => {
                self.on_client_app_reset(client_id, reset.trace_id)
            }
            None => {}
        }
    }
}

pub(crate) fn send_begin<E: Environment>(
    env: &mut E,
    stream_id: Id,
    route_id: u64,
    trace_id: u64,
    authorization: u64,
    correlation_id: u64,
    extension: &[u8],
) {
    env.send(Frame::Begin(frame::Begin {
        stream_id,
        route_id,
        trace_id,
        authorization,
        correlation_id,
        extension,
    }));
}

pub(crate) fn send_data<E: Environment>(
    env: &mut E,
    stream_id: Id,
    trace_id: u64,
    padding: u32,
    payload: &[u8],
) {
    debug_assert!(payload.len() <= MAX_PAYLOAD_LEN);
    env.send(Frame::Data(frame::Data {
        stream_id,
        trace_id,
        group_id: 0,
        padding,
        payload,
    }));
}

pub(crate) fn send_window<E: Environment>(
    env: &mut E,
    stream_id: Id,
    trace_id: u64,
    credit: u32,
    padding: u32,
) {
    env.send(Frame::Window(frame::Window {
        stream_id,
        trace_id,
        credit,
        padding,
        group_id: 0,
    }));
}

pub(crate) fn send_end<E: Environment>(env: &mut E, stream_id: Id, trace_id: u64) {
    env.send(Frame::End(frame::End { stream_id, trace_id }));
}

pub(crate) fn send_abort<E: Environment>(env: &mut E, stream_id: Id, trace_id: u64) {
    env.send(Frame::Abort(frame::Abort { stream_id, trace_id }));
}

pub(crate) fn send_reset<E: Environment>(env: &mut E, stream_id: Id, trace_id: u64) {
    env.send(Frame::Reset(frame::Reset { stream_id, trace_id }));
}

/// Builds the selector handed to a server engine at accept time
pub(crate) fn hello_selector(
    registry: Arc<RwLock<Registry>>,
    store: Arc<crate::store::StoreContext>,
    authorization: u64,
) -> Box<RouteConfigSelector> {
    Box::new(RouteConfigSelector::new(registry, store, authorization))
}
