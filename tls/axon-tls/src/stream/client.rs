// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Client role: TLS origination for application-initiated streams
//!
//! The mirror of the server pair, folded into one connection: cleartext
//! arrives on the application accept stream and wraps onto the network
//! initial stream; ciphertext returns on the network reply stream and
//! unwraps onto the application reply stream. There is no SNI selection
//! filter: the route named by the application's BEGIN decides everything.

use crate::{
    counter::RouteCounters,
    engine::{rustls::ClientEngine, HandshakeStatus, Status, MAX_RECORD_OVERHEAD},
    error::{Error, Kind},
    frame::{data::MAX_PAYLOAD_LEN, extension::TlsBeginExt, Begin, Data, Window},
    route::Role,
    slot::Slot,
    store::StoreContext,
    stream::id::Id,
    task::CancelHandle,
    worker::{
        send_abort, send_begin, send_data, send_end, send_reset, send_window, Environment,
        StreamKind, Throttle, Worker,
    },
};
use axon_codec::{DecoderBuffer, EncoderValue};
use std::sync::Arc;

#[derive(Debug)]
pub(crate) struct ClientConnection {
    /// Application accept stream (cleartext in)
    pub app_in: Id,
    /// Application reply stream (cleartext out), opened at FINISHED
    pub app_out: Option<Id>,
    /// Network initial stream (ciphertext out)
    pub net_out: Id,
    /// Network reply stream (ciphertext in)
    pub net_in: Option<Id>,
    pub route_id: u64,
    pub authorization: u64,
    /// Correlation from the application's BEGIN, echoed on the app reply
    pub peer_correlation_id: u64,
    pub trace_id: u64,
    pub engine: u64,
    pub handshaking: bool,
    pub pending_tasks: u32,
    pub cancels: Vec<CancelHandle>,
    /// Credit granted to the application on the accept stream
    pub app_budget: i64,
    /// Credit the network granted on the initial stream
    pub net_budget: i64,
    pub net_padding: u32,
    /// Credit granted to the network on the reply stream
    pub net_in_budget: i64,
    /// Credit the application granted on the reply stream
    pub app_out_budget: i64,
    pub app_out_padding: u32,
    pub network_slot: Option<Slot>,
    pub network_slot_offset: usize,
    pub application_slot: Option<Slot>,
    pub application_slot_offset: usize,
    pub app_ended: bool,
    pub net_ended: bool,
    pub app_end_sent: bool,
    pub net_end_sent: bool,
    pub counters: RouteCounters,
}

enum Step {
    Continue,
    Handshake(HandshakeStatus),
    Stalled,
    Closed,
    Parked,
    Failed(Error),
    Gone,
}

impl<E: Environment> Worker<E> {
    pub(crate) fn on_client_begin(&mut self, begin: &Begin, store: Arc<StoreContext>) {
        let client_id = begin.stream_id.as_u64();

        let extension = DecoderBuffer::new(begin.extension)
            .decode::<TlsBeginExt>()
            .map(|(extension, _)| extension)
            .unwrap_or_default();

        let (route_id, route_hostname, route_protocol, remote_address) = {
            let registry = self.registry.read();
            let Some(route) = registry.routes.accept(begin.route_id, begin.authorization) else {
                send_reset(&mut self.env, begin.stream_id, begin.trace_id);
                return;
            };
            debug_assert_eq!(route.role, Role::Client);
            (
                route.route_id,
                route.hostname.clone(),
                route.application_protocol.clone(),
                route.remote_address.clone(),
            )
        };

        // SNI preference: the application's extension, then the route, then
        // the remote address
        let hostname = extension
            .hostname
            .map(str::to_string)
            .or(route_hostname)
            .unwrap_or_else(|| {
                remote_address
                    .split(':')
                    .next()
                    .unwrap_or_default()
                    .to_string()
            });

        let engine = store
            .client_config(route_protocol.as_deref().map(str::as_bytes))
            .and_then(|config| ClientEngine::new(config, &hostname));
        let engine = match engine {
            Ok(engine) => engine,
            Err(error) => {
                tracing::warn!(%error, "client engine failed");
                send_reset(&mut self.env, begin.stream_id, begin.trace_id);
                return;
            }
        };
        let engine_id = self.engines.insert(Box::new(engine));

        let net_out = self.env.next_initial_id();
        let net_correlation_id = self.env.next_correlation_id();

        send_begin(
            &mut self.env,
            net_out,
            route_id,
            begin.trace_id,
            begin.authorization,
            net_correlation_id,
            &[],
        );

        self.correlations.insert(
            net_correlation_id,
            super::correlation::Correlated::Client { client_id },
        );
        self.throttles
            .insert(net_out.as_u64(), Throttle::ClientNet { client_id });
        self.streams
            .insert(client_id, StreamKind::ClientApp { client_id });
        self.clients.insert(
            client_id,
            ClientConnection {
                app_in: begin.stream_id,
                app_out: None,
                net_out,
                net_in: None,
                route_id,
                authorization: begin.authorization,
                peer_correlation_id: begin.correlation_id,
                trace_id: begin.trace_id,
                engine: engine_id,
                handshaking: true,
                pending_tasks: 0,
                cancels: Vec::new(),
                app_budget: 0,
                net_budget: 0,
                net_padding: 0,
                net_in_budget: 0,
                app_out_budget: 0,
                app_out_padding: 0,
                network_slot: None,
                network_slot_offset: 0,
                application_slot: None,
                application_slot_offset: 0,
                app_ended: false,
                net_ended: false,
                app_end_sent: false,
                net_end_sent: false,
                counters: self.counters.route(route_id),
            },
        );

        tracing::debug!(client = client_id, net = %net_out, route = route_id, "originating");

        // the ClientHello wraps once the network grants credit
        let status = self.client_status(client_id);
        self.client_cycle(client_id, status);
    }

    fn client_status(&mut self, client_id: u64) -> HandshakeStatus {
        let Some(conn) = self.clients.get(&client_id) else {
            return HandshakeStatus::NotHandshaking;
        };
        let engine = conn.engine;
        match self.engines.get_mut(engine) {
            Some(engine) => engine.handshake_status(),
            None => HandshakeStatus::NotHandshaking,
        }
    }

    /// The client-side handshake coordinator
    fn client_cycle(&mut self, client_id: u64, mut status: HandshakeStatus) -> bool {
        loop {
            match status {
                HandshakeStatus::NeedTask => {
                    let parked = {
                        let Self {
                            clients,
                            engines,
                            env,
                            ..
                        } = self;
                        let Some(conn) = clients.get_mut(&client_id) else {
                            return false;
                        };
                        let Some(engine) = engines.get_mut(conn.engine) else {
                            return false;
                        };
                        let mut drained = 0;
                        while let Some(task) = engine.delegated_task() {
                            let cancel = env.schedule(conn.app_in, task);
                            conn.cancels.push(cancel);
                            conn.pending_tasks += 1;
                            drained += 1;
                        }
                        if conn.pending_tasks > 0 || drained == 0 {
                            true
                        } else {
                            status = engine.handshake_status();
                            false
                        }
                    };
                    if parked {
                        return true;
                    }
                }
                HandshakeStatus::NeedWrap => {
                    let next = {
                        let Self {
                            clients,
                            engines,
                            env,
                            scratch,
                            ..
                        } = self;
                        let Some(conn) = clients.get_mut(&client_id) else {
                            return false;
                        };
                        let window = conn.net_budget - conn.net_padding as i64;
                        if window <= 0 {
                            None
                        } else {
                            let cap = (window as usize).min(scratch.len());
                            let Some(engine) = engines.get_mut(conn.engine) else {
                                return false;
                            };
                            match engine.wrap(&[], &mut scratch[..cap]) {
                                Err(error) => Some(Err(error)),
                                Ok(flush) => {
                                    if flush.produced > 0 {
                                        send_data(
                                            env,
                                            conn.net_out,
                                            conn.trace_id,
                                            conn.net_padding,
                                            &scratch[..flush.produced],
                                        );
                                        conn.net_budget -=
                                            flush.produced as i64 + conn.net_padding as i64;
                                        conn.counters.frames_written.increment();
                                        conn.counters.bytes_written.add(flush.produced as u64);
                                    }
                                    if flush.handshake == HandshakeStatus::NeedWrap
                                        && flush.produced == 0
                                    {
                                        None
                                    } else {
                                        Some(Ok(flush.handshake))
                                    }
                                }
                            }
                        }
                    };
                    match next {
                        None => return true,
                        Some(Ok(handshake)) => status = handshake,
                        Some(Err(error)) => {
                            tracing::warn!(client = client_id, %error, "client handshake failed");
                            self.fail_client(client_id);
                            return false;
                        }
                    }
                }
                HandshakeStatus::Finished => {
                    ensure!(self.on_client_finished(client_id), false);
                    status = self.client_status(client_id);
                }
                HandshakeStatus::NotHandshaking | HandshakeStatus::NeedUnwrap => return true,
            }
        }
    }

    /// FINISHED: open the application reply and grant the wrap-path window
    fn on_client_finished(&mut self, client_id: u64) -> bool {
        let (sni, alpn) = {
            let Self {
                clients, engines, ..
            } = self;
            let Some(conn) = clients.get(&client_id) else {
                return false;
            };
            let Some(engine) = engines.get_mut(conn.engine) else {
                return false;
            };
            let sni = engine.server_name().map(str::to_string);
            let alpn = engine
                .alpn_protocol()
                .and_then(|protocol| core::str::from_utf8(protocol).ok())
                .map(str::to_string);
            (sni, alpn)
        };

        let app_out = {
            let Some(conn) = self.clients.get(&client_id) else {
                return false;
            };
            self.env.supply_reply_id(conn.app_in)
        };

        let Self {
            clients,
            throttles,
            env,
            ..
        } = self;
        let Some(conn) = clients.get_mut(&client_id) else {
            return false;
        };
        conn.handshaking = false;
        conn.app_out = Some(app_out);
        throttles.insert(app_out.as_u64(), Throttle::ClientApp { client_id });

        let extension = TlsBeginExt {
            hostname: sni.as_deref(),
            application_protocol: alpn.as_deref(),
        }
        .encode_to_vec();
        send_begin(
            env,
            app_out,
            conn.route_id,
            conn.trace_id,
            conn.authorization,
            conn.peer_correlation_id,
            &extension,
        );

        // open the application window now that cleartext can flow
        let credit = conn.net_budget.max(0);
        if credit > 0 {
            conn.app_budget = credit;
            send_window(
                env,
                conn.app_in,
                conn.trace_id,
                credit as u32,
                conn.net_padding + MAX_RECORD_OVERHEAD as u32,
            );
        }

        tracing::debug!(client = client_id, app_out = %app_out, "client handshake finished");
        true
    }

    /// BEGIN of the network reply stream, paired by our correlation
    pub(crate) fn on_client_net_reply_begin(&mut self, client_id: u64, begin: &Begin) {
        let credit = self
            .config
            .handshake_window_bytes
            .min(self.client_pools.network.slot_capacity()) as u32;

        let granted = {
            let Some(conn) = self.clients.get_mut(&client_id) else {
                send_reset(&mut self.env, begin.stream_id, begin.trace_id);
                return;
            };
            conn.net_in = Some(begin.stream_id);
            conn.net_in_budget = credit as i64;
            conn.trace_id = begin.trace_id;
            conn.net_in_budget > 0
        };

        self.streams
            .insert(begin.stream_id.as_u64(), StreamKind::ClientNet { client_id });
        if granted {
            send_window(&mut self.env, begin.stream_id, begin.trace_id, credit, 0);
        }
    }

    /// DATA from the application: wrap and forward to the network
    pub(crate) fn on_client_app_data(&mut self, client_id: u64, data: &Data) {
        let outcome = {
            let Self {
                clients,
                engines,
                env,
                scratch,
                ..
            } = self;
            let Some(conn) = clients.get_mut(&client_id) else {
                return;
            };
            conn.trace_id = data.trace_id;
            conn.counters.frames_read.increment();
            conn.app_budget -= data.payload.len() as i64 + data.padding as i64;

            if conn.app_budget < 0 {
                Some(Kind::BudgetExceeded.err())
            } else {
                let Some(engine) = engines.get_mut(conn.engine) else {
                    return;
                };
                let mut remaining = data.payload;
                let mut failure = None;
                while !remaining.is_empty() && !engine.is_outbound_done() {
                    match engine.wrap(remaining, &mut scratch[..]) {
                        Err(error) => {
                            failure = Some(error);
                            break;
                        }
                        Ok(flush) => {
                            if flush.produced > 0 {
                                send_data(
                                    env,
                                    conn.net_out,
                                    conn.trace_id,
                                    conn.net_padding,
                                    &scratch[..flush.produced],
                                );
                                conn.net_budget -=
                                    flush.produced as i64 + conn.net_padding as i64;
                                conn.counters.frames_written.increment();
                                conn.counters.bytes_written.add(flush.produced as u64);
                            }
                            if flush.consumed == 0 && flush.produced == 0 {
                                break;
                            }
                            remaining = &remaining[flush.consumed..];
                        }
                    }
                }
                failure
            }
        };

        if let Some(error) = outcome {
            tracing::warn!(client = client_id, %error, "client wrap failed");
            self.fail_client(client_id);
        }
    }

    pub(crate) fn on_client_app_end(&mut self, client_id: u64, trace_id: u64) {
        {
            let Self {
                clients, engines, ..
            } = self;
            let Some(conn) = clients.get_mut(&client_id) else {
                return;
            };
            conn.trace_id = trace_id;
            conn.app_ended = true;
            if let Some(engine) = engines.get_mut(conn.engine) {
                engine.close_outbound();
            }
        }
        self.flush_client_outbound(client_id);
    }

    pub(crate) fn on_client_app_abort(&mut self, client_id: u64, trace_id: u64) {
        let net_out = {
            let Some(conn) = self.clients.get_mut(&client_id) else {
                return;
            };
            conn.trace_id = trace_id;
            conn.net_end_sent = true;
            conn.net_out
        };
        send_abort(&mut self.env, net_out, trace_id);
        self.fail_client_quietly(client_id);
    }

    /// Drains pending records (including close_notify) toward the network
    fn flush_client_outbound(&mut self, client_id: u64) {
        let done = {
            let Self {
                clients,
                engines,
                env,
                scratch,
                ..
            } = self;
            let Some(conn) = clients.get_mut(&client_id) else {
                return;
            };
            let Some(engine) = engines.get_mut(conn.engine) else {
                return;
            };
            loop {
                if engine.is_outbound_done() {
                    break true;
                }
                let window = conn.net_budget - conn.net_padding as i64;
                if window <= 0 {
                    break false;
                }
                let cap = (window as usize).min(scratch.len());
                match engine.wrap(&[], &mut scratch[..cap]) {
                    Err(_) => break true,
                    Ok(flush) => {
                        if flush.produced > 0 {
                            send_data(
                                env,
                                conn.net_out,
                                conn.trace_id,
                                conn.net_padding,
                                &scratch[..flush.produced],
                            );
                            conn.net_budget -= flush.produced as i64 + conn.net_padding as i64;
                            conn.counters.frames_written.increment();
                            conn.counters.bytes_written.add(flush.produced as u64);
                        } else {
                            break false;
                        }
                    }
                }
            }
        };

        ensure!(done);

        let (net_out, trace_id, finished) = {
            let Some(conn) = self.clients.get_mut(&client_id) else {
                return;
            };
            ensure!(!conn.net_end_sent);
            conn.net_end_sent = true;
            (conn.net_out, conn.trace_id, conn.app_end_sent)
        };
        send_end(&mut self.env, net_out, trace_id);
        if finished {
            self.teardown_client(client_id);
        }
    }

    /// WINDOW from the network on the initial stream
    pub(crate) fn on_client_net_window(&mut self, client_id: u64, window: &Window) {
        let next = {
            let Some(conn) = self.clients.get_mut(&client_id) else {
                return;
            };
            conn.net_budget += window.credit as i64;
            conn.net_padding = window.padding;

            if conn.handshaking {
                if conn.pending_tasks == 0 {
                    Some(None)
                } else {
                    None
                }
            } else if conn.app_ended {
                if conn.net_end_sent {
                    None
                } else {
                    Some(Some(true))
                }
            } else {
                // propagate credit to the application
                let delta = conn.net_budget - conn.app_budget;
                if delta > 0 {
                    conn.app_budget += delta;
                    send_window(
                        &mut self.env,
                        conn.app_in,
                        conn.trace_id,
                        delta as u32,
                        window.padding + MAX_RECORD_OVERHEAD as u32,
                    );
                }
                None
            }
        };

        match next {
            Some(None) => {
                let status = self.client_status(client_id);
                self.client_cycle(client_id, status);
            }
            Some(Some(_)) => self.flush_client_outbound(client_id),
            None => {}
        }
    }

    /// RESET from the network on the initial stream
    pub(crate) fn on_client_net_reset(&mut self, client_id: u64, trace_id: u64) {
        if let Some(conn) = self.clients.get_mut(&client_id) {
            conn.trace_id = trace_id;
            conn.net_end_sent = true;
        }
        self.fail_client(client_id);
    }

    /// DATA from the network on the reply stream: unwrap toward the app
    pub(crate) fn on_client_net_data(&mut self, client_id: u64, data: &Data) {
        let staged = {
            let Self {
                clients,
                client_pools,
                ..
            } = self;
            let Some(conn) = clients.get_mut(&client_id) else {
                return;
            };
            let ClientConnection {
                trace_id,
                counters,
                net_in_budget,
                network_slot,
                network_slot_offset,
                ..
            } = conn;

            *trace_id = data.trace_id;
            counters.frames_read.increment();
            counters.bytes_read.add(data.payload.len() as u64);
            *net_in_budget -= data.payload.len() as i64 + data.padding as i64;

            if *net_in_budget < 0 {
                false
            } else if data.payload.is_empty() {
                true
            } else {
                if network_slot.is_none() {
                    *network_slot = client_pools.network.acquire();
                }
                match network_slot.as_mut() {
                    None => false,
                    Some(slot) => {
                        let offset = *network_slot_offset;
                        if offset + data.payload.len() > slot.capacity() {
                            false
                        } else {
                            slot.bytes_mut()[offset..offset + data.payload.len()]
                                .copy_from_slice(data.payload);
                            *network_slot_offset = offset + data.payload.len();
                            true
                        }
                    }
                }
            }
        };

        if !staged {
            self.fail_client(client_id);
            return;
        }
        self.client_process_network(client_id);
    }

    fn client_process_network(&mut self, client_id: u64) {
        'pump: loop {
            loop {
                match self.client_unwrap_step(client_id) {
                    Step::Gone | Step::Parked => return,
                    Step::Continue => {}
                    Step::Handshake(status) => {
                        ensure!(self.client_cycle(client_id, status));
                        let parked = match self.clients.get(&client_id) {
                            Some(conn) => conn.pending_tasks > 0,
                            None => return,
                        };
                        ensure!(!parked);
                    }
                    Step::Stalled | Step::Closed => break,
                    Step::Failed(error) => {
                        tracing::warn!(client = client_id, %error, "client record pump failed");
                        self.fail_client(client_id);
                        return;
                    }
                }
            }

            self.replenish_client_network(client_id);
            let emitted = self.flush_client_app_data(client_id);
            self.maybe_finish_client_inbound(client_id);

            let residue = match self.clients.get(&client_id) {
                Some(conn) => conn.network_slot_offset,
                None => return,
            };
            if emitted && residue > 0 {
                continue 'pump;
            }
            return;
        }
    }

    fn client_unwrap_step(&mut self, client_id: u64) -> Step {
        let Self {
            clients,
            engines,
            client_pools,
            scratch,
            ..
        } = self;
        let Some(conn) = clients.get_mut(&client_id) else {
            return Step::Gone;
        };
        if conn.pending_tasks > 0 {
            return Step::Parked;
        }

        let handshaking = conn.handshaking;

        if !handshaking && conn.application_slot.is_none() {
            match client_pools.application.acquire() {
                Some(slot) => conn.application_slot = Some(slot),
                None => return Step::Failed(Kind::NoSlot.err()),
            }
        }

        let ClientConnection {
            engine,
            network_slot,
            network_slot_offset,
            application_slot,
            application_slot_offset,
            ..
        } = conn;

        let Some(engine) = engines.get_mut(*engine) else {
            return Step::Gone;
        };

        let offset = *network_slot_offset;
        let src = match network_slot.as_ref() {
            Some(slot) => &slot.bytes()[..offset],
            None => &[],
        };

        let app_offset = *application_slot_offset;
        let dst = if handshaking {
            &mut scratch[..]
        } else {
            match application_slot.as_mut() {
                Some(slot) => &mut slot.bytes_mut()[app_offset..],
                None => return Step::Gone,
            }
        };

        let flush = match engine.unwrap(src, dst) {
            Ok(flush) => flush,
            Err(error) => return Step::Failed(error),
        };

        if flush.consumed > 0 {
            if let Some(slot) = network_slot.as_mut() {
                *network_slot_offset = slot.compact(flush.consumed, offset);
            }
        }
        if !handshaking {
            *application_slot_offset = app_offset + flush.produced;
        }

        let stalled = flush.consumed == 0 && flush.produced == 0;

        match flush.status {
            Status::Ok => {
                if handshaking {
                    if stalled && flush.handshake == HandshakeStatus::NeedUnwrap {
                        Step::Stalled
                    } else {
                        Step::Handshake(flush.handshake)
                    }
                } else if stalled {
                    Step::Stalled
                } else {
                    Step::Continue
                }
            }
            Status::BufferUnderflow => {
                let full = *network_slot_offset == client_pools.network.slot_capacity();
                if full && flush.consumed == 0 {
                    Step::Failed(Kind::RecordOversize.err())
                } else {
                    Step::Stalled
                }
            }
            Status::BufferOverflow => Step::Stalled,
            Status::Closed => Step::Closed,
        }
    }

    fn replenish_client_network(&mut self, client_id: u64) {
        let Self {
            clients,
            client_pools,
            env,
            ..
        } = self;
        let Some(conn) = clients.get_mut(&client_id) else {
            return;
        };

        if conn.network_slot_offset == 0 {
            if let Some(slot) = conn.network_slot.take() {
                client_pools.network.release(slot);
            }
        }

        ensure!(!conn.net_ended);
        let Some(net_in) = conn.net_in else {
            return;
        };

        let capacity = client_pools.network.slot_capacity() as i64;
        let credit = capacity - conn.network_slot_offset as i64 - conn.net_in_budget;
        if credit > 0 {
            conn.net_in_budget += credit;
            send_window(env, net_in, conn.trace_id, credit as u32, 0);
        }
    }

    fn flush_client_app_data(&mut self, client_id: u64) -> bool {
        let Self {
            clients,
            client_pools,
            env,
            ..
        } = self;
        let Some(conn) = clients.get_mut(&client_id) else {
            return false;
        };
        let Some(app_out) = conn.app_out else {
            return false;
        };

        let mut emitted = false;
        if conn.application_slot_offset > 0 {
            let window = (conn.app_out_budget - conn.app_out_padding as i64)
                .min(MAX_PAYLOAD_LEN as i64);
            if window > 0 {
                let len = conn.application_slot_offset.min(window as usize);
                let trace_id = conn.trace_id;
                let padding = conn.app_out_padding;
                let offset = conn.application_slot_offset;
                if let Some(slot) = conn.application_slot.as_mut() {
                    send_data(env, app_out, trace_id, padding, &slot.bytes()[..len]);
                    let remaining = slot.compact(len, offset);
                    conn.application_slot_offset = remaining;
                    conn.app_out_budget -= len as i64 + padding as i64;
                    emitted = true;
                }
            }
        }

        if conn.application_slot_offset == 0 {
            if let Some(slot) = conn.application_slot.take() {
                client_pools.application.release(slot);
            }
        }

        emitted
    }

    fn maybe_finish_client_inbound(&mut self, client_id: u64) {
        let finish = {
            let Self {
                clients, engines, ..
            } = self;
            let Some(conn) = clients.get_mut(&client_id) else {
                return;
            };
            let inbound_done = conn.net_ended
                || engines
                    .get_mut(conn.engine)
                    .map(|engine| engine.is_inbound_done())
                    .unwrap_or(true);
            conn.app_out.is_some()
                && !conn.app_end_sent
                && conn.application_slot_offset == 0
                && inbound_done
        };
        ensure!(finish);

        let (app_out, trace_id, outbound_done) = {
            let Some(conn) = self.clients.get_mut(&client_id) else {
                return;
            };
            conn.app_end_sent = true;
            (
                conn.app_out.unwrap_or(conn.app_in),
                conn.trace_id,
                conn.net_end_sent,
            )
        };
        send_end(&mut self.env, app_out, trace_id);
        if outbound_done {
            self.teardown_client(client_id);
        }
    }

    /// WINDOW from the application on the reply stream
    pub(crate) fn on_client_app_window(&mut self, client_id: u64, window: &Window) {
        {
            let Some(conn) = self.clients.get_mut(&client_id) else {
                return;
            };
            conn.app_out_budget += window.credit as i64;
            conn.app_out_padding = window.padding;
        }
        self.flush_client_app_data(client_id);
        self.client_process_network(client_id);
    }

    /// RESET from the application on the reply stream
    pub(crate) fn on_client_app_reset(&mut self, client_id: u64, trace_id: u64) {
        if let Some(conn) = self.clients.get_mut(&client_id) {
            conn.trace_id = trace_id;
            conn.app_end_sent = true;
        }
        self.fail_client(client_id);
    }

    pub(crate) fn on_client_net_end(&mut self, client_id: u64, trace_id: u64) {
        let handshaking = {
            let Self {
                clients, engines, ..
            } = self;
            let Some(conn) = clients.get_mut(&client_id) else {
                return;
            };
            conn.trace_id = trace_id;
            conn.net_ended = true;
            if let Some(engine) = engines.get_mut(conn.engine) {
                engine.close_inbound();
            }
            conn.handshaking
        };

        if handshaking {
            self.fail_client(client_id);
            return;
        }

        self.flush_client_app_data(client_id);
        self.maybe_finish_client_inbound(client_id);
    }

    pub(crate) fn on_client_net_abort(&mut self, client_id: u64, trace_id: u64) {
        if let Some(conn) = self.clients.get_mut(&client_id) {
            conn.trace_id = trace_id;
            conn.net_ended = true;
        }
        self.fail_client(client_id);
    }

    pub(crate) fn on_client_flush(&mut self, client_id: u64) {
        let resume = {
            let Some(conn) = self.clients.get_mut(&client_id) else {
                return;
            };
            ensure!(conn.pending_tasks > 0);
            conn.pending_tasks -= 1;
            if conn.pending_tasks == 0 {
                conn.cancels.clear();
                Some(conn.network_slot_offset > 0)
            } else {
                None
            }
        };
        match resume {
            Some(true) => self.client_process_network(client_id),
            Some(false) => {
                let status = self.client_status(client_id);
                self.client_cycle(client_id, status);
            }
            None => {}
        }
    }

    /// Emits the error frames on every open leg, then releases
    pub(crate) fn fail_client(&mut self, client_id: u64) {
        let (app_in, app_out, net_out, trace_id) = {
            let Self {
                clients, engines, ..
            } = self;
            let Some(conn) = clients.get_mut(&client_id) else {
                return;
            };
            for cancel in conn.cancels.drain(..) {
                cancel.cancel();
            }
            conn.pending_tasks = 0;
            if let Some(engine) = engines.get_mut(conn.engine) {
                engine.close_inbound();
                engine.close_outbound();
            }
            (
                conn.app_in,
                conn.app_out.filter(|_| !conn.app_end_sent),
                (!conn.net_end_sent).then_some(conn.net_out),
                conn.trace_id,
            )
        };

        send_reset(&mut self.env, app_in, trace_id);
        if let Some(app_out) = app_out {
            send_abort(&mut self.env, app_out, trace_id);
        }
        if let Some(net_out) = net_out {
            send_abort(&mut self.env, net_out, trace_id);
        }

        self.fail_client_quietly(client_id);
    }

    /// Releases every resource the client holds; emits nothing
    fn fail_client_quietly(&mut self, client_id: u64) {
        self.teardown_client(client_id);
    }

    fn teardown_client(&mut self, client_id: u64) {
        let Some(mut conn) = self.clients.remove(&client_id) else {
            return;
        };
        for cancel in conn.cancels.drain(..) {
            cancel.cancel();
        }
        self.streams.remove(&client_id);
        if let Some(net_in) = conn.net_in {
            self.streams.remove(&net_in.as_u64());
        }
        self.throttles.remove(&conn.net_out.as_u64());
        if let Some(app_out) = conn.app_out {
            self.throttles.remove(&app_out.as_u64());
        }
        if let Some(slot) = conn.network_slot.take() {
            self.client_pools.network.release(slot);
        }
        if let Some(slot) = conn.application_slot.take() {
            self.client_pools.application.release(slot);
        }
        self.engines.release(conn.engine);
    }
}
