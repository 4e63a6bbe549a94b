// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Server accept pump: network ciphertext in, application cleartext out
//!
//! Inbound DATA stages into the network slot, the unwrap loop feeds the
//! engine and compacts the residue, and decrypted bytes wait in the
//! application slot for downstream window. Every exit path returns both
//! slots to their pools.

use crate::{
    counter::RouteCounters,
    engine::{rustls::ServerEngine, HandshakeStatus, Status},
    error::{Error, Kind},
    frame::{data::MAX_PAYLOAD_LEN, Begin, Data, Window},
    slot::Slot,
    store::StoreContext,
    stream::{handshake::Handshake, id::Id},
    worker::{
        hello_selector, send_abort, send_begin, send_data, send_end, send_reset, send_window,
        Environment, StreamKind, Throttle, Worker,
    },
};
use std::sync::Arc;

/// Accept-stream phase; `BeforeBegin` is unrepresentable because the
/// connection only exists once its BEGIN arrived
#[derive(Debug)]
pub(crate) enum StreamState {
    Handshaking(Handshake),
    AfterHandshake,
}

#[derive(Debug)]
pub(crate) struct AcceptConnection {
    pub stream_id: Id,
    pub reply_id: Id,
    pub route_id: u64,
    pub authorization: u64,
    pub trace_id: u64,
    pub engine: u64,
    pub state: StreamState,
    /// Credit granted to the network on the accept stream
    pub network_budget: i64,
    pub network_padding: u32,
    /// Credit the application granted on the downstream stream
    pub application_budget: i64,
    pub application_padding: u32,
    pub network_slot: Option<Slot>,
    pub network_slot_offset: usize,
    pub application_slot: Option<Slot>,
    pub application_slot_offset: usize,
    pub app_stream_id: Option<Id>,
    pub app_correlation_id: Option<u64>,
    pub app_route_id: Option<u64>,
    /// Transport END seen on the accept stream
    pub inbound_ended: bool,
    pub app_end_sent: bool,
    /// The paired reply pump finished its outbound direction
    pub reply_done: bool,
    pub counters: RouteCounters,
}

impl AcceptConnection {
    fn parked(&self) -> bool {
        matches!(&self.state, StreamState::Handshaking(handshake) if handshake.pending_tasks > 0)
    }

    fn handshaking(&self) -> bool {
        matches!(&self.state, StreamState::Handshaking(_))
    }
}

enum Step {
    /// Progress was made; run the loop again
    Continue,
    /// A handshake status needs the coordinator
    Handshake(HandshakeStatus),
    /// Underflow/overflow; residue is compacted, exit the loop
    Stalled,
    /// TLS inbound is done
    Closed,
    /// Delegated tasks are in flight; the engine must not be touched
    Parked,
    Failed(Error),
    Gone,
}

impl<E: Environment> Worker<E> {
    pub(crate) fn on_accept_begin(&mut self, begin: &Begin, store: Arc<StoreContext>) {
        let accept_id = begin.stream_id.as_u64();
        let reply_id = self.env.supply_reply_id(begin.stream_id);

        let selector = hello_selector(self.registry.clone(), store, begin.authorization);
        let engine_id = self.engines.insert(Box::new(ServerEngine::new(selector)));

        let credit = self
            .config
            .handshake_window_bytes
            .min(self.server_pools.network.slot_capacity()) as u32;

        send_window(&mut self.env, begin.stream_id, begin.trace_id, credit, 0);
        send_begin(
            &mut self.env,
            reply_id,
            begin.route_id,
            begin.trace_id,
            begin.authorization,
            begin.correlation_id,
            &[],
        );

        self.throttles
            .insert(reply_id.as_u64(), Throttle::Handshake { accept_id });
        self.streams.insert(accept_id, StreamKind::Accept);
        self.accepts.insert(
            accept_id,
            AcceptConnection {
                stream_id: begin.stream_id,
                reply_id,
                route_id: begin.route_id,
                authorization: begin.authorization,
                trace_id: begin.trace_id,
                engine: engine_id,
                state: StreamState::Handshaking(Handshake {
                    accept_id,
                    reply_id,
                    engine: engine_id,
                    route_id: begin.route_id,
                    authorization: begin.authorization,
                    pending_tasks: 0,
                    cancels: Vec::new(),
                    network_reply_budget: 0,
                    network_reply_padding: 0,
                }),
                network_budget: credit as i64,
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
                counters: self.counters.route(begin.route_id),
            },
        );

        tracing::debug!(accept = accept_id, reply = %reply_id, route = begin.route_id, "accepted");
    }

    pub(crate) fn on_accept_data(&mut self, accept_id: u64, data: &Data) {
        let staged = {
            let Self {
                accepts,
                server_pools,
                ..
            } = self;
            let Some(conn) = accepts.get_mut(&accept_id) else {
                return;
            };
            let AcceptConnection {
                trace_id,
                counters,
                network_budget,
                network_slot,
                network_slot_offset,
                ..
            } = conn;

            *trace_id = data.trace_id;
            counters.frames_read.increment();
            counters.bytes_read.add(data.payload.len() as u64);
            *network_budget -= data.payload.len() as i64 + data.padding as i64;

            if *network_budget < 0 {
                tracing::warn!(accept = accept_id, "network budget overrun");
                false
            } else if data.payload.is_empty() {
                true
            } else {
                if network_slot.is_none() {
                    *network_slot = server_pools.network.acquire();
                }
                match network_slot.as_mut() {
                    None => {
                        tracing::warn!(accept = accept_id, "no network slot");
                        false
                    }
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
            self.fail_accept(accept_id);
            return;
        }

        self.process_network(accept_id);
    }

    /// The unwrap loop: drain staged ciphertext (and the engine's own
    /// residue) until the engine stalls, closes, parks, or fails
    pub(crate) fn process_network(&mut self, accept_id: u64) {
        'pump: loop {
            loop {
                match self.unwrap_step(accept_id) {
                    Step::Gone | Step::Parked => return,
                    Step::Continue => {}
                    Step::Handshake(status) => {
                        ensure!(self.handshake_cycle(accept_id, status));
                        let parked = match self.accepts.get(&accept_id) {
                            Some(conn) => conn.parked(),
                            None => return,
                        };
                        ensure!(!parked);
                    }
                    Step::Stalled | Step::Closed => break,
                    Step::Failed(error) => {
                        tracing::warn!(accept = accept_id, %error, "record pump failed");
                        self.fail_accept(accept_id);
                        return;
                    }
                }
            }

            self.replenish_network(accept_id);
            let emitted = self.flush_app_data(accept_id);
            self.maybe_finish_accept(accept_id);

            // a freed application slot may unblock buffered ciphertext
            let residue = match self.accepts.get(&accept_id) {
                Some(conn) => conn.network_slot_offset,
                None => return,
            };
            if emitted && residue > 0 {
                continue 'pump;
            }
            return;
        }
    }

    fn unwrap_step(&mut self, accept_id: u64) -> Step {
        let Self {
            accepts,
            engines,
            server_pools,
            scratch,
            ..
        } = self;
        let Some(conn) = accepts.get_mut(&accept_id) else {
            return Step::Gone;
        };
        if conn.parked() {
            return Step::Parked;
        }

        let handshaking = conn.handshaking();

        if !handshaking && conn.application_slot.is_none() {
            match server_pools.application.acquire() {
                Some(slot) => conn.application_slot = Some(slot),
                None => return Step::Failed(Kind::NoSlot.err()),
            }
        }

        let AcceptConnection {
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
                // residue filling the whole slot can never complete a record
                let full = *network_slot_offset == server_pools.network.slot_capacity();
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

    /// Replenishes the accept stream's credit up to one slot of headroom
    fn replenish_network(&mut self, accept_id: u64) {
        let Self {
            accepts,
            server_pools,
            env,
            ..
        } = self;
        let Some(conn) = accepts.get_mut(&accept_id) else {
            return;
        };

        if conn.network_slot_offset == 0 {
            if let Some(slot) = conn.network_slot.take() {
                server_pools.network.release(slot);
            }
        }

        ensure!(!conn.inbound_ended);

        let capacity = server_pools.network.slot_capacity() as i64;
        let credit = capacity - conn.network_slot_offset as i64 - conn.network_budget;
        if credit > 0 {
            conn.network_budget += credit;
            send_window(
                env,
                conn.stream_id,
                conn.trace_id,
                credit as u32,
                conn.network_padding,
            );
        }
    }

    /// Emits buffered cleartext downstream within the application window
    pub(crate) fn flush_app_data(&mut self, accept_id: u64) -> bool {
        let Self {
            accepts,
            server_pools,
            env,
            ..
        } = self;
        let Some(conn) = accepts.get_mut(&accept_id) else {
            return false;
        };
        let Some(app_id) = conn.app_stream_id else {
            return false;
        };

        let mut emitted = false;
        if conn.application_slot_offset > 0 {
            let window = (conn.application_budget - conn.application_padding as i64)
                .min(MAX_PAYLOAD_LEN as i64);
            if window > 0 {
                let len = conn.application_slot_offset.min(window as usize);
                let trace_id = conn.trace_id;
                let padding = conn.application_padding;
                let offset = conn.application_slot_offset;
                if let Some(slot) = conn.application_slot.as_mut() {
                    send_data(env, app_id, trace_id, padding, &slot.bytes()[..len]);
                    let remaining = slot.compact(len, offset);
                    conn.application_slot_offset = remaining;
                    conn.application_budget -= len as i64 + padding as i64;
                    emitted = true;
                }
            }
        }

        if conn.application_slot_offset == 0 {
            if let Some(slot) = conn.application_slot.take() {
                server_pools.application.release(slot);
            }
        }

        emitted
    }

    /// Completes the decrypt path once TLS inbound is done and the
    /// application slot has drained
    fn maybe_finish_accept(&mut self, accept_id: u64) {
        let finish = {
            let Self {
                accepts, engines, ..
            } = self;
            let Some(conn) = accepts.get_mut(&accept_id) else {
                return;
            };
            let inbound_done = conn.inbound_ended
                || engines
                    .get_mut(conn.engine)
                    .map(|engine| engine.is_inbound_done())
                    .unwrap_or(true);
            conn.app_stream_id.is_some()
                && !conn.app_end_sent
                && conn.application_slot_offset == 0
                && inbound_done
        };
        ensure!(finish);

        let (app_id, trace_id, correlation) = {
            let Some(conn) = self.accepts.get_mut(&accept_id) else {
                return;
            };
            conn.app_end_sent = true;
            (
                conn.app_stream_id.unwrap_or(conn.stream_id),
                conn.trace_id,
                conn.app_correlation_id,
            )
        };

        send_end(&mut self.env, app_id, trace_id);

        // END toward the network reply only when the application reply never
        // opened; this also blocks session resumption for that peer
        if let Some(correlation_id) = correlation {
            if let Some(handshake) = self.correlations.remove_server(correlation_id) {
                send_end(&mut self.env, handshake.reply_id, trace_id);
                self.throttles.remove(&handshake.reply_id.as_u64());
                self.engines.release(handshake.engine);
            }
        }

        self.teardown_accept(accept_id);
    }

    pub(crate) fn on_accept_end(&mut self, accept_id: u64, trace_id: u64) {
        let handshaking = {
            let Some(conn) = self.accepts.get_mut(&accept_id) else {
                return;
            };
            conn.trace_id = trace_id;
            conn.inbound_ended = true;
            conn.handshaking()
        };

        if handshaking {
            // cancel delegated work, close outbound, abort the reply
            let reply_id = {
                let Self {
                    accepts, engines, ..
                } = self;
                let Some(conn) = accepts.get_mut(&accept_id) else {
                    return;
                };
                if let StreamState::Handshaking(handshake) = &mut conn.state {
                    handshake.cancel_pending();
                }
                if let Some(engine) = engines.get_mut(conn.engine) {
                    engine.close_outbound();
                }
                conn.reply_id
            };
            send_abort(&mut self.env, reply_id, trace_id);
            self.teardown_accept(accept_id);
            return;
        }

        // half-close without close_notify is permitted
        {
            let Self {
                accepts, engines, ..
            } = self;
            if let Some(conn) = accepts.get_mut(&accept_id) {
                if let Some(engine) = engines.get_mut(conn.engine) {
                    engine.close_inbound();
                }
            }
        }

        self.flush_app_data(accept_id);
        self.maybe_finish_accept(accept_id);
    }

    pub(crate) fn on_accept_abort(&mut self, accept_id: u64, trace_id: u64) {
        let (app_id, reply_id, correlation) = {
            let Self {
                accepts, engines, ..
            } = self;
            let Some(conn) = accepts.get_mut(&accept_id) else {
                return;
            };
            conn.trace_id = trace_id;
            if let StreamState::Handshaking(handshake) = &mut conn.state {
                handshake.cancel_pending();
            }
            if let Some(engine) = engines.get_mut(conn.engine) {
                engine.close_inbound();
            }
            let app_id = conn.app_stream_id.filter(|_| !conn.app_end_sent);
            let reply_id = conn.handshaking().then_some(conn.reply_id);
            (app_id, reply_id, conn.app_correlation_id)
        };

        if let Some(app_id) = app_id {
            send_abort(&mut self.env, app_id, trace_id);
        }
        if let Some(reply_id) = reply_id {
            send_abort(&mut self.env, reply_id, trace_id);
        }
        if let Some(correlation_id) = correlation {
            if let Some(handshake) = self.correlations.remove_server(correlation_id) {
                send_abort(&mut self.env, handshake.reply_id, trace_id);
                self.throttles.remove(&handshake.reply_id.as_u64());
                self.engines.release(handshake.engine);
            }
        }

        self.teardown_accept(accept_id);
    }

    /// WINDOW from the application on the downstream stream
    pub(crate) fn on_accept_app_window(&mut self, accept_id: u64, window: &Window) {
        {
            let Some(conn) = self.accepts.get_mut(&accept_id) else {
                return;
            };
            conn.application_budget += window.credit as i64;
            conn.application_padding = window.padding;
        }
        self.flush_app_data(accept_id);

        let residue = match self.accepts.get(&accept_id) {
            Some(conn) => conn.network_slot_offset > 0 || !conn.inbound_ended,
            None => return,
        };
        if residue {
            // drain ciphertext (or engine residue) the window unblocked
            self.process_network(accept_id);
        } else {
            self.maybe_finish_accept(accept_id);
        }
    }

    /// RESET from the application on the downstream stream
    pub(crate) fn on_accept_app_reset(&mut self, accept_id: u64, trace_id: u64) {
        if let Some(conn) = self.accepts.get_mut(&accept_id) {
            conn.trace_id = trace_id;
            // the application refused the stream; nothing more flows there
            conn.app_end_sent = true;
        }
        self.fail_accept(accept_id);
    }

    /// Protocol or TLS failure: RESET the sender, ABORT the receivers,
    /// release everything
    pub(crate) fn fail_accept(&mut self, accept_id: u64) {
        let (stream_id, trace_id, app_id, handshake_reply, correlation) = {
            let Self {
                accepts, engines, ..
            } = self;
            let Some(conn) = accepts.get_mut(&accept_id) else {
                return;
            };
            if let StreamState::Handshaking(handshake) = &mut conn.state {
                handshake.cancel_pending();
            }
            if let Some(engine) = engines.get_mut(conn.engine) {
                engine.close_inbound();
                engine.close_outbound();
            }
            (
                conn.stream_id,
                conn.trace_id,
                conn.app_stream_id.filter(|_| !conn.app_end_sent),
                conn.handshaking().then_some(conn.reply_id),
                conn.app_correlation_id,
            )
        };

        send_reset(&mut self.env, stream_id, trace_id);
        if let Some(reply_id) = handshake_reply {
            send_abort(&mut self.env, reply_id, trace_id);
        }
        if let Some(app_id) = app_id {
            send_abort(&mut self.env, app_id, trace_id);
        }
        if let Some(correlation_id) = correlation {
            if let Some(handshake) = self.correlations.remove_server(correlation_id) {
                send_abort(&mut self.env, handshake.reply_id, trace_id);
                self.throttles.remove(&handshake.reply_id.as_u64());
                self.engines.release(handshake.engine);
            }
        }

        self.teardown_accept(accept_id);
    }

    /// Releases every resource the accept side holds; emits nothing
    pub(crate) fn teardown_accept(&mut self, accept_id: u64) {
        let Some(mut conn) = self.accepts.remove(&accept_id) else {
            return;
        };
        self.streams.remove(&accept_id);
        if let Some(slot) = conn.network_slot.take() {
            self.server_pools.network.release(slot);
        }
        if let Some(slot) = conn.application_slot.take() {
            self.server_pools.application.release(slot);
        }
        if let Some(app_id) = conn.app_stream_id {
            self.throttles.remove(&app_id.as_u64());
        }
        if let StreamState::Handshaking(handshake) = &mut conn.state {
            handshake.cancel_pending();
            self.throttles.remove(&handshake.reply_id.as_u64());
        }
        self.engines.release(conn.engine);
    }
}
