// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Handshake coordination
//!
//! A status-dispatch loop runs whenever a wrap/unwrap returns, a
//! `FLUSH_HANDSHAKE` signal fires, or a reply-side WINDOW arrives while
//! still handshaking. While delegated tasks are in flight the connection is
//! parked: the engine is not re-entrant during delegated work and must not
//! be touched until the count returns to zero.

use crate::{
    engine::HandshakeStatus,
    error::Error,
    frame::extension::TlsBeginExt,
    route::Role,
    stream::{accept::StreamState, correlation::Correlated, id::Id},
    task::CancelHandle,
    worker::{send_begin, send_data, Environment, Throttle, Worker},
};
use axon_codec::EncoderValue;
use core::mem;

/// Handshake-only state, carried from the accept pump into the correlation
/// map at FINISHED and out again at the reply's BEGIN
#[derive(Debug)]
pub(crate) struct Handshake {
    pub accept_id: u64,
    pub reply_id: Id,
    pub engine: u64,
    /// The network route the accept stream arrived on
    pub route_id: u64,
    pub authorization: u64,
    pub pending_tasks: u32,
    pub cancels: Vec<CancelHandle>,
    /// Credit the network has granted on the reply stream
    pub network_reply_budget: i64,
    pub network_reply_padding: u32,
}

impl Handshake {
    pub(crate) fn cancel_pending(&mut self) {
        for cancel in self.cancels.drain(..) {
            cancel.cancel();
        }
        self.pending_tasks = 0;
    }
}

enum WrapOutcome {
    Continue(HandshakeStatus),
    Stall,
    Fail(Error),
}

impl<E: Environment> Worker<E> {
    /// Drives the handshake status loop for a server accept connection
    ///
    /// Returns `false` if the connection was torn down.
    pub(crate) fn handshake_cycle(&mut self, accept_id: u64, mut status: HandshakeStatus) -> bool {
        loop {
            match status {
                HandshakeStatus::NeedTask => {
                    let parked = {
                        let Self {
                            accepts,
                            engines,
                            env,
                            ..
                        } = self;
                        let Some(conn) = accepts.get_mut(&accept_id) else {
                            return false;
                        };
                        let StreamState::Handshaking(handshake) = &mut conn.state else {
                            return true;
                        };
                        let Some(engine) = engines.get_mut(conn.engine) else {
                            return false;
                        };
                        let mut drained = 0;
                        while let Some(task) = engine.delegated_task() {
                            let cancel = env.schedule(conn.stream_id, task);
                            handshake.cancels.push(cancel);
                            handshake.pending_tasks += 1;
                            drained += 1;
                        }
                        if handshake.pending_tasks > 0 || drained == 0 {
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
                    let outcome = {
                        let Self {
                            accepts,
                            engines,
                            env,
                            scratch,
                            ..
                        } = self;
                        let Some(conn) = accepts.get_mut(&accept_id) else {
                            return false;
                        };
                        // a post-handshake wrap demand is a no-op hook
                        let StreamState::Handshaking(handshake) = &mut conn.state else {
                            return true;
                        };
                        let window =
                            handshake.network_reply_budget - handshake.network_reply_padding as i64;
                        if window <= 0 {
                            WrapOutcome::Stall
                        } else {
                            let cap = (window as usize).min(scratch.len());
                            let Some(engine) = engines.get_mut(conn.engine) else {
                                return false;
                            };
                            match engine.wrap(&[], &mut scratch[..cap]) {
                                Err(error) => WrapOutcome::Fail(error),
                                Ok(flush) => {
                                    if flush.produced > 0 {
                                        send_data(
                                            env,
                                            handshake.reply_id,
                                            conn.trace_id,
                                            handshake.network_reply_padding,
                                            &scratch[..flush.produced],
                                        );
                                        handshake.network_reply_budget -= flush.produced as i64
                                            + handshake.network_reply_padding as i64;
                                        conn.counters.frames_written.increment();
                                        conn.counters.bytes_written.add(flush.produced as u64);
                                    }
                                    if flush.handshake == HandshakeStatus::NeedWrap
                                        && flush.produced == 0
                                    {
                                        // backpressure; await a reply window
                                        WrapOutcome::Stall
                                    } else {
                                        WrapOutcome::Continue(flush.handshake)
                                    }
                                }
                            }
                        }
                    };
                    match outcome {
                        WrapOutcome::Continue(next) => status = next,
                        WrapOutcome::Stall => return true,
                        WrapOutcome::Fail(error) => {
                            tracing::warn!(accept = accept_id, %error, "handshake failed");
                            self.fail_accept(accept_id);
                            return false;
                        }
                    }
                }
                HandshakeStatus::Finished => {
                    ensure!(self.on_finished(accept_id), false);
                    status = {
                        let Some(conn) = self.accepts.get(&accept_id) else {
                            return false;
                        };
                        let engine = conn.engine;
                        match self.engines.get_mut(engine) {
                            Some(engine) => engine.handshake_status(),
                            None => return false,
                        }
                    };
                }
                HandshakeStatus::NotHandshaking | HandshakeStatus::NeedUnwrap => return true,
            }
        }
    }

    /// FINISHED: select the application route by SNI/ALPN and open the
    /// downstream stream, parking the handshake for the reply
    pub(crate) fn on_finished(&mut self, accept_id: u64) -> bool {
        let (sni, alpn) = {
            let Self {
                accepts, engines, ..
            } = self;
            let Some(conn) = accepts.get(&accept_id) else {
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

        let target = {
            let Some(conn) = self.accepts.get(&accept_id) else {
                return false;
            };
            let registry = self.registry.read();
            registry
                .routes
                .application(Role::Server, conn.authorization, sni.as_deref(), alpn.as_deref())
                .map(|route| route.route_id)
        };

        let Some(target_route_id) = target else {
            tracing::warn!(accept = accept_id, sni = ?sni, alpn = ?alpn, "no application route");
            self.fail_accept(accept_id);
            return false;
        };

        let correlation_id = self.env.next_correlation_id();
        let app_id = self.env.next_initial_id();
        debug_assert!(!app_id.is_reply());

        let Self {
            accepts,
            correlations,
            engines,
            throttles,
            env,
            ..
        } = self;
        let Some(conn) = accepts.get_mut(&accept_id) else {
            return false;
        };
        let handshake = match mem::replace(&mut conn.state, StreamState::AfterHandshake) {
            StreamState::Handshaking(handshake) => handshake,
            StreamState::AfterHandshake => return true,
        };

        // the parked handshake keeps the engine alive for the reply side
        engines.retain(conn.engine);
        throttles.insert(
            handshake.reply_id.as_u64(),
            Throttle::Correlated { correlation_id },
        );
        throttles.insert(app_id.as_u64(), Throttle::AcceptApp { accept_id });

        let extension = TlsBeginExt {
            hostname: sni.as_deref(),
            application_protocol: alpn.as_deref(),
        }
        .encode_to_vec();
        send_begin(
            env,
            app_id,
            target_route_id,
            conn.trace_id,
            conn.authorization,
            correlation_id,
            &extension,
        );

        correlations.insert(correlation_id, Correlated::Server(handshake));
        conn.app_stream_id = Some(app_id);
        conn.app_correlation_id = Some(correlation_id);
        conn.app_route_id = Some(target_route_id);

        tracing::debug!(
            accept = accept_id,
            app = %app_id,
            correlation = correlation_id,
            sni = ?sni,
            alpn = ?alpn,
            "handshake finished"
        );

        true
    }

    /// WINDOW on the reply stream while the handshake still owns it
    pub(crate) fn on_handshake_window(&mut self, accept_id: u64, window: &crate::frame::Window) {
        let resume = {
            let Some(conn) = self.accepts.get_mut(&accept_id) else {
                return;
            };
            match &mut conn.state {
                StreamState::Handshaking(handshake) => {
                    handshake.network_reply_budget += window.credit as i64;
                    handshake.network_reply_padding = window.padding;
                    handshake.pending_tasks == 0
                }
                StreamState::AfterHandshake => false,
            }
        };
        if resume {
            let status = {
                let Some(conn) = self.accepts.get(&accept_id) else {
                    return;
                };
                let engine = conn.engine;
                match self.engines.get_mut(engine) {
                    Some(engine) => engine.handshake_status(),
                    None => return,
                }
            };
            self.handshake_cycle(accept_id, status);
        }
    }

    /// RESET on the reply stream during the handshake
    pub(crate) fn on_handshake_reset(&mut self, accept_id: u64, _trace_id: u64) {
        self.fail_accept(accept_id);
    }

    /// FLUSH_HANDSHAKE signal: a delegated task completed
    pub(crate) fn on_accept_flush(&mut self, accept_id: u64) {
        let resume = {
            let Some(conn) = self.accepts.get_mut(&accept_id) else {
                return;
            };
            let StreamState::Handshaking(handshake) = &mut conn.state else {
                return;
            };
            handshake.pending_tasks = handshake.pending_tasks.saturating_sub(1);
            if handshake.pending_tasks == 0 {
                handshake.cancels.clear();
                if conn.network_slot_offset > 0 {
                    Some(true)
                } else {
                    Some(false)
                }
            } else {
                None
            }
        };
        match resume {
            // buffered network bytes take priority over the status loop
            Some(true) => self.process_network(accept_id),
            Some(false) => {
                let status = {
                    let Some(conn) = self.accepts.get(&accept_id) else {
                        return;
                    };
                    let engine = conn.engine;
                    match self.engines.get_mut(engine) {
                        Some(engine) => engine.handshake_status(),
                        None => return,
                    }
                };
                self.handshake_cycle(accept_id, status);
            }
            None => {}
        }
    }
}
