// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Server reply pump: application cleartext in, network ciphertext out
//!
//! Created by the application's reply BEGIN, which pops the parked
//! handshake and inherits its engine, reply handles, and budgets. The
//! application window is derived from the network window so arriving
//! cleartext is always wrappable without staging.

use crate::{
    counter::RouteCounters,
    engine::MAX_RECORD_OVERHEAD,
    error::Error,
    frame::{Begin, Data, Window},
    stream::{correlation::Correlated, handshake::Handshake, id::Id},
    worker::{
        send_abort, send_data, send_end, send_reset, send_window, Environment, StreamKind,
        Throttle, Worker,
    },
};

#[derive(Debug)]
pub(crate) struct ReplyConnection {
    /// The inbound application reply stream
    pub stream_id: Id,
    /// The outbound network reply stream, inherited from the handshake
    pub reply_id: Id,
    pub accept_id: u64,
    pub engine: u64,
    pub route_id: u64,
    pub trace_id: u64,
    pub network_reply_budget: i64,
    pub network_reply_padding: u32,
    pub application_reply_budget: i64,
    pub application_reply_padding: u32,
    /// Application END seen; close_notify is being drained
    pub ended: bool,
    pub counters: RouteCounters,
}

enum Wrapped {
    Ok,
    Violation,
    Failed(Error),
}

enum Drained {
    Pending,
    Done,
    Failed(Error),
}

impl<E: Environment> Worker<E> {
    /// A reply-direction BEGIN pairs with a parked correlation
    pub(crate) fn on_reply_begin(&mut self, begin: &Begin) {
        match self.correlations.remove(begin.correlation_id) {
            Some(Correlated::Server(handshake)) => self.attach_reply(begin, handshake),
            Some(Correlated::Client { client_id }) => {
                self.on_client_net_reply_begin(client_id, begin)
            }
            None => {
                // a racing RESET may have swept the pairing already; reject
                // idempotently
                tracing::debug!(correlation = begin.correlation_id, "unpaired reply BEGIN");
                send_reset(&mut self.env, begin.stream_id, begin.trace_id);
            }
        }
    }

    fn attach_reply(&mut self, begin: &Begin, handshake: Handshake) {
        let key = begin.stream_id.as_u64();
        let application_reply_padding =
            handshake.network_reply_padding + MAX_RECORD_OVERHEAD as u32;
        let credit = handshake.network_reply_budget.max(0);

        self.throttles.insert(
            handshake.reply_id.as_u64(),
            Throttle::Reply { reply_key: key },
        );
        self.streams.insert(key, StreamKind::Reply);

        if credit > 0 {
            send_window(
                &mut self.env,
                begin.stream_id,
                begin.trace_id,
                credit as u32,
                application_reply_padding,
            );
        }

        self.replies.insert(
            key,
            ReplyConnection {
                stream_id: begin.stream_id,
                reply_id: handshake.reply_id,
                accept_id: handshake.accept_id,
                engine: handshake.engine,
                route_id: handshake.route_id,
                trace_id: begin.trace_id,
                network_reply_budget: handshake.network_reply_budget,
                network_reply_padding: handshake.network_reply_padding,
                application_reply_budget: credit,
                application_reply_padding,
                ended: false,
                counters: self.counters.route(handshake.route_id),
            },
        );

        tracing::debug!(
            reply = key,
            network_reply = %handshake.reply_id,
            accept = handshake.accept_id,
            "reply attached"
        );
    }

    pub(crate) fn on_reply_data(&mut self, key: u64, data: &Data) {
        let outcome = {
            let Self {
                replies,
                engines,
                env,
                scratch,
                ..
            } = self;
            let Some(conn) = replies.get_mut(&key) else {
                return;
            };
            conn.trace_id = data.trace_id;
            conn.counters.frames_read.increment();
            conn.application_reply_budget -= data.payload.len() as i64 + data.padding as i64;

            if conn.application_reply_budget < 0 {
                tracing::warn!(reply = key, "application budget overrun");
                Wrapped::Violation
            } else {
                let Some(engine) = engines.get_mut(conn.engine) else {
                    return;
                };
                let mut remaining = data.payload;
                let mut outcome = Wrapped::Ok;
                while !remaining.is_empty() && !engine.is_outbound_done() {
                    match engine.wrap(remaining, &mut scratch[..]) {
                        Err(error) => {
                            outcome = Wrapped::Failed(error);
                            break;
                        }
                        Ok(flush) => {
                            if flush.produced > 0 {
                                send_data(
                                    env,
                                    conn.reply_id,
                                    conn.trace_id,
                                    conn.network_reply_padding,
                                    &scratch[..flush.produced],
                                );
                                conn.network_reply_budget -= flush.produced as i64
                                    + conn.network_reply_padding as i64;
                                conn.counters.frames_written.increment();
                                conn.counters.bytes_written.add(flush.produced as u64);
                            }
                            // renegotiation-safe no-op: handshake statuses on
                            // the established path need no dispatch
                            if flush.consumed == 0 && flush.produced == 0 {
                                break;
                            }
                            remaining = &remaining[flush.consumed..];
                        }
                    }
                }
                outcome
            }
        };

        match outcome {
            Wrapped::Ok => {}
            Wrapped::Violation => self.fail_reply(key),
            Wrapped::Failed(error) => {
                tracing::warn!(reply = key, %error, "encrypt pump failed");
                self.fail_reply(key);
            }
        }
    }

    pub(crate) fn on_reply_end(&mut self, key: u64, trace_id: u64) {
        {
            let Self {
                replies, engines, ..
            } = self;
            let Some(conn) = replies.get_mut(&key) else {
                return;
            };
            conn.trace_id = trace_id;
            conn.ended = true;
            if let Some(engine) = engines.get_mut(conn.engine) {
                engine.close_outbound();
            }
        }
        self.flush_reply_outbound(key);
    }

    pub(crate) fn on_reply_abort(&mut self, key: u64, trace_id: u64) {
        let reply_id = {
            let Self {
                replies, engines, ..
            } = self;
            let Some(conn) = replies.get_mut(&key) else {
                return;
            };
            conn.trace_id = trace_id;
            if let Some(engine) = engines.get_mut(conn.engine) {
                engine.close_outbound();
            }
            conn.reply_id
        };
        send_abort(&mut self.env, reply_id, trace_id);
        self.finish_reply(key);
    }

    /// WINDOW from the network on the outbound reply stream
    pub(crate) fn on_reply_window(&mut self, key: u64, window: &Window) {
        let granted = {
            let Some(conn) = self.replies.get_mut(&key) else {
                return;
            };
            conn.network_reply_budget += window.credit as i64;
            conn.network_reply_padding = window.padding;
            conn.application_reply_padding = window.padding + MAX_RECORD_OVERHEAD as u32;

            if conn.ended {
                None
            } else {
                let delta = conn.network_reply_budget - conn.application_reply_budget;
                if delta > 0 {
                    conn.application_reply_budget += delta;
                    Some((
                        conn.stream_id,
                        conn.trace_id,
                        delta as u32,
                        conn.application_reply_padding,
                    ))
                } else {
                    Some((conn.stream_id, conn.trace_id, 0, 0))
                }
            }
        };

        match granted {
            // the close_notify may have been waiting for this credit
            None => self.flush_reply_outbound(key),
            Some((stream_id, trace_id, credit, padding)) if credit > 0 => {
                send_window(&mut self.env, stream_id, trace_id, credit, padding);
            }
            Some(_) => {}
        }
    }

    /// RESET from the network on the outbound reply stream
    pub(crate) fn on_reply_reset(&mut self, key: u64, trace_id: u64) {
        let stream_id = {
            let Self {
                replies, engines, ..
            } = self;
            let Some(conn) = replies.get_mut(&key) else {
                return;
            };
            conn.trace_id = trace_id;
            if let Some(engine) = engines.get_mut(conn.engine) {
                engine.close_outbound();
            }
            conn.stream_id
        };
        send_reset(&mut self.env, stream_id, trace_id);
        self.finish_reply(key);
    }

    /// Drains pending records (including the close_notify) within the
    /// network window; emits END once the outbound direction is done
    fn flush_reply_outbound(&mut self, key: u64) {
        let drained = {
            let Self {
                replies,
                engines,
                env,
                scratch,
                ..
            } = self;
            let Some(conn) = replies.get_mut(&key) else {
                return;
            };
            let Some(engine) = engines.get_mut(conn.engine) else {
                return;
            };
            loop {
                if engine.is_outbound_done() {
                    break Drained::Done;
                }
                let window = conn.network_reply_budget - conn.network_reply_padding as i64;
                if window <= 0 {
                    break Drained::Pending;
                }
                let cap = (window as usize).min(scratch.len());
                match engine.wrap(&[], &mut scratch[..cap]) {
                    Err(error) => break Drained::Failed(error),
                    Ok(flush) => {
                        if flush.produced > 0 {
                            send_data(
                                env,
                                conn.reply_id,
                                conn.trace_id,
                                conn.network_reply_padding,
                                &scratch[..flush.produced],
                            );
                            conn.network_reply_budget -=
                                flush.produced as i64 + conn.network_reply_padding as i64;
                            conn.counters.frames_written.increment();
                            conn.counters.bytes_written.add(flush.produced as u64);
                        } else {
                            break Drained::Pending;
                        }
                    }
                }
            }
        };

        match drained {
            Drained::Pending => {}
            Drained::Done => {
                let (reply_id, trace_id) = {
                    let Some(conn) = self.replies.get(&key) else {
                        return;
                    };
                    (conn.reply_id, conn.trace_id)
                };
                send_end(&mut self.env, reply_id, trace_id);
                self.finish_reply(key);
            }
            Drained::Failed(error) => {
                tracing::warn!(reply = key, %error, "close flush failed");
                self.fail_reply(key);
            }
        }
    }

    /// Budget violation or TLS failure on the encrypt path
    fn fail_reply(&mut self, key: u64) {
        let (stream_id, reply_id, trace_id) = {
            let Self {
                replies, engines, ..
            } = self;
            let Some(conn) = replies.get_mut(&key) else {
                return;
            };
            if let Some(engine) = engines.get_mut(conn.engine) {
                engine.close_outbound();
            }
            (conn.stream_id, conn.reply_id, conn.trace_id)
        };
        send_reset(&mut self.env, stream_id, trace_id);
        send_abort(&mut self.env, reply_id, trace_id);
        self.finish_reply(key);
    }

    /// Signals the paired accept side and releases the reply's resources
    fn finish_reply(&mut self, key: u64) {
        let Some(conn) = self.replies.remove(&key) else {
            return;
        };
        self.streams.remove(&key);
        self.throttles.remove(&conn.reply_id.as_u64());
        if let Some(accept) = self.accepts.get_mut(&conn.accept_id) {
            accept.reply_done = true;
        }
        self.engines.release(conn.engine);
    }
}
