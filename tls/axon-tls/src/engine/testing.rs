// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Scripted [`Engine`] for coordinator and pump tests
//!
//! Every facade call asserts that no drained delegated task is still
//! outstanding, which turns the engine re-entrancy contract into a test
//! failure instead of undefined behavior.

use crate::{
    engine::{DelegatedTask, Engine, Flush, HandshakeStatus, Status},
    error::{Error, Kind},
};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

#[derive(Clone, Copy, Debug)]
pub enum Op {
    Unwrap {
        consume: usize,
        produce: usize,
        status: Status,
        handshake: HandshakeStatus,
    },
    Wrap {
        produce: usize,
        status: Status,
        handshake: HandshakeStatus,
    },
    /// The next unwrap/wrap fails
    Fail,
}

pub struct ScriptedEngine {
    script: VecDeque<Op>,
    tasks: VecDeque<()>,
    status: HandshakeStatus,
    after_tasks: HandshakeStatus,
    outstanding: Arc<AtomicUsize>,
    sni: Option<String>,
    alpn: Option<Vec<u8>>,
    inbound_done: bool,
    outbound_closed: bool,
}

impl ScriptedEngine {
    pub fn new(status: HandshakeStatus) -> Self {
        Self {
            script: VecDeque::new(),
            tasks: VecDeque::new(),
            status,
            after_tasks: status,
            outstanding: Arc::new(AtomicUsize::new(0)),
            sni: None,
            alpn: None,
            inbound_done: false,
            outbound_closed: false,
        }
    }

    /// The status reported once the queued tasks have been drained
    pub fn after_tasks(mut self, status: HandshakeStatus) -> Self {
        self.after_tasks = status;
        self
    }

    pub fn op(mut self, op: Op) -> Self {
        self.script.push_back(op);
        self
    }

    pub fn tasks(mut self, count: usize) -> Self {
        for _ in 0..count {
            self.tasks.push_back(());
        }
        self
    }

    pub fn sni(mut self, sni: &str) -> Self {
        self.sni = Some(sni.to_string());
        self
    }

    pub fn set_status(&mut self, status: HandshakeStatus) {
        self.status = status;
    }

    /// Outstanding delegated tasks that have been drained but not yet run
    pub fn outstanding(&self) -> Arc<AtomicUsize> {
        self.outstanding.clone()
    }

    fn assert_not_parked(&self) {
        assert_eq!(
            self.outstanding.load(Ordering::SeqCst),
            0,
            "engine re-entered while a delegated task is outstanding"
        );
    }

    fn next_op(&mut self) -> Op {
        self.script.pop_front().unwrap_or(Op::Unwrap {
            consume: 0,
            produce: 0,
            status: Status::BufferUnderflow,
            handshake: self.status,
        })
    }
}

impl Engine for ScriptedEngine {
    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<Flush, Error> {
        self.assert_not_parked();
        match self.next_op() {
            Op::Unwrap {
                consume,
                produce,
                status,
                handshake,
            } => {
                let consumed = consume.min(src.len());
                let produced = produce.min(dst.len());
                dst[..produced].fill(0xab);
                self.status = handshake;
                Ok(Flush {
                    status,
                    handshake,
                    consumed,
                    produced,
                })
            }
            Op::Wrap { .. } => panic!("script expected a wrap call"),
            Op::Fail => Err(Kind::Tls(rustls::Error::General("scripted failure".into())).err()),
        }
    }

    fn wrap(&mut self, _src: &[u8], dst: &mut [u8]) -> Result<Flush, Error> {
        self.assert_not_parked();
        match self.next_op() {
            Op::Wrap {
                produce,
                status,
                handshake,
            } => {
                let produced = produce.min(dst.len());
                dst[..produced].fill(0xcd);
                self.status = handshake;
                Ok(Flush {
                    status,
                    handshake,
                    consumed: 0,
                    produced,
                })
            }
            Op::Unwrap { .. } => panic!("script expected an unwrap call"),
            Op::Fail => Err(Kind::Tls(rustls::Error::General("scripted failure".into())).err()),
        }
    }

    fn handshake_status(&mut self) -> HandshakeStatus {
        self.assert_not_parked();
        // the FINISHED edge only surfaces on a flush
        if self.status == HandshakeStatus::Finished {
            self.status = HandshakeStatus::NotHandshaking;
        }
        self.status
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        self.tasks.pop_front()?;
        if self.tasks.is_empty() {
            self.status = self.after_tasks;
        }
        let outstanding = self.outstanding.clone();
        outstanding.fetch_add(1, Ordering::SeqCst);
        Some(DelegatedTask::new(move || {
            outstanding.fetch_sub(1, Ordering::SeqCst);
        }))
    }

    fn close_inbound(&mut self) {
        self.inbound_done = true;
    }

    fn close_outbound(&mut self) {
        self.outbound_closed = true;
    }

    fn is_inbound_done(&self) -> bool {
        self.inbound_done
    }

    fn is_outbound_done(&self) -> bool {
        self.outbound_closed
    }

    fn server_name(&self) -> Option<&str> {
        self.sni.as_deref()
    }

    fn alpn_protocol(&self) -> Option<&[u8]> {
        self.alpn.as_deref()
    }
}
