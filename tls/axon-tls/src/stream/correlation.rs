// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pairing of initiated streams with their eventual replies
//!
//! A server handshake parks here between FINISHED and the application's
//! reply BEGIN; a client connection parks its identity between its network
//! BEGIN and the network's reply BEGIN. Every entry is removed exactly once:
//! by the reply BEGIN, or by the sweep on accept-side END/ABORT/RESET.

use crate::stream::handshake::Handshake;
use std::collections::HashMap;

#[derive(Debug)]
pub(crate) enum Correlated {
    /// A finished server handshake awaiting the application's reply stream
    Server(Handshake),
    /// A client connection awaiting the network's reply stream
    Client { client_id: u64 },
}

#[derive(Debug, Default)]
pub(crate) struct CorrelationMap {
    map: HashMap<u64, Correlated>,
}

impl CorrelationMap {
    pub(crate) fn insert(&mut self, correlation_id: u64, correlated: Correlated) {
        let replaced = self.map.insert(correlation_id, correlated);
        debug_assert!(replaced.is_none(), "correlation id reused");
    }

    pub(crate) fn remove(&mut self, correlation_id: u64) -> Option<Correlated> {
        self.map.remove(&correlation_id)
    }

    /// Sweeps a parked server handshake, if the reply never arrived
    pub(crate) fn remove_server(&mut self, correlation_id: u64) -> Option<Handshake> {
        match self.map.remove(&correlation_id)? {
            Correlated::Server(handshake) => Some(handshake),
            correlated => {
                self.map.insert(correlation_id, correlated);
                None
            }
        }
    }

    #[inline]
    pub(crate) fn contains(&self, correlation_id: u64) -> bool {
        self.map.contains_key(&correlation_id)
    }

    /// Credits a parked handshake's network-reply budget
    pub(crate) fn add_reply_credit(&mut self, correlation_id: u64, credit: u32, padding: u32) {
        if let Some(Correlated::Server(handshake)) = self.map.get_mut(&correlation_id) {
            handshake.network_reply_budget += credit as i64;
            handshake.network_reply_padding = padding;
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
