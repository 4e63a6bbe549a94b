// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Route records and resolution
//!
//! A route binds a stream reference to a role, a store, and an optional
//! hostname/protocol filter. The accept factory resolves by route id; the
//! handshake resolves the application target by the negotiated SNI hostname
//! and ALPN protocol.

use crate::{
    engine::rustls::ConfigSelector,
    store::{StoreContext, Stores},
};
use parking_lot::RwLock;
use rustls::ServerConfig;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

#[derive(Debug)]
pub struct Route {
    pub route_id: u64,
    pub role: Role,
    pub local_address: String,
    pub remote_address: String,
    pub authorization: u64,
    pub store: Option<String>,
    pub hostname: Option<String>,
    pub application_protocol: Option<String>,
    pub(crate) context: Arc<StoreContext>,
}

impl Route {
    /// Route-level hostname filter: an unset hostname matches any SNI
    #[inline]
    fn matches_hostname(&self, sni: Option<&str>) -> bool {
        match (self.hostname.as_deref(), sni) {
            (None, _) => true,
            (Some(hostname), Some(sni)) => hostname == sni,
            (Some(_), None) => false,
        }
    }

    #[inline]
    fn matches_protocol(&self, protocol: Option<&str>) -> bool {
        match (self.application_protocol.as_deref(), protocol) {
            (None, _) => true,
            (Some(required), Some(negotiated)) => required == negotiated,
            (Some(_), None) => false,
        }
    }

    #[inline]
    fn authorizes(&self, authorization: u64) -> bool {
        self.authorization == 0 || self.authorization == authorization
    }
}

#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// Inserts a route; fails when the id is already bound
    pub fn insert(&mut self, route: Route) -> bool {
        ensure!(self.get(route.route_id).is_none(), false);
        self.routes.push(route);
        true
    }

    pub fn remove(&mut self, route_id: u64) -> Option<Route> {
        let at = self
            .routes
            .iter()
            .position(|route| route.route_id == route_id)?;
        Some(self.routes.remove(at))
    }

    #[inline]
    pub fn get(&self, route_id: u64) -> Option<&Route> {
        self.routes.iter().find(|route| route.route_id == route_id)
    }

    /// Resolves the accept route for an inbound BEGIN
    pub fn accept(&self, route_id: u64, authorization: u64) -> Option<&Route> {
        self.get(route_id)
            .filter(|route| route.authorizes(authorization))
    }

    /// Resolves the application target after the handshake finished
    ///
    /// A route matches when its hostname filter is unset or equals the SNI
    /// hostname, and its protocol filter is unset or equals the negotiated
    /// protocol.
    pub fn application(
        &self,
        role: Role,
        authorization: u64,
        hostname: Option<&str>,
        protocol: Option<&str>,
    ) -> Option<&Route> {
        self.routes.iter().find(|route| {
            route.role == role
                && route.authorizes(authorization)
                && route.matches_hostname(hostname)
                && route.matches_protocol(protocol)
        })
    }

    /// Resolves the route answering a client hello and the ALPN protocol to
    /// negotiate for it
    ///
    /// With no offered protocols the hostname filter alone decides and ALPN
    /// is declined; otherwise the first route whose protocol is unset
    /// (declining ALPN) or among the offered protocols wins. `None` rejects
    /// the handshake.
    pub fn hello(
        &self,
        authorization: u64,
        sni: Option<&str>,
        offered_alpn: &[Vec<u8>],
    ) -> Option<(&Route, Option<&[u8]>)> {
        let candidates = self.routes.iter().filter(|route| {
            route.role == Role::Server
                && route.authorizes(authorization)
                && route.matches_hostname(sni)
        });

        for route in candidates {
            match route.application_protocol.as_deref() {
                None => return Some((route, None)),
                Some(required) => {
                    if offered_alpn.is_empty() {
                        return Some((route, None));
                    }
                    if offered_alpn
                        .iter()
                        .any(|offered| offered.as_slice() == required.as_bytes())
                    {
                        let protocol = required.as_bytes();
                        return Some((route, Some(protocol)));
                    }
                }
            }
        }

        None
    }
}

/// Shared route and store state, mutated by the control plane
pub struct Registry {
    pub routes: RouteTable,
    pub stores: Stores,
}

impl Registry {
    pub fn new(stores: Stores) -> Self {
        Self {
            routes: RouteTable::default(),
            stores,
        }
    }
}

/// [`ConfigSelector`] backed by the live route table
///
/// The certificate always comes from the accept route's store; the client
/// hello only chooses which protocol, if any, to negotiate.
pub struct RouteConfigSelector {
    registry: Arc<RwLock<Registry>>,
    store: Arc<StoreContext>,
    authorization: u64,
}

impl RouteConfigSelector {
    pub fn new(registry: Arc<RwLock<Registry>>, store: Arc<StoreContext>, authorization: u64) -> Self {
        Self {
            registry,
            store,
            authorization,
        }
    }
}

impl ConfigSelector for RouteConfigSelector {
    fn select(&self, sni: Option<&str>, offered_alpn: &[Vec<u8>]) -> Option<Arc<ServerConfig>> {
        let registry = self.registry.read();
        let (route, protocol) = registry.routes.hello(self.authorization, sni, offered_alpn)?;

        tracing::trace!(route_id = route.route_id, sni = ?sni, protocol = ?protocol, "hello resolved");

        match self.store.server_config(protocol) {
            Ok(config) => Some(config),
            Err(error) => {
                tracing::warn!(%error, "server configuration failed");
                None
            }
        }
    }
}
