// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Control-plane commands: ROUTE, UNROUTE, FREEZE
//!
//! The host's controller decodes its own command framing; this module takes
//! the decoded fields, loads (or releases) the named store, and mutates the
//! route table. A route is rejected, never partially applied, when its store
//! cannot back its role.

use crate::{
    frame::extension::TlsRouteExt,
    route::{Registry, Role, Route},
    worker::{Environment, Worker},
};
use axon_codec::DecoderBuffer;

#[derive(Clone, Debug)]
pub struct RouteCommand {
    pub route_id: u64,
    pub role: Role,
    pub local_address: String,
    pub remote_address: String,
    pub authorization: u64,
    pub store: Option<String>,
    pub hostname: Option<String>,
    pub application_protocol: Option<String>,
}

impl RouteCommand {
    /// Builds a command from the host's decoded fields plus the raw TLS
    /// route extension
    pub fn new(
        route_id: u64,
        role: Role,
        local_address: &str,
        remote_address: &str,
        authorization: u64,
        extension: &[u8],
    ) -> Self {
        let extension = DecoderBuffer::new(extension)
            .decode::<TlsRouteExt>()
            .map(|(extension, _)| extension)
            .unwrap_or_default();
        Self {
            route_id,
            role,
            local_address: local_address.to_string(),
            remote_address: remote_address.to_string(),
            authorization,
            store: extension.store.map(str::to_string),
            hostname: extension.hostname.map(str::to_string),
            application_protocol: extension.application_protocol.map(str::to_string),
        }
    }
}

impl<E: Environment> Worker<E> {
    /// Applies a ROUTE command; `false` rejects it
    pub fn handle_route(&mut self, command: RouteCommand) -> bool {
        let registry = self.registry.clone();
        let mut registry = registry.write();
        let Registry { routes, stores } = &mut *registry;

        let context = match stores.acquire(command.store.as_deref()) {
            Ok(context) => context,
            Err(error) => {
                tracing::warn!(route = command.route_id, %error, "route rejected");
                return false;
            }
        };

        // the store must back the route's role
        let usable = match command.role {
            Role::Server => context.has_key_store(),
            Role::Client => context.has_trust_store(),
        };
        if !usable {
            tracing::warn!(route = command.route_id, role = ?command.role, "store lacks material");
            stores.release(command.store.as_deref());
            return false;
        }

        let inserted = routes.insert(Route {
            route_id: command.route_id,
            role: command.role,
            local_address: command.local_address,
            remote_address: command.remote_address,
            authorization: command.authorization,
            store: command.store.clone(),
            hostname: command.hostname,
            application_protocol: command.application_protocol,
            context,
        });

        if !inserted {
            stores.release(command.store.as_deref());
        }
        inserted
    }

    /// Applies an UNROUTE command; `false` means the route was unknown
    pub fn handle_unroute(&mut self, route_id: u64) -> bool {
        let registry = self.registry.clone();
        let mut registry = registry.write();
        let Registry { routes, stores } = &mut *registry;

        match routes.remove(route_id) {
            Some(route) => {
                stores.release(route.store.as_deref());
                true
            }
            None => false,
        }
    }

    /// FREEZE: stop accepting new streams; existing connections drain
    pub fn handle_freeze(&mut self) {
        self.freeze();
    }
}
