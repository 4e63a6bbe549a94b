// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Key and trust material, loaded per named store
//!
//! Stores live under `{dataplane_dir}/tls/`, with named stores nested as
//! `stores/{name}/`. The key material file defaults to `keys`, the trust
//! file to `trust`, both PEM. Host properties `tls.keystore`,
//! `tls.keystore.type`, `tls.keystore.password` (and the `tls.truststore.*`
//! equivalents) override the defaults; each is read through the same
//! accessor.

use crate::{
    config::property,
    error::{Error, Kind},
};
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    server::WebPkiClientVerifier,
    ClientConfig, RootCertStore, ServerConfig,
};
use std::{
    collections::HashMap,
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
};

/// The most distinct stores a worker may load
pub const MAX_STORES: usize = 256;

#[derive(Debug)]
struct KeyMaterial {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

#[derive(Debug)]
struct TrustMaterial {
    roots: Arc<RootCertStore>,
}

/// Loaded material for one store
#[derive(Debug)]
pub struct StoreContext {
    name: Option<String>,
    index: u8,
    key: Option<KeyMaterial>,
    trust: Option<TrustMaterial>,
}

impl StoreContext {
    fn load(name: Option<&str>, dataplane_dir: &Path, index: u8) -> Result<Self, Error> {
        let mut dir = dataplane_dir.join("tls");
        if let Some(name) = name {
            dir = dir.join("stores").join(name);
        }

        let key = match store_file(&dir, "key", "keys")? {
            Some(path) => Some(load_key_material(name, &path)?),
            None => None,
        };
        let trust = match store_file(&dir, "trust", "trust")? {
            Some(path) => Some(load_trust_material(name, &path)?),
            None => None,
        };

        tracing::debug!(
            store = ?name,
            index,
            has_key = key.is_some(),
            has_trust = trust.is_some(),
            "store loaded"
        );

        Ok(Self {
            name: name.map(str::to_string),
            index,
            key,
            trust,
        })
    }

    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[inline]
    pub fn index(&self) -> u8 {
        self.index
    }

    #[inline]
    pub fn has_key_store(&self) -> bool {
        self.key.is_some()
    }

    #[inline]
    pub fn has_trust_store(&self) -> bool {
        self.trust.is_some()
    }

    /// Builds the per-connection server configuration
    ///
    /// `alpn` carries the protocol selected for this connection; `None`
    /// declines ALPN negotiation. A trust store upgrades the listener to
    /// verified client certificates.
    pub fn server_config(&self, alpn: Option<&[u8]>) -> Result<Arc<ServerConfig>, Error> {
        let key = self.key.as_ref().ok_or_else(|| self.error("no key material"))?;

        let builder = ServerConfig::builder();
        let mut config = if let Some(trust) = &self.trust {
            let verifier = WebPkiClientVerifier::builder(trust.roots.clone())
                .build()
                .map_err(|error| self.error(&error.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        } else {
            builder.with_no_client_auth()
        }
        .with_single_cert(key.certs.clone(), key.key.clone_key())?;

        config.alpn_protocols = alpn.map(|protocol| vec![protocol.to_vec()]).unwrap_or_default();

        Ok(Arc::new(config))
    }

    /// Builds the client configuration for an originating connection
    pub fn client_config(&self, alpn: Option<&[u8]>) -> Result<Arc<ClientConfig>, Error> {
        let trust = self
            .trust
            .as_ref()
            .ok_or_else(|| self.error("no trust material"))?;

        let builder = ClientConfig::builder().with_root_certificates(trust.roots.clone());
        let mut config = if let Some(key) = &self.key {
            builder.with_client_auth_cert(key.certs.clone(), key.key.clone_key())?
        } else {
            builder.with_no_client_auth()
        };

        config.alpn_protocols = alpn.map(|protocol| vec![protocol.to_vec()]).unwrap_or_default();

        Ok(Arc::new(config))
    }

    fn error(&self, reason: &str) -> Error {
        Kind::StoreLoad {
            name: self.name.clone().unwrap_or_default(),
            reason: reason.to_string(),
        }
        .err()
    }
}

/// Resolves a store file path, honoring the host property overrides
fn store_file(dir: &Path, kind: &str, default_name: &str) -> Result<Option<PathBuf>, Error> {
    let file = property(&format!("tls.{kind}store")).unwrap_or_else(|| default_name.to_string());
    let store_type = property(&format!("tls.{kind}store.type")).unwrap_or_else(|| "PEM".to_string());
    // PEM material carries no password; the property stays readable so hosts
    // configured for other store types fail loudly below rather than here
    let _password = property(&format!("tls.{kind}store.password"));

    if !store_type.eq_ignore_ascii_case("PEM") {
        return Err(Kind::StoreLoad {
            name: String::new(),
            reason: format!("unsupported store type {store_type}"),
        }
        .err());
    }

    let path = dir.join(file);
    Ok(path.is_file().then_some(path))
}

fn load_error(name: Option<&str>, reason: String) -> Error {
    Kind::StoreLoad {
        name: name.unwrap_or_default().to_string(),
        reason,
    }
    .err()
}

fn load_key_material(name: Option<&str>, path: &Path) -> Result<KeyMaterial, Error> {
    let mut reader =
        BufReader::new(File::open(path).map_err(|error| load_error(name, error.to_string()))?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|error| load_error(name, error.to_string()))?;

    let mut reader =
        BufReader::new(File::open(path).map_err(|error| load_error(name, error.to_string()))?);
    let key = rustls_pemfile::private_key(&mut reader)
        .map_err(|error| load_error(name, error.to_string()))?
        .ok_or_else(|| load_error(name, "no private key in key store".to_string()))?;

    ensure!(
        !certs.is_empty(),
        Err(load_error(name, "no certificates in key store".to_string()))
    );

    Ok(KeyMaterial { certs, key })
}

fn load_trust_material(name: Option<&str>, path: &Path) -> Result<TrustMaterial, Error> {
    let mut reader =
        BufReader::new(File::open(path).map_err(|error| load_error(name, error.to_string()))?);

    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|error| load_error(name, error.to_string()))?;
        roots
            .add(cert)
            .map_err(|error| load_error(name, error.to_string()))?;
    }

    ensure!(
        !roots.is_empty(),
        Err(load_error(name, "no certificates in trust store".to_string()))
    );

    Ok(TrustMaterial {
        roots: Arc::new(roots),
    })
}

struct Entry {
    context: Arc<StoreContext>,
    refs: usize,
}

/// Reference-counted registry of loaded stores
///
/// A store loads on its first referencing route and drops when the last
/// route naming it is removed. Indexes are never reused.
pub struct Stores {
    dataplane_dir: PathBuf,
    by_name: HashMap<String, Entry>,
    next_index: usize,
}

impl Stores {
    pub fn new<P: Into<PathBuf>>(dataplane_dir: P) -> Self {
        Self {
            dataplane_dir: dataplane_dir.into(),
            by_name: HashMap::new(),
            next_index: 0,
        }
    }

    pub fn acquire(&mut self, name: Option<&str>) -> Result<Arc<StoreContext>, Error> {
        let key = name.unwrap_or_default().to_string();

        if let Some(entry) = self.by_name.get_mut(&key) {
            entry.refs += 1;
            return Ok(entry.context.clone());
        }

        ensure!(self.next_index < MAX_STORES, Err(Kind::StoreExhausted.err()));

        let index = self.next_index as u8;
        let context = Arc::new(StoreContext::load(name, &self.dataplane_dir, index)?);
        self.next_index += 1;
        self.by_name.insert(
            key,
            Entry {
                context: context.clone(),
                refs: 1,
            },
        );

        Ok(context)
    }

    pub fn release(&mut self, name: Option<&str>) {
        let key = name.unwrap_or_default();
        let Some(entry) = self.by_name.get_mut(key) else {
            return;
        };
        entry.refs -= 1;
        if entry.refs == 0 {
            tracing::debug!(store = ?name, "store dropped");
            self.by_name.remove(key);
        }
    }

    #[cfg(test)]
    pub(crate) fn loaded(&self, name: Option<&str>) -> bool {
        self.by_name.contains_key(name.unwrap_or_default())
    }
}

#[cfg(test)]
impl StoreContext {
    /// A store with no material, for table-level tests
    pub(crate) fn empty(index: u8) -> Self {
        Self {
            name: None,
            index,
            key: None,
            trust: None,
        }
    }
}
