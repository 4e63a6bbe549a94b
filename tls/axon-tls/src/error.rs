// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::{fmt, panic::Location};

/// Error raised by the streaming core
///
/// Carries the location that constructed it so a reset observed by the host
/// can be traced back to the exact guard that fired.
#[derive(Clone)]
pub struct Error {
    kind: Kind,
    location: &'static Location<'static>,
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("kind", &self.kind)
            .field("crate", &"axon-tls")
            .field("file", &self.file())
            .field("line", &self.location.line())
            .finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let Self { kind, location } = self;
        let file = self.file();
        let line = location.line();
        write!(f, "[axon-tls::{file}:{line}]: {kind}")
    }
}

impl std::error::Error for Error {}

impl Error {
    #[track_caller]
    #[inline]
    pub fn new(kind: Kind) -> Self {
        Self {
            kind,
            location: Location::caller(),
        }
    }

    #[inline]
    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    #[inline]
    fn file(&self) -> &'static str {
        self.location
            .file()
            .trim_start_matches(concat!(env!("CARGO_MANIFEST_DIR"), "/src/"))
    }
}

impl From<Kind> for Error {
    #[track_caller]
    #[inline]
    fn from(kind: Kind) -> Self {
        Self::new(kind)
    }
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum Kind {
    #[error("could not decode frame: {0}")]
    Decode(axon_codec::DecoderError),
    #[error("tls failure: {0}")]
    Tls(rustls::Error),
    #[error("no buffer slot available")]
    NoSlot,
    #[error("peer overran its credit budget")]
    BudgetExceeded,
    #[error("tls record does not fit the staging slot")]
    RecordOversize,
    #[error("no route matched hostname {hostname:?} protocol {protocol:?}")]
    NoRoute {
        hostname: Option<String>,
        protocol: Option<String>,
    },
    #[error("route {route_id} is not registered")]
    UnknownRoute { route_id: u64 },
    #[error("store index space exhausted")]
    StoreExhausted,
    #[error("store {name:?} could not be loaded: {reason}")]
    StoreLoad { name: String, reason: String },
    #[error("message arrived for an unknown stream")]
    UnknownStream,
    #[error("unexpected message {type_id} in the current stream state")]
    UnexpectedMessage { type_id: u32 },
}

impl Kind {
    #[inline]
    #[track_caller]
    pub(crate) fn err(self) -> Error {
        Error::new(self)
    }
}

impl From<axon_codec::DecoderError> for Error {
    #[track_caller]
    #[inline]
    fn from(error: axon_codec::DecoderError) -> Self {
        Kind::Decode(error).err()
    }
}

impl From<rustls::Error> for Error {
    #[track_caller]
    #[inline]
    fn from(error: rustls::Error) -> Self {
        Kind::Tls(error).err()
    }
}
