// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! TLS-specific BEGIN and route extension layouts
//!
//! Both use the optional-string encoding: a string may be present and empty,
//! or absent altogether.

use axon_codec::{
    DecoderBuffer, DecoderBufferResult, DecoderError, DecoderValue, Encoder, EncoderValue, OptStr8,
};

/// Extension carried on a TLS BEGIN: the negotiated (or requested) hostname
/// and application protocol
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TlsBeginExt<'a> {
    pub hostname: Option<&'a str>,
    pub application_protocol: Option<&'a str>,
}

impl<'a> TlsBeginExt<'a> {
    pub fn new(
        hostname: Option<&'a str>,
        application_protocol: Option<&'a str>,
    ) -> Result<Self, DecoderError> {
        // the strings must fit the single-byte length encoding
        OptStr8::new(hostname)?;
        OptStr8::new(application_protocol)?;
        Ok(Self {
            hostname,
            application_protocol,
        })
    }
}

impl<'a> DecoderValue<'a> for TlsBeginExt<'a> {
    #[inline]
    fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self> {
        let (hostname, buffer) = buffer.decode::<OptStr8>()?;
        let (application_protocol, buffer) = buffer.decode::<OptStr8>()?;
        let ext = Self {
            hostname: hostname.as_option(),
            application_protocol: application_protocol.as_option(),
        };
        Ok((ext, buffer))
    }
}

impl EncoderValue for TlsBeginExt<'_> {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        // lengths were validated at construction
        let hostname = OptStr8::new(self.hostname).unwrap_or_default();
        let protocol = OptStr8::new(self.application_protocol).unwrap_or_default();
        encoder.encode(&hostname);
        encoder.encode(&protocol);
    }
}

/// Extension carried on a TLS ROUTE command
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TlsRouteExt<'a> {
    pub store: Option<&'a str>,
    pub hostname: Option<&'a str>,
    pub application_protocol: Option<&'a str>,
}

impl<'a> DecoderValue<'a> for TlsRouteExt<'a> {
    #[inline]
    fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self> {
        let (store, buffer) = buffer.decode::<OptStr8>()?;
        let (hostname, buffer) = buffer.decode::<OptStr8>()?;
        let (application_protocol, buffer) = buffer.decode::<OptStr8>()?;
        let ext = Self {
            store: store.as_option(),
            hostname: hostname.as_option(),
            application_protocol: application_protocol.as_option(),
        };
        Ok((ext, buffer))
    }
}

impl EncoderValue for TlsRouteExt<'_> {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        let store = OptStr8::new(self.store).unwrap_or_default();
        let hostname = OptStr8::new(self.hostname).unwrap_or_default();
        let protocol = OptStr8::new(self.application_protocol).unwrap_or_default();
        encoder.encode(&store);
        encoder.encode(&hostname);
        encoder.encode(&protocol);
    }
}
