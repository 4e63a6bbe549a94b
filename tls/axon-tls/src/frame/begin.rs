// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::stream::id::Id;
use axon_codec::{DecoderBuffer, DecoderBufferResult, Encoder};

macro_rules! begin_tag {
    () => {
        0x01u32
    };
}

/// Opens a stream
///
/// `route_id` names the route the stream arrived on (or targets);
/// `correlation_id` pairs this stream with its eventual reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Begin<'a> {
    pub stream_id: Id,
    pub route_id: u64,
    pub trace_id: u64,
    pub authorization: u64,
    pub correlation_id: u64,
    /// Opaque, route-type-specific extension bytes
    pub extension: &'a [u8],
}

impl<'a> Begin<'a> {
    pub const fn tag(&self) -> crate::frame::Tag {
        begin_tag!()
    }

    #[inline]
    pub(crate) fn decode_body(
        stream_id: Id,
        buffer: DecoderBuffer<'a>,
    ) -> DecoderBufferResult<'a, Self> {
        let (route_id, buffer) = buffer.decode()?;
        let (trace_id, buffer) = buffer.decode()?;
        let (authorization, buffer) = buffer.decode()?;
        let (correlation_id, buffer) = buffer.decode()?;
        let (extension, buffer) = buffer.decode_slice_with_len_prefix::<u32>()?;

        let frame = Self {
            stream_id,
            route_id,
            trace_id,
            authorization,
            correlation_id,
            extension,
        };

        Ok((frame, buffer))
    }

    #[inline]
    pub(crate) fn encode_body<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&self.route_id);
        encoder.encode(&self.trace_id);
        encoder.encode(&self.authorization);
        encoder.encode(&self.correlation_id);
        encoder.encode_with_len_prefix::<u32, _>(&self.extension);
    }
}
