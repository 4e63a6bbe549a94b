// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::stream::id::Id;
use axon_codec::{DecoderBuffer, DecoderBufferResult, Encoder};

macro_rules! data_tag {
    () => {
        0x02u32
    };
}

/// The most payload bytes a single DATA frame may carry
pub const MAX_PAYLOAD_LEN: usize = 65535;

/// Carries stream payload
///
/// `padding` is the per-frame overhead the sender debited from its credit
/// beyond the payload itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Data<'a> {
    pub stream_id: Id,
    pub trace_id: u64,
    pub group_id: u64,
    pub padding: u32,
    pub payload: &'a [u8],
}

impl<'a> Data<'a> {
    pub const fn tag(&self) -> crate::frame::Tag {
        data_tag!()
    }

    #[inline]
    pub(crate) fn decode_body(
        stream_id: Id,
        buffer: DecoderBuffer<'a>,
    ) -> DecoderBufferResult<'a, Self> {
        let (trace_id, buffer) = buffer.decode()?;
        let (group_id, buffer) = buffer.decode()?;
        let (padding, buffer) = buffer.decode()?;
        let (payload, buffer) = buffer.decode_slice_with_len_prefix::<u32>()?;

        let frame = Self {
            stream_id,
            trace_id,
            group_id,
            padding,
            payload,
        };

        Ok((frame, buffer))
    }

    #[inline]
    pub(crate) fn encode_body<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&self.trace_id);
        encoder.encode(&self.group_id);
        encoder.encode(&self.padding);
        encoder.encode_with_len_prefix::<u32, _>(&self.payload);
    }
}
