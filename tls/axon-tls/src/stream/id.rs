// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use axon_codec::{DecoderBuffer, DecoderBufferResult, DecoderValue, Encoder, EncoderValue};
use core::fmt;

/// Bit 63 distinguishes a reply stream from the initial stream it answers
pub const REPLY_BIT: u64 = 1 << 63;

/// A dataplane stream identifier
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(u64);

impl Id {
    #[inline]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns `true` for reply-direction streams
    #[inline]
    pub const fn is_reply(self) -> bool {
        self.0 & REPLY_BIT != 0
    }

    /// The canonical reply id for an initial id
    ///
    /// The host may supply its own derivation; this is the default.
    #[inline]
    pub const fn reply(self) -> Self {
        Self(self.0 | REPLY_BIT)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl From<u64> for Id {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl<'a> DecoderValue<'a> for Id {
    #[inline]
    fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self> {
        let (value, buffer) = buffer.decode::<u64>()?;
        Ok((Self(value), buffer))
    }
}

impl EncoderValue for Id {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&self.0);
    }
}
