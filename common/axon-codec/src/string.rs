// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Length-prefixed UTF-8 strings with a single-byte length
//!
//! The length value `0xff` encodes an *absent* string, which the host
//! framing distinguishes from an empty one.

use crate::{DecoderBuffer, DecoderBufferResult, DecoderError, DecoderValue, Encoder, EncoderValue};

const ABSENT: u8 = 0xff;

/// The longest string a single-byte length prefix can carry
pub const MAX_STRING8_LEN: usize = (ABSENT - 1) as usize;

/// A present, possibly empty, length-prefixed string
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Str8<'a>(&'a str);

impl<'a> Str8<'a> {
    #[inline]
    pub fn new(value: &'a str) -> Result<Self, DecoderError> {
        if value.len() > MAX_STRING8_LEN {
            return Err(DecoderError::LengthCapacityExceeded);
        }
        Ok(Self(value))
    }

    #[inline]
    pub fn as_str(&self) -> &'a str {
        self.0
    }
}

impl<'a> DecoderValue<'a> for Str8<'a> {
    #[inline]
    fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self> {
        let (len, buffer) = buffer.decode::<u8>()?;
        if len == ABSENT {
            return Err(DecoderError::InvariantViolation("required string is absent"));
        }
        let (slice, buffer) = buffer.decode_slice(len as usize)?;
        let value = core::str::from_utf8(slice)
            .map_err(|_| DecoderError::InvariantViolation("string is not valid utf-8"))?;
        Ok((Self(value), buffer))
    }
}

impl EncoderValue for Str8<'_> {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.encode(&(self.0.len() as u8));
        encoder.write_slice(self.0.as_bytes());
    }
}

/// An optional length-prefixed string; absence is encoded as length `0xff`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OptStr8<'a>(Option<Str8<'a>>);

impl<'a> OptStr8<'a> {
    #[inline]
    pub fn new(value: Option<&'a str>) -> Result<Self, DecoderError> {
        Ok(Self(value.map(Str8::new).transpose()?))
    }

    #[inline]
    pub fn absent() -> Self {
        Self(None)
    }

    #[inline]
    pub fn as_option(&self) -> Option<&'a str> {
        self.0.map(|value| value.as_str())
    }
}

impl<'a> DecoderValue<'a> for OptStr8<'a> {
    #[inline]
    fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self> {
        if buffer.peek_byte(0)? == ABSENT {
            let buffer = buffer.skip(1)?;
            return Ok((Self(None), buffer));
        }
        let (value, buffer) = buffer.decode::<Str8>()?;
        Ok((Self(Some(value)), buffer))
    }
}

impl EncoderValue for OptStr8<'_> {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        match &self.0 {
            Some(value) => encoder.encode(value),
            None => encoder.encode(&ABSENT),
        }
    }
}
