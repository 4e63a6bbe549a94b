// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use byteorder::{ByteOrder, LittleEndian};
use core::fmt;

/// Errors that can occur while decoding a buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecoderError {
    /// The buffer ended before the value could be read; the `usize`
    /// records the index that was requested
    UnexpectedEof(usize),
    /// The buffer contained bytes after a value that should have
    /// consumed it entirely
    UnexpectedBytes(usize),
    /// A length prefix exceeded what the platform can address
    LengthCapacityExceeded,
    /// The bytes decoded but violated an invariant of the value
    InvariantViolation(&'static str),
}

impl fmt::Display for DecoderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnexpectedEof(index) => write!(f, "unexpected eof at index {index}"),
            Self::UnexpectedBytes(count) => write!(f, "unexpected trailing bytes: {count}"),
            Self::LengthCapacityExceeded => write!(f, "length prefix exceeded capacity"),
            Self::InvariantViolation(reason) => write!(f, "{reason}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for DecoderError {}

pub type DecoderBufferResult<'a, T> = Result<(T, DecoderBuffer<'a>), DecoderError>;

/// A read-only cursor over a byte slice
///
/// All operations consume `self` and hand back the remaining view, so a
/// partially-decoded buffer can never be reused by accident.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecoderBuffer<'a> {
    bytes: &'a [u8],
}

impl<'a> DecoderBuffer<'a> {
    #[inline]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline]
    pub fn ensure_len(&self, len: usize) -> Result<(), DecoderError> {
        if self.bytes.len() < len {
            Err(DecoderError::UnexpectedEof(len))
        } else {
            Ok(())
        }
    }

    /// Returns an error if the buffer still holds bytes
    #[inline]
    pub fn ensure_empty(&self) -> Result<(), DecoderError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(DecoderError::UnexpectedBytes(self.len()))
        }
    }

    /// Splits `count` bytes off the front of the buffer
    #[inline]
    pub fn decode_slice(self, count: usize) -> DecoderBufferResult<'a, &'a [u8]> {
        self.ensure_len(count)?;
        let (slice, remaining) = self.bytes.split_at(count);
        Ok((slice, Self::new(remaining)))
    }

    /// Decodes a value of type `T`, splitting it from the current buffer
    #[inline]
    pub fn decode<T: DecoderValue<'a>>(self) -> DecoderBufferResult<'a, T> {
        T::decode(self)
    }

    /// Splits off a slice prefixed by a little-endian length of type `Length`
    #[inline]
    pub fn decode_slice_with_len_prefix<Length>(self) -> DecoderBufferResult<'a, &'a [u8]>
    where
        Length: DecoderValue<'a> + TryInto<usize>,
    {
        let (len, buffer) = self.decode::<Length>()?;
        let len = len
            .try_into()
            .map_err(|_| DecoderError::LengthCapacityExceeded)?;
        buffer.decode_slice(len)
    }

    #[inline]
    pub fn skip(self, count: usize) -> Result<Self, DecoderError> {
        self.decode_slice(count).map(|(_, buffer)| buffer)
    }

    #[inline]
    pub fn peek_byte(&self, index: usize) -> Result<u8, DecoderError> {
        self.bytes
            .get(index)
            .copied()
            .ok_or(DecoderError::UnexpectedEof(index))
    }

    /// Hands back the underlying slice; the name flags that any invariants
    /// tracked by the buffer are lost
    #[inline]
    pub fn into_less_safe_slice(self) -> &'a [u8] {
        self.bytes
    }
}

impl<'a> From<&'a [u8]> for DecoderBuffer<'a> {
    #[inline]
    fn from(bytes: &'a [u8]) -> Self {
        Self::new(bytes)
    }
}

pub trait DecoderValue<'a>: Sized {
    fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self>;
}

/// Implements `DecoderValue` for a type with a field-at-a-time decode body
#[macro_export]
macro_rules! decoder_value {
    (impl<$lt:lifetime> $ty:ty {
        fn decode($buffer:ident: Buffer) -> Result<$ret:ty> $impl:block
    }) => {
        impl<$lt> $crate::DecoderValue<$lt> for $ty {
            #[inline]
            fn decode(
                $buffer: $crate::DecoderBuffer<$lt>,
            ) -> $crate::DecoderBufferResult<$lt, $ret> {
                $impl
            }
        }
    };
}

impl<'a> DecoderValue<'a> for u8 {
    #[inline]
    fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self> {
        let (slice, buffer) = buffer.decode_slice(1)?;
        Ok((slice[0], buffer))
    }
}

macro_rules! decoder_value_le {
    ($call:ident, $ty:ty) => {
        impl<'a> DecoderValue<'a> for $ty {
            #[inline]
            fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self> {
                let (slice, buffer) = buffer.decode_slice(core::mem::size_of::<$ty>())?;
                Ok((LittleEndian::$call(slice), buffer))
            }
        }
    };
}

decoder_value_le!(read_u16, u16);
decoder_value_le!(read_u32, u32);
decoder_value_le!(read_u64, u64);
decoder_value_le!(read_i32, i32);
decoder_value_le!(read_i64, i64);

impl<'a> DecoderValue<'a> for DecoderBuffer<'a> {
    #[inline]
    fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self> {
        let len = buffer.len();
        let (slice, buffer) = buffer.decode_slice(len)?;
        Ok((Self::new(slice), buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_are_little_endian() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let buffer = DecoderBuffer::new(&data);

        let (value, buffer) = buffer.decode::<u16>().unwrap();
        assert_eq!(value, 0x0201);

        let (value, buffer) = buffer.decode::<u32>().unwrap();
        assert_eq!(value, 0x0605_0403);

        let (value, buffer) = buffer.decode::<u16>().unwrap();
        assert_eq!(value, 0x0807);

        assert!(buffer.is_empty());
    }

    #[test]
    fn len_prefix_bounds() {
        let data = [3, 1, 2, 3, 9];
        let buffer = DecoderBuffer::new(&data);
        let (slice, buffer) = buffer.decode_slice_with_len_prefix::<u8>().unwrap();
        assert_eq!(slice, &[1, 2, 3]);
        assert_eq!(buffer.len(), 1);

        let data = [4, 1, 2];
        let buffer = DecoderBuffer::new(&data);
        assert!(buffer.decode_slice_with_len_prefix::<u8>().is_err());
    }

    #[test]
    fn arbitrary_input_does_not_panic() {
        bolero::check!().for_each(|bytes: &[u8]| {
            let buffer = DecoderBuffer::new(bytes);
            let _ = buffer.decode::<u64>();
            let buffer = DecoderBuffer::new(bytes);
            let _ = buffer.decode_slice_with_len_prefix::<u32>();
        });
    }
}
