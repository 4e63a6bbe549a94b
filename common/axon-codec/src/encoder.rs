// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use byteorder::{ByteOrder, LittleEndian};

pub trait Encoder: Sized {
    /// Calls `write` with a slice of `len` bytes at the current write position
    fn write_sized<F: FnOnce(&mut [u8])>(&mut self, len: usize, write: F);

    /// Copies the slice into the buffer
    fn write_slice(&mut self, slice: &[u8]);

    /// Returns the total buffer capacity
    fn capacity(&self) -> usize;

    /// Returns the number of bytes written to the buffer
    fn len(&self) -> usize;

    #[inline]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn remaining_capacity(&self) -> usize {
        self.capacity().saturating_sub(self.len())
    }

    /// Encode the given `EncoderValue` into the buffer
    #[inline]
    fn encode<T: EncoderValue>(&mut self, value: &T) {
        value.encode(self)
    }

    /// Encode the given `EncoderValue` prefixed with its length as `Len`
    #[inline]
    fn encode_with_len_prefix<Len, T: EncoderValue>(&mut self, value: &T)
    where
        Len: TryFrom<usize> + EncoderValue,
        Len::Error: core::fmt::Debug,
    {
        let len = value.encoding_size();
        let len: Len = Len::try_from(len).expect("value length exceeded prefix range");
        len.encode(self);
        value.encode(self);
    }
}

/// An `Encoder` over a mutable slice
///
/// # Panics
///
/// Writing past the end of the slice panics; callers size the buffer from
/// `EncoderValue::encoding_size` first.
#[derive(Debug)]
pub struct EncoderBuffer<'a> {
    bytes: &'a mut [u8],
    position: usize,
}

impl<'a> EncoderBuffer<'a> {
    #[inline]
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    /// Splits off the written bytes from the spare capacity
    #[inline]
    pub fn split_off(self) -> (&'a mut [u8], &'a mut [u8]) {
        self.bytes.split_at_mut(self.position)
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes[..self.position]
    }
}

impl<'a> Encoder for EncoderBuffer<'a> {
    #[inline]
    fn write_sized<F: FnOnce(&mut [u8])>(&mut self, len: usize, write: F) {
        let end = self.position + len;
        write(&mut self.bytes[self.position..end]);
        self.position = end;
    }

    #[inline]
    fn write_slice(&mut self, slice: &[u8]) {
        self.write_sized(slice.len(), |dest| dest.copy_from_slice(slice));
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    fn len(&self) -> usize {
        self.position
    }
}

/// Measures the encoded size of a value without writing any bytes
#[derive(Debug, Default)]
pub struct EncoderLenEstimator {
    len: usize,
}

impl EncoderLenEstimator {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Encoder for EncoderLenEstimator {
    #[inline]
    fn write_sized<F: FnOnce(&mut [u8])>(&mut self, len: usize, _write: F) {
        self.len += len;
    }

    #[inline]
    fn write_slice(&mut self, slice: &[u8]) {
        self.len += slice.len();
    }

    #[inline]
    fn capacity(&self) -> usize {
        usize::MAX
    }

    #[inline]
    fn len(&self) -> usize {
        self.len
    }
}

pub trait EncoderValue: Sized {
    /// Encodes the value into the encoder
    fn encode<E: Encoder>(&self, encoder: &mut E);

    /// Returns the number of bytes `encode` will write
    #[inline]
    fn encoding_size(&self) -> usize {
        let mut estimator = EncoderLenEstimator::new();
        self.encode(&mut estimator);
        estimator.len()
    }

    #[cfg(feature = "alloc")]
    #[inline]
    fn encode_to_vec(&self) -> alloc::vec::Vec<u8> {
        let mut buffer = alloc::vec![0u8; self.encoding_size()];
        self.encode(&mut EncoderBuffer::new(&mut buffer));
        buffer
    }
}

impl EncoderValue for u8 {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_sized(1, |buf| buf[0] = *self);
    }
}

macro_rules! encoder_value_le {
    ($call:ident, $ty:ty) => {
        impl EncoderValue for $ty {
            #[inline]
            fn encode<E: Encoder>(&self, encoder: &mut E) {
                encoder.write_sized(core::mem::size_of::<$ty>(), |buf| {
                    LittleEndian::$call(buf, *self);
                });
            }
        }
    };
}

encoder_value_le!(write_u16, u16);
encoder_value_le!(write_u32, u32);
encoder_value_le!(write_u64, u64);
encoder_value_le!(write_i32, i32);
encoder_value_le!(write_i64, i64);

impl EncoderValue for &[u8] {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_slice(self);
    }
}

impl<T: EncoderValue> EncoderValue for &T {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        (*self).encode(encoder);
    }
}
