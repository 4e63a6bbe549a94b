// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The host's length-prefixed stream framing
//!
//! Every message starts with `{ type_id: u32, length: u32, stream_id: u64 }`
//! followed by a type-specific body; `length` counts the body bytes. All
//! integers are little-endian.

use crate::stream::id::Id;
use axon_codec::{
    DecoderBuffer, DecoderBufferResult, DecoderError, DecoderValue, Encoder, EncoderValue,
};

pub(crate) type Tag = u32;

/// Bytes occupied by the message header
pub const HEADER_LEN: usize = 16;

// This implements a codec for a frame body that contains simple values
// that don't vary based on the tag
macro_rules! simple_frame_codec {
    ($name:ident {
        $(
            $field:ident: $ty:ty
        ),* $(,)?
    }, $tag:expr) => {
        impl $name {
            pub const fn tag(&self) -> crate::frame::Tag {
                $tag
            }

            #[inline]
            pub(crate) fn decode_body<'a>(
                stream_id: crate::stream::id::Id,
                buffer: axon_codec::DecoderBuffer<'a>,
            ) -> axon_codec::DecoderBufferResult<'a, Self> {
                $(
                    let ($field, buffer) = buffer.decode::<$ty>()?;
                )*
                Ok((Self { stream_id, $($field),* }, buffer))
            }

            #[inline]
            pub(crate) fn encode_body<E: axon_codec::Encoder>(&self, encoder: &mut E) {
                $(
                    encoder.encode(&self.$field);
                )*
            }
        }
    };
}

#[macro_use]
pub mod abort;
#[macro_use]
pub mod begin;
#[macro_use]
pub mod data;
#[macro_use]
pub mod end;
pub mod extension;
#[macro_use]
pub mod reset;
#[macro_use]
pub mod signal;
#[macro_use]
pub mod window;

pub use abort::Abort;
pub use begin::Begin;
pub use data::Data;
pub use end::End;
pub use reset::Reset;
pub use signal::Signal;
pub use window::Window;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    Begin(Begin<'a>),
    Data(Data<'a>),
    End(End),
    Abort(Abort),
    Window(Window),
    Reset(Reset),
    Signal(Signal),
}

impl<'a> Frame<'a> {
    pub fn tag(&self) -> Tag {
        match self {
            Frame::Begin(frame) => frame.tag(),
            Frame::Data(frame) => frame.tag(),
            Frame::End(frame) => frame.tag(),
            Frame::Abort(frame) => frame.tag(),
            Frame::Window(frame) => frame.tag(),
            Frame::Reset(frame) => frame.tag(),
            Frame::Signal(frame) => frame.tag(),
        }
    }

    pub fn stream_id(&self) -> Id {
        match self {
            Frame::Begin(frame) => frame.stream_id,
            Frame::Data(frame) => frame.stream_id,
            Frame::End(frame) => frame.stream_id,
            Frame::Abort(frame) => frame.stream_id,
            Frame::Window(frame) => frame.stream_id,
            Frame::Reset(frame) => frame.stream_id,
            Frame::Signal(frame) => frame.stream_id,
        }
    }

    pub fn trace_id(&self) -> u64 {
        match self {
            Frame::Begin(frame) => frame.trace_id,
            Frame::Data(frame) => frame.trace_id,
            Frame::End(frame) => frame.trace_id,
            Frame::Abort(frame) => frame.trace_id,
            Frame::Window(frame) => frame.trace_id,
            Frame::Reset(frame) => frame.trace_id,
            Frame::Signal(frame) => frame.trace_id,
        }
    }
}

impl<'a> DecoderValue<'a> for Frame<'a> {
    #[inline]
    fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Self> {
        let (type_id, buffer) = buffer.decode::<u32>()?;
        let (length, buffer) = buffer.decode::<u32>()?;
        let (stream_id, buffer) = buffer.decode::<Id>()?;
        let (body, buffer) = buffer.decode_slice(length as usize)?;
        let body = DecoderBuffer::new(body);

        let (frame, body) = match type_id {
            begin_tag!() => {
                let (frame, body) = Begin::decode_body(stream_id, body)?;
                (Frame::Begin(frame), body)
            }
            data_tag!() => {
                let (frame, body) = Data::decode_body(stream_id, body)?;
                (Frame::Data(frame), body)
            }
            end_tag!() => {
                let (frame, body) = End::decode_body(stream_id, body)?;
                (Frame::End(frame), body)
            }
            abort_tag!() => {
                let (frame, body) = Abort::decode_body(stream_id, body)?;
                (Frame::Abort(frame), body)
            }
            window_tag!() => {
                let (frame, body) = Window::decode_body(stream_id, body)?;
                (Frame::Window(frame), body)
            }
            reset_tag!() => {
                let (frame, body) = Reset::decode_body(stream_id, body)?;
                (Frame::Reset(frame), body)
            }
            signal_tag!() => {
                let (frame, body) = Signal::decode_body(stream_id, body)?;
                (Frame::Signal(frame), body)
            }
            _ => return Err(DecoderError::InvariantViolation("unknown frame type")),
        };

        body.ensure_empty()?;

        Ok((frame, buffer))
    }
}

impl EncoderValue for Frame<'_> {
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        macro_rules! encode_frame {
            ($frame:ident) => {{
                let mut body_len = axon_codec::EncoderLenEstimator::new();
                $frame.encode_body(&mut body_len);

                encoder.encode(&$frame.tag());
                encoder.encode(&(body_len.len() as u32));
                encoder.encode(&$frame.stream_id);
                $frame.encode_body(encoder);
            }};
        }

        match self {
            Frame::Begin(frame) => encode_frame!(frame),
            Frame::Data(frame) => encode_frame!(frame),
            Frame::End(frame) => encode_frame!(frame),
            Frame::Abort(frame) => encode_frame!(frame),
            Frame::Window(frame) => encode_frame!(frame),
            Frame::Reset(frame) => encode_frame!(frame),
            Frame::Signal(frame) => encode_frame!(frame),
        }
    }
}
