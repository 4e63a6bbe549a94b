// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::stream::id::Id;

macro_rules! window_tag {
    () => {
        0x05u32
    };
}

/// Grants `credit` bytes of flow-control budget to the stream's writer
///
/// The writer must debit `padding` overhead bytes per frame in addition to
/// the payload it sends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub stream_id: Id,
    pub trace_id: u64,
    pub credit: u32,
    pub padding: u32,
    pub group_id: u64,
}

simple_frame_codec!(
    Window {
        trace_id: u64,
        credit: u32,
        padding: u32,
        group_id: u64,
    },
    window_tag!()
);
