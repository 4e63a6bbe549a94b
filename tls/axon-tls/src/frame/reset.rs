// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::stream::id::Id;

macro_rules! reset_tag {
    () => {
        0x06u32
    };
}

/// Rejects a stream toward its writer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reset {
    pub stream_id: Id,
    pub trace_id: u64,
}

simple_frame_codec!(Reset { trace_id: u64 }, reset_tag!());
