// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::stream::id::Id;

macro_rules! end_tag {
    () => {
        0x03u32
    };
}

/// Half-closes a stream; no further DATA will follow
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct End {
    pub stream_id: Id,
    pub trace_id: u64,
}

simple_frame_codec!(End { trace_id: u64 }, end_tag!());
