// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::stream::id::Id;

macro_rules! abort_tag {
    () => {
        0x04u32
    };
}

/// Abandons a stream from the writing side
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Abort {
    pub stream_id: Id,
    pub trace_id: u64,
}

simple_frame_codec!(Abort { trace_id: u64 }, abort_tag!());
