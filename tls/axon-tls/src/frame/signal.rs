// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::stream::id::Id;

macro_rules! signal_tag {
    () => {
        0x07u32
    };
}

/// Posted by the worker pool when a delegated handshake task completes
pub const FLUSH_HANDSHAKE: u64 = 1;

/// Out-of-band notification delivered to a stream's owner
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signal {
    pub stream_id: Id,
    pub trace_id: u64,
    pub signal_id: u64,
}

simple_frame_codec!(
    Signal {
        trace_id: u64,
        signal_id: u64,
    },
    signal_tag!()
);
