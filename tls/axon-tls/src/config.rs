// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

pub const HANDSHAKE_WINDOW_BYTES: &str = "tls.handshake.window.bytes";

/// Worker configuration
///
/// `handshake_window_bytes` bounds the credit granted to the network before
/// the handshake completes; it defaults to one slot so a stalled handshake
/// can never hold more than its own staging buffer.
#[derive(Clone, Debug)]
pub struct Config {
    pub dataplane_dir: PathBuf,
    pub slot_capacity: usize,
    pub slot_count: usize,
    pub handshake_window_bytes: usize,
}

impl Config {
    pub fn new<P: Into<PathBuf>>(dataplane_dir: P) -> Self {
        let slot_capacity = 64 * 1024;
        Self {
            dataplane_dir: dataplane_dir.into(),
            slot_capacity,
            slot_count: 1024,
            handshake_window_bytes: slot_capacity,
        }
    }

    /// Loads the configuration, applying host property overrides
    pub fn load<P: Into<PathBuf>>(dataplane_dir: P) -> Self {
        let mut config = Self::new(dataplane_dir);
        if let Some(value) = property(HANDSHAKE_WINDOW_BYTES) {
            match value.parse() {
                Ok(bytes) => config.handshake_window_bytes = bytes,
                Err(_) => {
                    tracing::warn!(property = HANDSHAKE_WINDOW_BYTES, %value, "ignoring unparsable override")
                }
            }
        }
        config
    }
}

/// Reads a host property from the environment
///
/// Every `tls.*` property goes through this single accessor.
pub(crate) fn property(name: &str) -> Option<String> {
    std::env::var(name).ok()
}
