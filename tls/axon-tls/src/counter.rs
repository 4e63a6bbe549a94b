// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Named accumulators exposed to the host
//!
//! The host maps these into its shared-memory counter file; the core only
//! ever adds to them.

use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

#[derive(Clone, Debug, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    #[inline]
    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment(&self) {
        self.add(1);
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Registry of accumulators, keyed by their host-visible name
#[derive(Clone, Debug, Default)]
pub struct Counters {
    cells: Arc<Mutex<HashMap<String, Counter>>>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the accumulator registered under `name`, creating it on first use
    pub fn counter(&self, name: &str) -> Counter {
        let mut cells = self.cells.lock();
        if let Some(counter) = cells.get(name) {
            return counter.clone();
        }
        let counter = Counter::default();
        cells.insert(name.to_string(), counter.clone());
        counter
    }

    /// Per-route traffic accumulators
    pub fn route(&self, route_id: u64) -> RouteCounters {
        RouteCounters {
            bytes_read: self.counter(&format!("{route_id}.bytes.read")),
            bytes_written: self.counter(&format!("{route_id}.bytes.written")),
            frames_read: self.counter(&format!("{route_id}.frames.read")),
            frames_written: self.counter(&format!("{route_id}.frames.written")),
        }
    }

    /// Slot acquire/release accumulators for one pool of the given role
    pub fn pool(&self, role: &str, pool: &str) -> PoolCounters {
        PoolCounters {
            acquires: self.counter(&format!("{role}.{pool}.acquires")),
            releases: self.counter(&format!("{role}.{pool}.releases")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RouteCounters {
    pub bytes_read: Counter,
    pub bytes_written: Counter,
    pub frames_read: Counter,
    pub frames_written: Counter,
}

#[derive(Clone, Debug, Default)]
pub struct PoolCounters {
    pub acquires: Counter,
    pub releases: Counter,
}
