// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pooled fixed-size staging buffers
//!
//! Every connection borrows at most one slot per pool: one for ciphertext
//! residue on the network side, one for decrypted bytes awaiting downstream
//! window on the application side. A slot is exclusive to its connection
//! while held and must be returned on every exit path.

use crate::counter::PoolCounters;

/// A fixed-size buffer borrowed from a [`SlotPool`]
#[derive(Debug)]
pub struct Slot {
    bytes: Box<[u8]>,
}

impl Slot {
    #[inline]
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Moves the residue `[consumed, len)` to the front of the slot and
    /// returns the new fill level
    #[inline]
    pub fn compact(&mut self, consumed: usize, len: usize) -> usize {
        debug_assert!(consumed <= len && len <= self.capacity());
        self.bytes.copy_within(consumed..len, 0);
        len - consumed
    }
}

#[derive(Debug)]
pub struct SlotPool {
    slot_capacity: usize,
    free: Vec<Slot>,
    available: usize,
    counters: PoolCounters,
}

impl SlotPool {
    pub fn new(slot_count: usize, slot_capacity: usize, counters: PoolCounters) -> Self {
        Self {
            slot_capacity,
            free: Vec::with_capacity(slot_count),
            available: slot_count,
            counters,
        }
    }

    #[inline]
    pub fn slot_capacity(&self) -> usize {
        self.slot_capacity
    }

    /// Borrows a slot; `None` when the pool is exhausted
    pub fn acquire(&mut self) -> Option<Slot> {
        ensure!(self.available > 0, None);
        self.available -= 1;
        self.counters.acquires.increment();
        let slot = self.free.pop().unwrap_or_else(|| Slot {
            bytes: vec![0u8; self.slot_capacity].into_boxed_slice(),
        });
        Some(slot)
    }

    pub fn release(&mut self, slot: Slot) {
        debug_assert_eq!(slot.capacity(), self.slot_capacity);
        self.available += 1;
        self.counters.releases.increment();
        self.free.push(slot);
    }
}
