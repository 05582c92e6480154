// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{
    array,
    hint,
    sync::atomic::{
        self,
        AtomicU32,
        AtomicU64,
        Ordering,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A block of `N` 64-bit counters protected by a sequence counter.
///
/// There is exactly one writer per block (the poll context or the transmit path that owns the queue). Readers never
/// block the writer: they copy all counters and retry if a write section overlapped the copy. Counters are stored as
/// atomics so that a torn read is impossible even on 32-bit targets, the sequence number only guarantees that all `N`
/// values belong to the same generation.
pub struct SeqCounters<const N: usize> {
    /// Odd while a write section is open.
    seq: AtomicU32,
    /// Counter values.
    values: [AtomicU64; N],
}

/// An open write section on a [SeqCounters] block. The section is closed when the guard is dropped.
pub struct SeqUpdate<'a, const N: usize> {
    counters: &'a SeqCounters<N>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl<const N: usize> SeqCounters<N> {
    /// Creates a block with all counters set to zero.
    pub fn new() -> Self {
        Self {
            seq: AtomicU32::new(0),
            values: array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Opens a write section. Must only be called by the single writer of this block.
    pub fn update(&self) -> SeqUpdate<'_, N> {
        let seq: u32 = self.seq.load(Ordering::Relaxed);
        debug_assert!(seq & 1 == 0, "nested write section");
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        atomic::fence(Ordering::Release);
        SeqUpdate { counters: self }
    }

    /// Copies all counters of a single generation.
    pub fn snapshot(&self) -> [u64; N] {
        loop {
            let start: u32 = self.seq.load(Ordering::Acquire);
            if start & 1 == 1 {
                hint::spin_loop();
                continue;
            }

            let values: [u64; N] = array::from_fn(|i| self.values[i].load(Ordering::Relaxed));

            atomic::fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == start {
                break values;
            }
        }
    }

    /// Reads the current generation number.
    pub fn generation(&self) -> u32 {
        self.seq.load(Ordering::Acquire) >> 1
    }
}

impl<'a, const N: usize> SeqUpdate<'a, N> {
    /// Adds `delta` to counter `index`.
    pub fn add(&self, index: usize, delta: u64) {
        if delta != 0 {
            let value: &AtomicU64 = &self.counters.values[index];
            value.store(value.load(Ordering::Relaxed).wrapping_add(delta), Ordering::Relaxed);
        }
    }

    /// Increments counter `index` by one.
    pub fn inc(&self, index: usize) {
        self.add(index, 1)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<const N: usize> Default for SeqCounters<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Closes the write section.
impl<'a, const N: usize> Drop for SeqUpdate<'a, N> {
    fn drop(&mut self) {
        let seq: u32 = self.counters.seq.load(Ordering::Relaxed);
        self.counters.seq.store(seq.wrapping_add(1), Ordering::Release);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
