// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    memory::{
        DmaAddr,
        DmaAllocator,
        DmaDirection,
        DmaMapper,
        DmaRegion,
    },
};
use ::std::sync::{
    atomic::{
        AtomicU16,
        Ordering,
    },
    Arc,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Free-running indexes wrap at 2^16, so the depth must divide it.
const MAX_DEPTH: u16 = 1 << 15;

//======================================================================================================================
// Structures
//======================================================================================================================

/// A circular array of work queue entries shared with the device.
///
/// The producer and consumer indexes are free-running 16-bit counters. They are masked only when a slot is addressed,
/// so `prod_idx - cons_idx` is the number of outstanding basic blocks even after the counters wrap. One slot is always
/// kept empty, which caps the number of outstanding basic blocks at `depth - 1`.
///
/// There is exactly one producer and one consumer. Index updates are not read-modify-write sequences that need to
/// be atomic with respect to each other: the atomics only make the indexes observable from the other side.
pub struct WorkQueue {
    /// Backing memory of the WQE array.
    region: DmaRegion,
    /// Bus address of the WQE array.
    dma: DmaAddr,
    /// Used to release the WQE array mapping.
    mapper: Arc<dyn DmaMapper>,
    /// Number of basic blocks.
    depth: u16,
    /// Pre-computed mask.
    mask: u16,
    /// Size of a basic block in bytes.
    wqebb_size: usize,
    /// Producer index.
    prod_idx: AtomicU16,
    /// Consumer index.
    cons_idx: AtomicU16,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl WorkQueue {
    /// Allocates and maps a zeroed WQE array of `depth` basic blocks of `wqebb_size` bytes each.
    pub fn new(
        depth: u16,
        wqebb_size: usize,
        node: u16,
        allocator: &dyn DmaAllocator,
        mapper: Arc<dyn DmaMapper>,
    ) -> Result<Self, Fail> {
        if !depth.is_power_of_two() || depth > MAX_DEPTH {
            let cause: String = format!("work queue depth must be a power of two up to {} (depth={})", MAX_DEPTH, depth);
            error!("new(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        if wqebb_size == 0 || wqebb_size % 4 != 0 {
            let cause: String = format!("invalid basic block size (wqebb_size={})", wqebb_size);
            error!("new(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }

        let len: usize = depth as usize * wqebb_size;
        let region: DmaRegion = match allocator.alloc_buffer(len, node) {
            Some(region) => region,
            None => {
                let cause: String = format!("cannot allocate work queue memory (len={})", len);
                error!("new(): {}", cause);
                return Err(Fail::new(libc::ENOMEM, &cause));
            },
        };
        let dma: DmaAddr = mapper.map(&region, 0, len, DmaDirection::Bidirectional)?;

        trace!("new(): depth={} wqebb_size={} dma={:?}", depth, wqebb_size, dma);
        Ok(Self {
            region,
            dma,
            mapper,
            depth,
            mask: depth - 1,
            wqebb_size,
            prod_idx: AtomicU16::new(0),
            cons_idx: AtomicU16::new(0),
        })
    }

    pub fn depth(&self) -> u16 {
        self.depth
    }

    pub fn mask(&self) -> u16 {
        self.mask
    }

    pub fn wqebb_size(&self) -> usize {
        self.wqebb_size
    }

    /// Bus address of the first basic block.
    pub fn base_addr(&self) -> DmaAddr {
        self.dma
    }

    /// Masked producer index.
    pub fn pi(&self) -> u16 {
        self.prod_idx.load(Ordering::Acquire) & self.mask
    }

    /// Masked consumer index.
    pub fn ci(&self) -> u16 {
        self.cons_idx.load(Ordering::Acquire) & self.mask
    }

    /// Number of basic blocks between the consumer and the producer.
    pub fn outstanding(&self) -> u16 {
        let prod_idx: u16 = self.prod_idx.load(Ordering::Acquire);
        let cons_idx: u16 = self.cons_idx.load(Ordering::Acquire);
        prod_idx.wrapping_sub(cons_idx)
    }

    /// Number of basic blocks that may still be claimed.
    pub fn free_wqebbs(&self) -> u16 {
        self.depth - 1 - self.outstanding()
    }

    pub fn is_full(&self) -> bool {
        self.free_wqebbs() == 0
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding() == 0
    }

    /// Claims `n` basic blocks for the producer, returning the masked index of the first one.
    pub fn claim(&self, n: u16) -> Option<u16> {
        if n == 0 || n > self.free_wqebbs() {
            return None;
        }
        let pi: u16 = self.pi();
        self.advance_producer(n);
        Some(pi)
    }

    /// Moves the producer index forward. The caller checked [WorkQueue::free_wqebbs].
    pub fn advance_producer(&self, n: u16) {
        debug_assert!(n <= self.free_wqebbs());
        let prod_idx: u16 = self.prod_idx.load(Ordering::Relaxed);
        self.prod_idx.store(prod_idx.wrapping_add(n), Ordering::Release);
    }

    /// Returns the last `n` claimed basic blocks, which the device never saw.
    pub fn rollback_producer(&self, n: u16) {
        debug_assert!(n <= self.outstanding());
        let prod_idx: u16 = self.prod_idx.load(Ordering::Relaxed);
        self.prod_idx.store(prod_idx.wrapping_sub(n), Ordering::Release);
    }

    /// Moves the consumer index forward.
    pub fn advance_consumer(&self, n: u16) {
        debug_assert!(n <= self.outstanding());
        let cons_idx: u16 = self.cons_idx.load(Ordering::Relaxed);
        self.cons_idx.store(cons_idx.wrapping_add(n), Ordering::Release);
    }

    /// Bus address of the basic block at `idx`.
    pub fn wqebb_addr(&self, idx: u16) -> DmaAddr {
        self.dma.offset((idx & self.mask) as usize * self.wqebb_size)
    }

    /// Copies an encoded WQE into the ring starting at basic block `idx`. A WQE that runs past the last basic block
    /// continues at the first one.
    pub fn write_wqe(&self, idx: u16, wqe: &[u8]) {
        debug_assert!(wqe.len() <= self.region.len());
        let start: usize = (idx & self.mask) as usize * self.wqebb_size;
        let head: usize = wqe.len().min(self.region.len() - start);
        self.region.write_bytes(start, &wqe[..head]);
        if head < wqe.len() {
            self.region.write_bytes(0, &wqe[head..]);
        }
    }

    /// Reads `len` bytes starting at basic block `idx`, following the same wraparound as [WorkQueue::write_wqe].
    pub fn read_wqe(&self, idx: u16, len: usize) -> Vec<u8> {
        let start: usize = (idx & self.mask) as usize * self.wqebb_size;
        let head: usize = len.min(self.region.len() - start);
        let mut out: Vec<u8> = self.region.read_bytes(start, head);
        if head < len {
            out.extend(self.region.read_bytes(0, len - head));
        }
        out
    }

    /// Writes a single word of the basic block at `idx`.
    pub fn write_word(&self, idx: u16, word: usize, value: u32) {
        let offset: usize = (idx & self.mask) as usize * self.wqebb_size + word * 4;
        self.region.write_u32(offset, value);
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.mapper
            .unmap(self.dma, self.region.len(), DmaDirection::Bidirectional);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
