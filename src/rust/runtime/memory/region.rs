// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::std::{
    fmt,
    sync::{
        atomic::{
            AtomicU32,
            Ordering,
        },
        Arc,
        Weak,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

const WORD_SIZE: usize = 4;

//======================================================================================================================
// Structures
//======================================================================================================================

/// A block of memory that is shared between the CPU and the device.
///
/// The memory is stored as little-endian 32-bit atomic words, so that the device side (hardware or the software device
/// model) may write it concurrently without undefined behavior. Cloning a region creates a new reference to the same
/// memory; the number of live references is the page reference count used by the receive buffer pool.
#[derive(Clone)]
pub struct DmaRegion(Arc<RegionInner>);

/// A non-owning handle to a [DmaRegion]. It does not count towards [DmaRegion::ref_count].
#[derive(Clone)]
pub struct WeakDmaRegion(Weak<RegionInner>);

struct RegionInner {
    /// Backing words.
    words: Box<[AtomicU32]>,
    /// Length in bytes.
    len: usize,
    /// NUMA node the memory was allocated on.
    node: u16,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl DmaRegion {
    /// Allocates a zeroed region of `len` bytes on `node`.
    pub fn new(len: usize, node: u16) -> Result<Self, Fail> {
        if len == 0 {
            return Err(Fail::new(libc::EINVAL, "cannot allocate an empty dma region"));
        }

        let nwords: usize = len.div_ceil(WORD_SIZE);
        let mut words: Vec<AtomicU32> = Vec::new();
        if words.try_reserve_exact(nwords).is_err() {
            return Err(Fail::new(libc::ENOMEM, "cannot allocate dma region"));
        }
        words.extend((0..nwords).map(|_| AtomicU32::new(0)));

        Ok(Self(Arc::new(RegionInner {
            words: words.into_boxed_slice(),
            len,
            node,
        })))
    }

    /// Allocates a region holding a copy of `data`.
    pub fn from_bytes(data: &[u8], node: u16) -> Result<Self, Fail> {
        let region: Self = Self::new(data.len(), node)?;
        region.write_bytes(0, data);
        Ok(region)
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len
    }

    /// A region is never empty, this exists for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.0.len == 0
    }

    /// NUMA node of the backing memory.
    pub fn node(&self) -> u16 {
        self.0.node
    }

    /// Number of live references to the backing memory.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Checks whether two handles refer to the same backing memory.
    pub fn same_memory(&self, other: &DmaRegion) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Creates a handle that does not keep the memory alive.
    pub fn downgrade(&self) -> WeakDmaRegion {
        WeakDmaRegion(Arc::downgrade(&self.0))
    }

    /// Reads the 32-bit word at a 4-byte aligned `offset` with the given ordering.
    pub fn load_u32(&self, offset: usize, order: Ordering) -> u32 {
        self.word(offset).load(order)
    }

    /// Writes the 32-bit word at a 4-byte aligned `offset` with the given ordering.
    pub fn store_u32(&self, offset: usize, value: u32, order: Ordering) {
        self.word(offset).store(value, order)
    }

    /// Reads a 32-bit word with relaxed ordering.
    pub fn read_u32(&self, offset: usize) -> u32 {
        self.load_u32(offset, Ordering::Relaxed)
    }

    /// Writes a 32-bit word with relaxed ordering.
    pub fn write_u32(&self, offset: usize, value: u32) {
        self.store_u32(offset, value, Ordering::Relaxed)
    }

    /// Copies `data` into the region starting at `offset`.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.0.len, "write out of bounds");
        let mut pos: usize = offset;
        let mut rest: &[u8] = data;

        while !rest.is_empty() {
            let shift: usize = pos % WORD_SIZE;
            let word: &AtomicU32 = &self.0.words[pos / WORD_SIZE];
            if shift == 0 && rest.len() >= WORD_SIZE {
                let bytes: [u8; WORD_SIZE] = [rest[0], rest[1], rest[2], rest[3]];
                word.store(u32::from_le_bytes(bytes), Ordering::Relaxed);
                pos += WORD_SIZE;
                rest = &rest[WORD_SIZE..];
            } else {
                let bit: u32 = (shift * 8) as u32;
                let value: u32 = word.load(Ordering::Relaxed);
                let value: u32 = (value & !(0xff << bit)) | ((rest[0] as u32) << bit);
                word.store(value, Ordering::Relaxed);
                pos += 1;
                rest = &rest[1..];
            }
        }
    }

    /// Copies `out.len()` bytes starting at `offset` into `out`.
    pub fn read_into(&self, offset: usize, out: &mut [u8]) {
        assert!(offset + out.len() <= self.0.len, "read out of bounds");
        for (i, byte) in out.iter_mut().enumerate() {
            let pos: usize = offset + i;
            let word: u32 = self.0.words[pos / WORD_SIZE].load(Ordering::Relaxed);
            *byte = (word >> ((pos % WORD_SIZE) * 8)) as u8;
        }
    }

    /// Returns a copy of `len` bytes starting at `offset`.
    pub fn read_bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        let mut out: Vec<u8> = vec![0; len];
        self.read_into(offset, &mut out);
        out
    }

    /// Zeroes `len` bytes starting at `offset`.
    pub fn zero(&self, offset: usize, len: usize) {
        self.write_bytes(offset, &vec![0; len]);
    }

    fn word(&self, offset: usize) -> &AtomicU32 {
        debug_assert!(offset % WORD_SIZE == 0, "unaligned word access");
        &self.0.words[offset / WORD_SIZE]
    }
}

impl WeakDmaRegion {
    /// Recovers the region if it is still alive.
    pub fn upgrade(&self) -> Option<DmaRegion> {
        self.0.upgrade().map(DmaRegion)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaRegion")
            .field("len", &self.0.len)
            .field("node", &self.0.node)
            .field("refs", &self.ref_count())
            .finish()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::DmaRegion;
    use crate::ensure_eq;
    use ::anyhow::Result;

    #[test]
    fn unaligned_copies() -> Result<()> {
        let region: DmaRegion = DmaRegion::new(13, 0)?;
        let data: Vec<u8> = (1..=10).collect();
        region.write_bytes(3, &data);
        ensure_eq!(region.read_bytes(3, 10), data);
        ensure_eq!(region.read_bytes(0, 3), vec![0, 0, 0]);
        ensure_eq!(region.read_u32(4), u32::from_le_bytes([2, 3, 4, 5]));
        Ok(())
    }

    #[test]
    fn clones_share_memory() -> Result<()> {
        let region: DmaRegion = DmaRegion::new(64, 1)?;
        let other: DmaRegion = region.clone();
        ensure_eq!(region.ref_count(), 2);
        other.write_u32(8, 0xdead_beef);
        ensure_eq!(region.read_u32(8), 0xdead_beef);
        ensure_eq!(region.node(), 1);
        drop(other);
        ensure_eq!(region.ref_count(), 1);
        let weak = region.downgrade();
        ensure_eq!(region.ref_count(), 1);
        ensure_eq!(weak.upgrade().is_some(), true);
        drop(region);
        ensure_eq!(weak.upgrade().is_none(), true);
        Ok(())
    }
}
