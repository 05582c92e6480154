// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use super::FaultInjector;
use crate::runtime::{
    fail::Fail,
    limits::PAGE_SIZE,
    memory::{
        DmaAddr,
        DmaDirection,
        DmaMapper,
        DmaRegion,
        WeakDmaRegion,
    },
};
use ::std::{
    collections::BTreeMap,
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Mutex,
        MutexGuard,
        PoisonError,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// First bus address handed out. Zero stays invalid.
const IOVA_BASE: u64 = 0x1_0000_0000;

//======================================================================================================================
// Structures
//======================================================================================================================

/// An I/O address translation table.
///
/// Mappings hold weak references, so mapping a region does not change its reference count. Every mapping gets its own
/// page-aligned bus address range, which is never reused.
pub struct SimIommu {
    state: Mutex<IommuState>,
    faults: FaultInjector,
    map_calls: AtomicUsize,
    unmap_calls: AtomicUsize,
    unmap_errors: AtomicUsize,
}

struct IommuState {
    next: u64,
    mappings: BTreeMap<u64, Mapping>,
}

struct Mapping {
    region: WeakDmaRegion,
    offset: usize,
    len: usize,
    dir: DmaDirection,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl SimIommu {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(IommuState {
                next: IOVA_BASE,
                mappings: BTreeMap::new(),
            }),
            faults: FaultInjector::default(),
            map_calls: AtomicUsize::new(0),
            unmap_calls: AtomicUsize::new(0),
            unmap_errors: AtomicUsize::new(0),
        }
    }

    /// Lets the next `skip` map calls succeed and fails the `count` calls after them.
    pub fn fail_maps(&self, skip: usize, count: usize) {
        self.faults.arm(skip, count);
    }

    /// Map calls, including failed ones.
    pub fn map_calls(&self) -> usize {
        self.map_calls.load(Ordering::Relaxed)
    }

    pub fn unmap_calls(&self) -> usize {
        self.unmap_calls.load(Ordering::Relaxed)
    }

    /// Unmap calls that did not match a live mapping.
    pub fn unmap_errors(&self) -> usize {
        self.unmap_errors.load(Ordering::Relaxed)
    }

    pub fn live_mappings(&self) -> usize {
        self.lock().mappings.len()
    }

    /// Resolves `len` bytes at bus address `addr` to the backing region and the offset within it.
    pub fn translate(&self, addr: DmaAddr, len: usize) -> Option<(DmaRegion, usize)> {
        let state: MutexGuard<IommuState> = self.lock();
        let (base, mapping) = state.mappings.range(..=addr.get()).next_back()?;
        let start: usize = (addr.get() - base) as usize;
        if start + len > mapping.len {
            return None;
        }
        let region: DmaRegion = mapping.region.upgrade()?;
        Some((region, mapping.offset + start))
    }

    /// Device read of `len` bytes.
    pub fn read(&self, addr: DmaAddr, len: usize) -> Option<Vec<u8>> {
        let (region, offset) = self.translate(addr, len)?;
        Some(region.read_bytes(offset, len))
    }

    /// Device write of `data`. Fails on unmapped memory and on mappings the device may only read.
    pub fn write(&self, addr: DmaAddr, data: &[u8]) -> bool {
        if self.direction(addr) == Some(DmaDirection::ToDevice) {
            return false;
        }
        match self.translate(addr, data.len()) {
            Some((region, offset)) => {
                region.write_bytes(offset, data);
                true
            },
            None => false,
        }
    }

    fn direction(&self, addr: DmaAddr) -> Option<DmaDirection> {
        let state: MutexGuard<IommuState> = self.lock();
        let (_, mapping) = state.mappings.range(..=addr.get()).next_back()?;
        Some(mapping.dir)
    }

    fn lock(&self) -> MutexGuard<IommuState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for SimIommu {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaMapper for SimIommu {
    fn map(&self, region: &DmaRegion, offset: usize, len: usize, dir: DmaDirection) -> Result<DmaAddr, Fail> {
        self.map_calls.fetch_add(1, Ordering::Relaxed);
        if self.faults.hit() {
            return Err(Fail::new(libc::ENOMEM, "injected mapping failure"));
        }
        if len == 0 || offset + len > region.len() {
            let cause: String = format!("mapping out of bounds (offset={}, len={}, region={})", offset, len, region.len());
            warn!("map(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }

        let mut state: MutexGuard<IommuState> = self.lock();
        let base: u64 = state.next;
        state.next += len.next_multiple_of(PAGE_SIZE) as u64;
        state.mappings.insert(
            base,
            Mapping {
                region: region.downgrade(),
                offset,
                len,
                dir,
            },
        );
        Ok(DmaAddr::new(base))
    }

    fn unmap(&self, addr: DmaAddr, len: usize, _dir: DmaDirection) {
        self.unmap_calls.fetch_add(1, Ordering::Relaxed);
        let mut state: MutexGuard<IommuState> = self.lock();
        match state.mappings.get(&addr.get()) {
            Some(mapping) if mapping.len == len => {
                state.mappings.remove(&addr.get());
            },
            _ => {
                self.unmap_errors.fetch_add(1, Ordering::Relaxed);
                warn!("unmap(): no mapping (addr={:?}, len={})", addr, len);
            },
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
