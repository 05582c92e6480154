// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    limits::PAGE_SIZE,
    memory::DmaRegion,
};

//======================================================================================================================
// Traits
//======================================================================================================================

/// Source of DMA-capable memory. Allocation failure is reported as `None` and is never fatal to the caller.
pub trait DmaAllocator: Send + Sync {
    /// Allocates `PAGE_SIZE << order` contiguous bytes on `node`.
    fn alloc_pages(&self, order: u32, node: u16) -> Option<DmaRegion>;

    /// Allocates a contiguous buffer of `len` bytes on `node`.
    fn alloc_buffer(&self, len: usize, node: u16) -> Option<DmaRegion>;
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Allocator backed by the process heap.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemAllocator;

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl DmaAllocator for SystemAllocator {
    fn alloc_pages(&self, order: u32, node: u16) -> Option<DmaRegion> {
        DmaRegion::new(PAGE_SIZE << order, node).ok()
    }

    fn alloc_buffer(&self, len: usize, node: u16) -> Option<DmaRegion> {
        DmaRegion::new(len, node).ok()
    }
}
