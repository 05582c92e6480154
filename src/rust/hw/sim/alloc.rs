// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use super::FaultInjector;
use crate::{
    runtime::{
        limits::PAGE_SIZE,
        memory::{
            DmaAllocator,
            DmaRegion,
        },
    },
    rx::packet::{
        HeapPacketAllocator,
        PacketAllocator,
        RxPacket,
    },
};
use ::std::sync::atomic::{
    AtomicU32,
    AtomicUsize,
    Ordering,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// No node override.
const LOCAL_NODE: u32 = u32::MAX;

//======================================================================================================================
// Structures
//======================================================================================================================

/// DMA memory allocator with failure injection.
pub struct SimAllocator {
    faults: FaultInjector,
    page_allocs: AtomicUsize,
    buffer_allocs: AtomicUsize,
    /// When set, memory reports this node instead of the requested one.
    node_override: AtomicU32,
}

/// Packet allocator with failure injection.
#[derive(Default)]
pub struct SimPacketAllocator {
    faults: FaultInjector,
    allocs: AtomicUsize,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl SimAllocator {
    pub fn new() -> Self {
        Self {
            faults: FaultInjector::default(),
            page_allocs: AtomicUsize::new(0),
            buffer_allocs: AtomicUsize::new(0),
            node_override: AtomicU32::new(LOCAL_NODE),
        }
    }

    /// Lets the next `skip` allocations succeed and fails the `count` allocations after them.
    pub fn fail_allocs(&self, skip: usize, count: usize) {
        self.faults.arm(skip, count);
    }

    /// Successful page allocations.
    pub fn page_allocs(&self) -> usize {
        self.page_allocs.load(Ordering::Relaxed)
    }

    /// Successful buffer allocations.
    pub fn buffer_allocs(&self) -> usize {
        self.buffer_allocs.load(Ordering::Relaxed)
    }

    /// Places all further memory on `node`, whatever the caller asks for.
    pub fn set_node_override(&self, node: Option<u16>) {
        let value: u32 = node.map_or(LOCAL_NODE, u32::from);
        self.node_override.store(value, Ordering::Relaxed);
    }

    fn node(&self, requested: u16) -> u16 {
        match self.node_override.load(Ordering::Relaxed) {
            LOCAL_NODE => requested,
            node => node as u16,
        }
    }

    fn alloc(&self, len: usize, node: u16, counter: &AtomicUsize) -> Option<DmaRegion> {
        if self.faults.hit() {
            return None;
        }
        let region: DmaRegion = DmaRegion::new(len, self.node(node)).ok()?;
        counter.fetch_add(1, Ordering::Relaxed);
        Some(region)
    }
}

impl SimPacketAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lets the next `skip` allocations succeed and fails the `count` allocations after them.
    pub fn fail_allocs(&self, skip: usize, count: usize) {
        self.faults.arm(skip, count);
    }

    /// Successful allocations.
    pub fn allocs(&self) -> usize {
        self.allocs.load(Ordering::Relaxed)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for SimAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaAllocator for SimAllocator {
    fn alloc_pages(&self, order: u32, node: u16) -> Option<DmaRegion> {
        self.alloc(PAGE_SIZE << order, node, &self.page_allocs)
    }

    fn alloc_buffer(&self, len: usize, node: u16) -> Option<DmaRegion> {
        self.alloc(len, node, &self.buffer_allocs)
    }
}

impl PacketAllocator for SimPacketAllocator {
    fn alloc(&self, linear: usize) -> Option<RxPacket> {
        if self.faults.hit() {
            return None;
        }
        let packet: RxPacket = HeapPacketAllocator.alloc(linear)?;
        self.allocs.fetch_add(1, Ordering::Relaxed);
        Some(packet)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
