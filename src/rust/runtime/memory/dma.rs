// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    memory::DmaRegion,
};
use ::std::fmt;

//======================================================================================================================
// Structures
//======================================================================================================================

/// A bus address as seen by the device.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DmaAddr(u64);

/// Direction of a streaming DMA mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DmaDirection {
    /// The device reads the memory (transmit buffers).
    ToDevice,
    /// The device writes the memory (receive buffers).
    FromDevice,
    /// Descriptor rings and completion entries.
    Bidirectional,
}

//======================================================================================================================
// Traits
//======================================================================================================================

/// Translates CPU memory into bus addresses.
///
/// Mapping never sleeps: an implementation that runs out of translation resources fails immediately.
pub trait DmaMapper: Send + Sync {
    /// Maps `len` bytes of `region` starting at `offset`.
    fn map(&self, region: &DmaRegion, offset: usize, len: usize, dir: DmaDirection) -> Result<DmaAddr, Fail>;

    /// Releases a mapping created by [DmaMapper::map]. `addr` and `len` must match the original mapping.
    fn unmap(&self, addr: DmaAddr, len: usize, dir: DmaDirection);

    /// Makes device writes visible to the CPU before the CPU reads a receive buffer.
    fn sync_for_cpu(&self, _addr: DmaAddr, _len: usize, _dir: DmaDirection) {}

    /// Hands a buffer back to the device after the CPU touched it.
    fn sync_for_device(&self, _addr: DmaAddr, _len: usize, _dir: DmaDirection) {}
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl DmaAddr {
    /// The null bus address. Never returned by a successful mapping.
    pub const NULL: DmaAddr = DmaAddr(0);

    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one.
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }

    /// Splits the address into the high and low 32-bit halves used by descriptors.
    pub const fn split(self) -> (u32, u32) {
        ((self.0 >> 32) as u32, self.0 as u32)
    }

    /// Inverse of [DmaAddr::split].
    pub const fn join(hi: u32, lo: u32) -> Self {
        Self(((hi as u64) << 32) | lo as u64)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Debug for DmaAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DmaAddr({:#x})", self.0)
    }
}
