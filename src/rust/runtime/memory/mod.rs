// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

mod alloc;
mod dma;
mod region;

pub use self::{
    alloc::{
        DmaAllocator,
        SystemAllocator,
    },
    dma::{
        DmaAddr,
        DmaDirection,
        DmaMapper,
    },
    region::{
        DmaRegion,
        WeakDmaRegion,
    },
};
