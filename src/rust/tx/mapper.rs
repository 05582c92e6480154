// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::{
        limits::{
            GSO_MAX_SIZE,
            MAX_SGE_LEN,
            MAX_SQ_SGE,
        },
        memory::{
            DmaAddr,
            DmaAllocator,
            DmaDirection,
            DmaMapper,
            DmaRegion,
        },
    },
    tx::{
        packet::{
            Fragment,
            TxPacket,
        },
        DropReason,
    },
};
use ::arrayvec::ArrayVec;

//======================================================================================================================
// Structures
//======================================================================================================================

/// One mapped region of a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaInfo {
    pub addr: DmaAddr,
    pub len: usize,
}

/// How a packet is laid out over scatter-gather entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentPlan {
    /// Fragments before the zero-length tail.
    pub valid_frags: usize,
    /// Fragments that get an entry of their own.
    pub direct_frags: usize,
    /// Bytes of the fragments copied into the scratch buffer.
    pub scratch_len: usize,
}

/// Mappings of a packet in the order they were created: header, fragments, then the scratch buffer.
#[derive(Debug, Default)]
pub struct MappedPacket {
    pub dma: ArrayVec<DmaInfo, MAX_SQ_SGE>,
    pub scratch: Option<DmaRegion>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl SegmentPlan {
    /// Checks the shape of `packet` and decides which fragments are copied. Runs before anything is mapped.
    pub fn new(packet: &TxPacket, max_sge: usize) -> Result<Self, DropReason> {
        debug_assert!((2..=MAX_SQ_SGE).contains(&max_sge));
        let header: &Fragment = packet.header();
        if header.is_empty() || header.len() > MAX_SGE_LEN || packet.len() > GSO_MAX_SIZE {
            return Err(DropReason::Malformed);
        }

        // Zero-length fragments are only allowed as a contiguous run at the tail.
        let mut valid_frags: usize = 0;
        let mut in_tail: bool = false;
        for frag in packet.frags() {
            if frag.is_empty() {
                in_tail = true;
            } else if in_tail {
                return Err(DropReason::FragSize);
            } else if frag.len() > MAX_SGE_LEN {
                return Err(DropReason::Malformed);
            } else {
                valid_frags += 1;
            }
        }

        if 1 + valid_frags <= max_sge {
            return Ok(Self {
                valid_frags,
                direct_frags: valid_frags,
                scratch_len: 0,
            });
        }

        let direct_frags: usize = max_sge - 2;
        let scratch_len: usize = packet.frags()[direct_frags..valid_frags]
            .iter()
            .map(Fragment::len)
            .sum();
        if scratch_len > MAX_SGE_LEN {
            return Err(DropReason::Malformed);
        }
        Ok(Self {
            valid_frags,
            direct_frags,
            scratch_len,
        })
    }

    /// Number of scatter-gather entries.
    pub fn nr_sges(&self) -> usize {
        1 + self.direct_frags + usize::from(self.scratch_len > 0)
    }

    pub fn uses_scratch(&self) -> bool {
        self.scratch_len > 0
    }
}

impl MappedPacket {
    /// Maps `packet` according to `plan`. On failure every mapping made so far is released.
    pub fn map(
        packet: &TxPacket,
        plan: &SegmentPlan,
        mapper: &dyn DmaMapper,
        allocator: &dyn DmaAllocator,
        node: u16,
    ) -> Result<Self, DropReason> {
        let mut mapped: Self = Self::default();

        let regions = ::std::iter::once(packet.header()).chain(&packet.frags()[..plan.direct_frags]);
        for frag in regions {
            match mapper.map(frag.region(), frag.offset(), frag.len(), DmaDirection::ToDevice) {
                Ok(addr) => mapped.dma.push(DmaInfo { addr, len: frag.len() }),
                Err(_) => {
                    mapped.unmap(mapper);
                    return Err(DropReason::MapFrag);
                },
            }
        }

        if plan.uses_scratch() {
            let scratch: DmaRegion = match allocator.alloc_buffer(plan.scratch_len, node) {
                Some(region) => region,
                None => {
                    mapped.unmap(mapper);
                    return Err(DropReason::ScratchAlloc);
                },
            };
            let mut pos: usize = 0;
            for frag in &packet.frags()[plan.direct_frags..plan.valid_frags] {
                scratch.write_bytes(pos, &frag.to_vec());
                pos += frag.len();
            }
            match mapper.map(&scratch, 0, plan.scratch_len, DmaDirection::ToDevice) {
                Ok(addr) => mapped.dma.push(DmaInfo {
                    addr,
                    len: plan.scratch_len,
                }),
                Err(_) => {
                    mapped.unmap(mapper);
                    return Err(DropReason::MapScratch);
                },
            }
            mapped.scratch = Some(scratch);
        }

        Ok(mapped)
    }

    /// Releases all mappings, most recent first, and frees the scratch buffer.
    pub fn unmap(&mut self, mapper: &dyn DmaMapper) {
        while let Some(info) = self.dma.pop() {
            mapper.unmap(info.addr, info.len, DmaDirection::ToDevice);
        }
        self.scratch = None;
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::{
        MappedPacket,
        SegmentPlan,
    };
    use crate::{
        ensure_eq,
        hw::sim::{
            SimAllocator,
            SimIommu,
        },
        runtime::memory::DmaRegion,
        tx::{
            packet::{
                Fragment,
                TxPacket,
            },
            DropReason,
        },
    };
    use ::anyhow::Result;

    /// A packet with a 54-byte header and one fragment per entry of `sizes`. Fragment `i` is filled with byte `i + 1`.
    fn packet(sizes: &[usize]) -> Result<TxPacket> {
        let mut packet: TxPacket = TxPacket::new(Fragment::from_bytes(&[0xee; 54], 0)?);
        for (i, size) in sizes.iter().enumerate() {
            let region: DmaRegion = DmaRegion::from_bytes(&vec![i as u8 + 1; size + 8], 0)?;
            packet = packet.with_frag(Fragment::new(region, 4, *size));
        }
        Ok(packet)
    }

    #[test]
    fn small_packets_map_every_region() -> Result<()> {
        let iommu: SimIommu = SimIommu::new();
        let packet: TxPacket = packet(&[100; 16])?;
        let plan: SegmentPlan = SegmentPlan::new(&packet, 17).map_err(|e| anyhow::anyhow!("{:?}", e))?;
        ensure_eq!(plan.nr_sges(), 17);
        ensure_eq!(plan.uses_scratch(), false);

        let mut mapped: MappedPacket = MappedPacket::map(&packet, &plan, &iommu, &SimAllocator::new(), 0)
            .map_err(|e| anyhow::anyhow!("{:?}", e))?;
        ensure_eq!(mapped.dma.len(), 17);
        ensure_eq!(iommu.live_mappings(), 17);
        mapped.unmap(&iommu);
        ensure_eq!(iommu.live_mappings(), 0);
        Ok(())
    }

    /// With more regions than entries, the last entry is a copy of every fragment that did not get its own.
    #[test]
    fn excess_fragments_go_to_scratch_buffer() -> Result<()> {
        let iommu: SimIommu = SimIommu::new();
        let sizes: Vec<usize> = (0..20).map(|i| 10 + i).collect();
        let packet: TxPacket = packet(&sizes)?;
        let plan: SegmentPlan = SegmentPlan::new(&packet, 17).map_err(|e| anyhow::anyhow!("{:?}", e))?;
        ensure_eq!(plan.nr_sges(), 17);
        ensure_eq!(plan.direct_frags, 15);
        ensure_eq!(plan.scratch_len, sizes[15..].iter().sum::<usize>());

        let mapped: MappedPacket = MappedPacket::map(&packet, &plan, &iommu, &SimAllocator::new(), 0)
            .map_err(|e| anyhow::anyhow!("{:?}", e))?;
        ensure_eq!(mapped.dma.len(), 17);
        ensure_eq!(mapped.dma[16].len, plan.scratch_len);

        let mut expected: Vec<u8> = Vec::new();
        for (i, size) in sizes.iter().enumerate().skip(15) {
            expected.extend(vec![i as u8 + 1; *size]);
        }
        ensure_eq!(iommu.read(mapped.dma[16].addr, plan.scratch_len), Some(expected));
        Ok(())
    }

    #[test]
    fn smaller_sge_limit_moves_the_split() -> Result<()> {
        let packet: TxPacket = packet(&[1, 2, 3, 4, 5])?;
        let plan: SegmentPlan = SegmentPlan::new(&packet, 4).map_err(|e| anyhow::anyhow!("{:?}", e))?;
        ensure_eq!(plan.nr_sges(), 4);
        ensure_eq!(plan.scratch_len, 3 + 4 + 5);
        Ok(())
    }

    #[test]
    fn zero_length_fragments_only_at_tail() -> Result<()> {
        let plan: SegmentPlan = SegmentPlan::new(&packet(&[5, 3, 0, 0])?, 17).map_err(|e| anyhow::anyhow!("{:?}", e))?;
        ensure_eq!(plan.valid_frags, 2);
        ensure_eq!(plan.nr_sges(), 3);
        ensure_eq!(SegmentPlan::new(&packet(&[5, 0, 3, 0, 0])?, 17), Err(DropReason::FragSize));
        ensure_eq!(SegmentPlan::new(&packet(&[0, 1])?, 17), Err(DropReason::FragSize));
        Ok(())
    }

    #[test]
    fn empty_or_oversized_header_is_malformed() -> Result<()> {
        let empty: TxPacket = TxPacket::new(Fragment::new(DmaRegion::new(8, 0)?, 0, 0));
        ensure_eq!(SegmentPlan::new(&empty, 17), Err(DropReason::Malformed));
        let huge: TxPacket = TxPacket::new(Fragment::new(DmaRegion::new(70_000, 0)?, 0, 70_000));
        ensure_eq!(SegmentPlan::new(&huge, 17), Err(DropReason::Malformed));
        Ok(())
    }

    #[test]
    fn mapping_failure_unwinds_everything() -> Result<()> {
        let iommu: SimIommu = SimIommu::new();
        let packet: TxPacket = packet(&[100; 8])?;
        let plan: SegmentPlan = SegmentPlan::new(&packet, 17).map_err(|e| anyhow::anyhow!("{:?}", e))?;
        iommu.fail_maps(5, 1);
        let result = MappedPacket::map(&packet, &plan, &iommu, &SimAllocator::new(), 0);
        ensure_eq!(result.err(), Some(DropReason::MapFrag));
        ensure_eq!(iommu.map_calls(), 6);
        ensure_eq!(iommu.unmap_calls(), 5);
        ensure_eq!(iommu.live_mappings(), 0);
        Ok(())
    }

    #[test]
    fn scratch_failures_are_reported_separately() -> Result<()> {
        let iommu: SimIommu = SimIommu::new();
        let allocator: SimAllocator = SimAllocator::new();
        let packet: TxPacket = packet(&[10; 20])?;
        let plan: SegmentPlan = SegmentPlan::new(&packet, 17).map_err(|e| anyhow::anyhow!("{:?}", e))?;

        allocator.fail_allocs(0, 1);
        let result = MappedPacket::map(&packet, &plan, &iommu, &allocator, 0);
        ensure_eq!(result.err(), Some(DropReason::ScratchAlloc));
        ensure_eq!(iommu.live_mappings(), 0);

        iommu.fail_maps(16, 1);
        let result = MappedPacket::map(&packet, &plan, &iommu, &allocator, 0);
        ensure_eq!(result.err(), Some(DropReason::MapScratch));
        ensure_eq!(iommu.live_mappings(), 0);
        Ok(())
    }
}
