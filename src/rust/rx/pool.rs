// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    config::DataplaneConfig,
    hw::Hardware,
    ring::WorkQueue,
    runtime::{
        fail::Fail,
        limits::{
            PAGE_SIZE,
            RQ_WQE_SIZE,
        },
        memory::{
            DmaAddr,
            DmaAllocator,
            DmaDirection,
            DmaMapper,
            DmaRegion,
        },
    },
    rx::{
        cqe::RqWqe,
        packet::{
            RxFrag,
            RxPacket,
        },
        rx_counter,
        RxStats,
    },
};
use ::std::{
    mem,
    sync::{
        atomic::{
            self,
            AtomicBool,
            Ordering,
        },
        Arc,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A mapped receive page. The device writes into the half that starts at `offset`.
#[derive(Debug)]
pub struct RxPage {
    region: DmaRegion,
    dma: DmaAddr,
    offset: usize,
}

/// Who owns the buffer of a ring slot.
#[derive(Debug, Default)]
pub enum SlotBuffer {
    /// Nothing was posted, or posting failed.
    #[default]
    Unfilled,
    /// A mapped page belongs to the ring.
    RingOwned(RxPage),
    /// The page went upstream with a packet.
    Delivered,
}

/// Receive queue buffers: one slot per receive queue entry.
pub struct RxPool {
    qid: u16,
    wq: WorkQueue,
    slots: Vec<SlotBuffer>,
    /// Next slot that receives a recycled page.
    next_to_alloc: u16,
    page_order: u32,
    page_len: usize,
    buf_len: usize,
    copy_break: usize,
    /// NUMA node of the queue. Pages from other nodes are never recycled.
    node: u16,
    hw: Arc<dyn Hardware>,
    mapper: Arc<dyn DmaMapper>,
    allocator: Arc<dyn DmaAllocator>,
    intf_up: Arc<AtomicBool>,
    stats: Arc<RxStats>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl RxPage {
    pub fn region(&self) -> &DmaRegion {
        &self.region
    }

    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl SlotBuffer {
    /// Bus address the device writes to. Null unless the ring owns a page.
    pub fn dma_addr(&self) -> DmaAddr {
        match self {
            SlotBuffer::RingOwned(page) => page.dma.offset(page.offset),
            _ => DmaAddr::NULL,
        }
    }

    pub fn page(&self) -> Option<&RxPage> {
        match self {
            SlotBuffer::RingOwned(page) => Some(page),
            _ => None,
        }
    }
}

impl RxPool {
    /// Creates the receive queue entries of queue `qid`. Entry `i` reports its completion at `cqe_base + i * cqe_size`.
    pub fn new(
        qid: u16,
        config: &DataplaneConfig,
        cqe_base: DmaAddr,
        cqe_size: usize,
        hw: Arc<dyn Hardware>,
        mapper: Arc<dyn DmaMapper>,
        allocator: Arc<dyn DmaAllocator>,
        intf_up: Arc<AtomicBool>,
        stats: Arc<RxStats>,
    ) -> Result<Self, Fail> {
        let node: u16 = config.numa_node;
        let wq: WorkQueue = WorkQueue::new(config.rq_depth, RQ_WQE_SIZE, node, allocator.as_ref(), mapper.clone())?;

        let buf_len: usize = config.rx.buf_len;
        let page_order: u32 = (2 * buf_len).div_ceil(PAGE_SIZE).next_power_of_two().trailing_zeros();
        for i in 0..wq.depth() {
            let wqe: RqWqe = RqWqe {
                cqe_addr: cqe_base.offset(i as usize * cqe_size),
                buf_addr: DmaAddr::NULL,
                buf_len: buf_len as u32,
            };
            wq.write_wqe(i, &wqe.encode());
        }

        let mut slots: Vec<SlotBuffer> = Vec::with_capacity(wq.depth() as usize);
        slots.resize_with(wq.depth() as usize, SlotBuffer::default);

        Ok(Self {
            qid,
            wq,
            slots,
            next_to_alloc: 0,
            page_order,
            page_len: PAGE_SIZE << page_order,
            buf_len,
            copy_break: config.rx.copy_break,
            node,
            hw,
            mapper,
            allocator,
            intf_up,
            stats,
        })
    }

    pub fn wq(&self) -> &WorkQueue {
        &self.wq
    }

    pub fn buf_len(&self) -> usize {
        self.buf_len
    }

    pub fn slot(&self, idx: u16) -> &SlotBuffer {
        &self.slots[(idx & self.wq.mask()) as usize]
    }

    /// Number of ring slots without a posted buffer.
    pub fn unfilled(&self) -> u16 {
        self.wq.depth() - self.wq.outstanding()
    }

    /// Gives slot `idx` a mapped page unless it already has one.
    pub fn alloc_mapped_page(&mut self, idx: u16) -> bool {
        let idx: usize = (idx & self.wq.mask()) as usize;
        if let SlotBuffer::RingOwned(_) = self.slots[idx] {
            return true;
        }

        let region: DmaRegion = match self.allocator.alloc_pages(self.page_order, self.node) {
            Some(region) => region,
            None => {
                self.stats.0.update().inc(rx_counter::ALLOC_PAGE_ERR);
                return false;
            },
        };
        // Dropping the region on failure frees it.
        let dma: DmaAddr = match self.mapper.map(&region, 0, self.page_len, DmaDirection::FromDevice) {
            Ok(dma) => dma,
            Err(_) => {
                self.stats.0.update().inc(rx_counter::MAP_ERR);
                return false;
            },
        };

        self.slots[idx] = SlotBuffer::RingOwned(RxPage { region, dma, offset: 0 });
        true
    }

    /// Posts buffers to every free receive queue entry, stopping at the first allocation failure. Rings one doorbell
    /// for the whole batch.
    pub fn fill_buffers(&mut self) -> usize {
        let free: u16 = self.wq.free_wqebbs();
        let pi: u16 = self.wq.pi();

        let mut filled: u16 = 0;
        while filled < free {
            let idx: u16 = pi.wrapping_add(filled) & self.wq.mask();
            if !self.alloc_mapped_page(idx) {
                break;
            }
            let (hi, lo): (u32, u32) = self.slots[idx as usize].dma_addr().split();
            self.wq.write_word(idx, RqWqe::BUF_ADDR_HI_WORD, hi);
            self.wq.write_word(idx, RqWqe::BUF_ADDR_LO_WORD, lo);
            filled += 1;
        }

        if filled > 0 {
            self.wq.advance_producer(filled);
            self.next_to_alloc = self.wq.pi() & self.wq.mask();
            if self.intf_up.load(Ordering::Acquire) {
                // Buffer addresses must be visible before the new producer index.
                atomic::fence(Ordering::Release);
                self.hw.rq_update_pi(self.qid, self.wq.pi());
            }
        } else if free == self.wq.mask() {
            self.stats.0.update().inc(rx_counter::BUF_EMPTY);
        }
        filled as usize
    }

    /// Attaches `len` received bytes of slot `idx` to `packet` and decides what happens to the page: it is either
    /// recycled into the ring or unmapped.
    pub fn add_rx_frag(&mut self, idx: u16, len: usize, packet: &mut RxPacket) -> bool {
        let idx: usize = (idx & self.wq.mask()) as usize;
        let mut page: RxPage = match mem::replace(&mut self.slots[idx], SlotBuffer::Delivered) {
            SlotBuffer::RingOwned(page) => page,
            other => {
                self.slots[idx] = other;
                return false;
            },
        };
        self.mapper
            .sync_for_cpu(page.dma.offset(page.offset), len, DmaDirection::FromDevice);

        if len <= self.copy_break && !packet.is_nonlinear() {
            packet.append_linear(&page.region.read_bytes(page.offset, len));
            if page.region.node() == self.node {
                self.donate(page);
            } else {
                self.release(page);
            }
            return true;
        }

        // Only the ring holds the page, so the other half is free to receive again.
        let reusable: bool = page.region.ref_count() == 1 && page.region.node() == self.node;
        packet.append_frag(RxFrag::new(page.region.clone(), page.offset, len));
        if reusable {
            page.offset ^= self.buf_len;
            self.donate(page);
        } else {
            self.release(page);
        }
        true
    }

    /// Moves the page of consumed slot `idx` to the next refill slot without touching its offset.
    pub fn recycle(&mut self, idx: u16) {
        let idx: usize = (idx & self.wq.mask()) as usize;
        if let SlotBuffer::RingOwned(page) = mem::replace(&mut self.slots[idx], SlotBuffer::Unfilled) {
            self.donate(page);
        }
    }

    /// Unmaps and drops every page owned by the ring.
    pub fn free_all(&mut self) {
        for idx in 0..self.slots.len() {
            if let SlotBuffer::RingOwned(page) = mem::take(&mut self.slots[idx]) {
                self.release(page);
            }
        }
    }

    fn donate(&mut self, page: RxPage) {
        let idx: usize = self.next_to_alloc as usize;
        self.next_to_alloc = (self.next_to_alloc + 1) & self.wq.mask();
        if let SlotBuffer::RingOwned(stale) = mem::replace(&mut self.slots[idx], SlotBuffer::RingOwned(page)) {
            debug_assert!(false, "recycled page overwrote a posted page");
            self.release(stale);
        }
    }

    fn release(&self, page: RxPage) {
        self.mapper.unmap(page.dma, self.page_len, DmaDirection::FromDevice);
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for RxPool {
    fn drop(&mut self) {
        self.free_all();
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::{
        RxPool,
        SlotBuffer,
    };
    use crate::{
        config::DataplaneConfig,
        ensure_eq,
        hw::sim::{
            SimAllocator,
            SimIommu,
            SimNic,
        },
        runtime::memory::{
            DmaAddr,
            DmaRegion,
        },
        rx::{
            packet::RxPacket,
            RxStats,
        },
    };
    use ::anyhow::Result;
    use ::std::sync::{
        atomic::AtomicBool,
        Arc,
    };

    struct Harness {
        pool: RxPool,
        iommu: Arc<SimIommu>,
        allocator: Arc<SimAllocator>,
        nic: Arc<SimNic>,
        stats: Arc<RxStats>,
    }

    fn harness(depth: u16, intf_up: bool) -> Result<Harness> {
        let mut config: DataplaneConfig = DataplaneConfig::default();
        config.rq_depth = depth;
        let iommu: Arc<SimIommu> = Arc::new(SimIommu::new());
        let allocator: Arc<SimAllocator> = Arc::new(SimAllocator::new());
        let nic: Arc<SimNic> = Arc::new(SimNic::new(iommu.clone()));
        let stats: Arc<RxStats> = Arc::new(RxStats::default());
        let pool: RxPool = RxPool::new(
            0,
            &config,
            DmaAddr::new(0x10_0000),
            32,
            nic.clone(),
            iommu.clone(),
            allocator.clone(),
            Arc::new(AtomicBool::new(intf_up)),
            stats.clone(),
        )?;
        Ok(Harness {
            pool,
            iommu,
            allocator,
            nic,
            stats,
        })
    }

    fn page_of(pool: &RxPool, idx: u16) -> Option<(DmaRegion, usize)> {
        pool.slot(idx).page().map(|p| (p.region().clone(), p.offset()))
    }

    #[test]
    fn fill_posts_all_free_entries_with_one_doorbell() -> Result<()> {
        let mut h: Harness = harness(64, true)?;
        ensure_eq!(h.pool.fill_buffers(), 63);
        ensure_eq!(h.nic.rq_doorbells(0), 1);
        ensure_eq!(h.nic.last_rq_pi(0), Some(63));
        ensure_eq!(h.pool.unfilled(), 1);
        ensure_eq!(h.pool.slot(63).dma_addr(), DmaAddr::NULL);
        ensure_eq!(h.pool.slot(0).dma_addr().is_null(), false);
        ensure_eq!(h.pool.fill_buffers(), 0);
        ensure_eq!(h.nic.rq_doorbells(0), 1);
        Ok(())
    }

    #[test]
    fn alloc_is_idempotent() -> Result<()> {
        let mut h: Harness = harness(64, true)?;
        ensure_eq!(h.pool.alloc_mapped_page(5), true);
        let before: DmaAddr = h.pool.slot(5).dma_addr();
        ensure_eq!(h.pool.alloc_mapped_page(5), true);
        ensure_eq!(h.pool.slot(5).dma_addr(), before);
        ensure_eq!(h.allocator.page_allocs(), 1);
        Ok(())
    }

    #[test]
    fn fill_stops_at_first_failure() -> Result<()> {
        let mut h: Harness = harness(64, true)?;
        h.allocator.fail_allocs(10, 1);
        ensure_eq!(h.pool.fill_buffers(), 10);
        ensure_eq!(h.stats.snapshot().alloc_page_errors, 1);
        h.iommu.fail_maps(0, 1);
        ensure_eq!(h.pool.fill_buffers(), 0);
        ensure_eq!(h.stats.snapshot().map_errors, 1);
        ensure_eq!(h.stats.snapshot().buf_empty, 0);
        ensure_eq!(h.pool.fill_buffers(), 53);
        Ok(())
    }

    #[test]
    fn empty_ring_that_cannot_fill_is_counted() -> Result<()> {
        let mut h: Harness = harness(64, true)?;
        h.allocator.fail_allocs(0, 1);
        ensure_eq!(h.pool.fill_buffers(), 0);
        ensure_eq!(h.stats.snapshot().buf_empty, 1);
        ensure_eq!(h.nic.rq_doorbells(0), 0);
        Ok(())
    }

    #[test]
    fn doorbell_is_skipped_while_interface_is_down() -> Result<()> {
        let mut h: Harness = harness(64, false)?;
        ensure_eq!(h.pool.fill_buffers(), 63);
        ensure_eq!(h.nic.rq_doorbells(0), 0);
        Ok(())
    }

    /// A page only the ring references flips between its two halves on every reuse.
    #[test]
    fn single_owner_local_page_flips_halves() -> Result<()> {
        let mut h: Harness = harness(64, true)?;
        h.pool.fill_buffers();
        // Keep no reference to the page: a second owner would make it ineligible for reuse.
        ensure_eq!(h.pool.slot(0).page().map(|p| p.offset()), Some(0));
        let base: DmaAddr = h.pool.slot(0).dma_addr();

        let mut packets: Vec<RxPacket> = Vec::new();
        let mut expected_offset: usize = 0;
        for cycle in 0..4u16 {
            let ci: u16 = h.pool.wq().ci();
            let pi: u16 = h.pool.wq().pi();
            let mut packet: RxPacket = RxPacket::with_capacity(256);
            ensure_eq!(h.pool.add_rx_frag(ci, 1000, &mut packet), true);
            h.pool.wq().advance_consumer(1);
            ensure_eq!(matches!(h.pool.slot(ci), SlotBuffer::Delivered), true);

            expected_offset ^= 2048;
            ensure_eq!(h.pool.slot(pi).page().map(|p| p.offset()), Some(expected_offset), "cycle {}", cycle);
            ensure_eq!(h.pool.slot(pi).dma_addr(), base.offset(expected_offset), "cycle {}", cycle);
            ensure_eq!(h.pool.fill_buffers(), 1);

            // Drop the packet so that the next delivery finds the page with a single owner again.
            packets.push(packet);
            packets.clear();

            // Make the recycled page the next one the device fills.
            for _ in 0..62 {
                let idx: u16 = h.pool.wq().ci();
                h.pool.recycle(idx);
                h.pool.wq().advance_consumer(1);
                h.pool.fill_buffers();
            }
        }
        ensure_eq!(h.allocator.page_allocs(), 63);
        Ok(())
    }

    #[test]
    fn shared_page_is_released() -> Result<()> {
        let mut h: Harness = harness(64, true)?;
        h.pool.fill_buffers();
        let live: usize = h.iommu.live_mappings();

        let mut first: RxPacket = RxPacket::with_capacity(256);
        h.pool.add_rx_frag(0, 1000, &mut first);
        h.pool.wq().advance_consumer(1);
        // The stack still holds the first half when the second half is delivered.
        let pi: u16 = h.pool.wq().pi();
        let (region, _) = page_of(&h.pool, pi).ok_or(anyhow::anyhow!("page was not recycled"))?;
        drop(region);
        h.pool.fill_buffers();

        for _ in 0..62 {
            let idx: u16 = h.pool.wq().ci();
            h.pool.recycle(idx);
            h.pool.wq().advance_consumer(1);
            h.pool.fill_buffers();
        }

        let ci: u16 = h.pool.wq().ci();
        let mut second: RxPacket = RxPacket::with_capacity(256);
        h.pool.add_rx_frag(ci, 1000, &mut second);
        h.pool.wq().advance_consumer(1);
        ensure_eq!(h.pool.slot(h.pool.wq().pi()).page().is_none(), true);
        ensure_eq!(h.iommu.live_mappings(), live - 1);
        ensure_eq!(second.frags()[0].region().same_memory(first.frags()[0].region()), true);
        ensure_eq!(second.frags()[0].offset(), 2048);
        Ok(())
    }

    #[test]
    fn remote_page_is_released() -> Result<()> {
        let mut h: Harness = harness(64, true)?;
        h.allocator.set_node_override(Some(1));
        h.pool.fill_buffers();
        let live: usize = h.iommu.live_mappings();
        let mut packet: RxPacket = RxPacket::with_capacity(256);
        h.pool.add_rx_frag(0, 1000, &mut packet);
        ensure_eq!(h.pool.slot(h.pool.wq().pi()).page().is_none(), true);
        ensure_eq!(h.iommu.live_mappings(), live - 1);
        ensure_eq!(packet.len(), 1000);
        Ok(())
    }

    #[test]
    fn small_packet_is_copied_and_page_kept_in_place() -> Result<()> {
        let mut h: Harness = harness(64, true)?;
        h.pool.fill_buffers();
        let (region, _) = page_of(&h.pool, 0).ok_or(anyhow::anyhow!("slot 0 is empty"))?;
        region.write_bytes(0, &[9; 60]);

        let mut packet: RxPacket = RxPacket::with_capacity(256);
        h.pool.add_rx_frag(0, 60, &mut packet);
        ensure_eq!(packet.is_nonlinear(), false);
        ensure_eq!(packet.linear(), &[9; 60][..]);
        let (reused, offset) = page_of(&h.pool, h.pool.wq().pi()).ok_or(anyhow::anyhow!("page was not recycled"))?;
        ensure_eq!(reused.same_memory(&region), true);
        ensure_eq!(offset, 0);
        Ok(())
    }
}
