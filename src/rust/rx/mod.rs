// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod backpressure;
pub mod cqe;
pub mod packet;
pub mod pool;

//======================================================================================================================
// Imports
//======================================================================================================================

use self::{
    backpressure::Backpressure,
    cqe::{
        RxCqe,
        RxL3,
        CSUM_ERR_HW_CHECK_NONE,
        CSUM_ERR_OTHER,
    },
    packet::{
        NetStack,
        PacketAllocator,
        RxChecksum,
        RxGso,
        RxPacket,
    },
    pool::RxPool,
};
use crate::{
    config::DataplaneConfig,
    hw::Hardware,
    runtime::{
        fail::Fail,
        limits::CQE_SIZE,
        memory::{
            DmaAddr,
            DmaAllocator,
            DmaDirection,
            DmaMapper,
            DmaRegion,
        },
        stats::SeqCounters,
    },
};
use ::std::{
    ops::Add,
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
// Constants
//======================================================================================================================

// Receive counters.
mod rx_counter {
    pub const PACKETS: usize = 0;
    pub const BYTES: usize = 1;
    pub const CSUM_ERR: usize = 2;
    pub const OTHER_ERR: usize = 3;
    pub const DROPPED: usize = 4;
    pub const ALLOC_PACKET_ERR: usize = 5;
    pub const ALLOC_PAGE_ERR: usize = 6;
    pub const MAP_ERR: usize = 7;
    pub const BUF_EMPTY: usize = 8;
    pub const LRO_PACKETS: usize = 9;
    pub const BP_FLAGGED: usize = 10;
    pub const BP_UNLOCK: usize = 11;
    pub const COUNT: usize = 12;
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Receive counters of one queue. Written by the poll context only.
#[derive(Default)]
pub struct RxStats(SeqCounters<{ rx_counter::COUNT }>);

/// Receive statistics of one queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RxQueueStats {
    /// Packets delivered upstream.
    pub packets: u64,
    /// Bytes delivered upstream, including the estimated headers of merged segments.
    pub bytes: u64,
    pub csum_errors: u64,
    /// Completions with an error the device cannot classify.
    pub other_errors: u64,
    pub dropped: u64,
    pub alloc_packet_errors: u64,
    pub alloc_page_errors: u64,
    pub map_errors: u64,
    /// Refills that found the whole ring empty and posted nothing.
    pub buf_empty: u64,
    pub lro_packets: u64,
    pub bp_flagged: u64,
    pub bp_unlocks: u64,
}

/// What happened to the completion at the consumer index.
enum Completion {
    /// Left in place for the next poll.
    Retry,
    Consumed {
        delivered: usize,
        slots: u16,
        lro: bool,
    },
}

/// Receive side of a queue pair: the completion queue and the buffers it reports on.
pub struct RxQueue {
    qid: u16,
    cq: DmaRegion,
    cq_dma: DmaAddr,
    pool: RxPool,
    backpressure: Backpressure,
    packets: Arc<dyn PacketAllocator>,
    stack: Arc<dyn NetStack>,
    hw: Arc<dyn Hardware>,
    mapper: Arc<dyn DmaMapper>,
    stats: Arc<RxStats>,
    buf_len: usize,
    copy_break: usize,
    csum_offload: bool,
    refill_threshold: u16,
    lro_replenish_threshold: u32,
    lro_ipv4_hdr_len: u32,
    lro_ipv6_hdr_len: u32,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl RxStats {
    pub fn snapshot(&self) -> RxQueueStats {
        let c: [u64; rx_counter::COUNT] = self.0.snapshot();
        RxQueueStats {
            packets: c[rx_counter::PACKETS],
            bytes: c[rx_counter::BYTES],
            csum_errors: c[rx_counter::CSUM_ERR],
            other_errors: c[rx_counter::OTHER_ERR],
            dropped: c[rx_counter::DROPPED],
            alloc_packet_errors: c[rx_counter::ALLOC_PACKET_ERR],
            alloc_page_errors: c[rx_counter::ALLOC_PAGE_ERR],
            map_errors: c[rx_counter::MAP_ERR],
            buf_empty: c[rx_counter::BUF_EMPTY],
            lro_packets: c[rx_counter::LRO_PACKETS],
            bp_flagged: c[rx_counter::BP_FLAGGED],
            bp_unlocks: c[rx_counter::BP_UNLOCK],
        }
    }
}

impl RxQueue {
    /// Creates receive queue `qid` and posts its first buffers. The first doorbell is rung by [RxQueue::notify] once
    /// the device knows about the queue.
    pub fn create(
        qid: u16,
        config: &DataplaneConfig,
        hw: Arc<dyn Hardware>,
        mapper: Arc<dyn DmaMapper>,
        allocator: Arc<dyn DmaAllocator>,
        packets: Arc<dyn PacketAllocator>,
        stack: Arc<dyn NetStack>,
        intf_up: Arc<AtomicBool>,
    ) -> Result<Self, Fail> {
        let cq_len: usize = config.rq_depth as usize * CQE_SIZE;
        let cq: DmaRegion = match allocator.alloc_buffer(cq_len, config.numa_node) {
            Some(region) => region,
            None => {
                let cause: String = format!("cannot allocate completion queue (qid={})", qid);
                error!("create(): {}", cause);
                return Err(Fail::new(libc::ENOMEM, &cause));
            },
        };
        let cq_dma: DmaAddr = mapper.map(&cq, 0, cq_len, DmaDirection::Bidirectional)?;

        let stats: Arc<RxStats> = Arc::new(RxStats::default());
        let pool: Result<RxPool, Fail> = RxPool::new(
            qid,
            config,
            cq_dma,
            CQE_SIZE,
            hw.clone(),
            mapper.clone(),
            allocator,
            intf_up,
            stats.clone(),
        );
        let mut queue: RxQueue = match pool {
            Ok(pool) => Self {
                qid,
                cq,
                cq_dma,
                pool,
                backpressure: Backpressure::new(&config.backpressure),
                packets,
                stack,
                hw,
                mapper,
                stats,
                buf_len: config.rx.buf_len,
                copy_break: config.rx.copy_break,
                csum_offload: config.rx.csum_offload,
                refill_threshold: config.rx.refill_threshold,
                lro_replenish_threshold: config.rx.lro_replenish_threshold,
                lro_ipv4_hdr_len: config.rx.lro_ipv4_hdr_len,
                lro_ipv6_hdr_len: config.rx.lro_ipv6_hdr_len,
            },
            Err(e) => {
                mapper.unmap(cq_dma, cq_len, DmaDirection::Bidirectional);
                return Err(e);
            },
        };

        if queue.pool.fill_buffers() == 0 {
            let cause: String = format!("cannot post receive buffers (qid={})", qid);
            error!("create(): {}", cause);
            return Err(Fail::new(libc::ENOMEM, &cause));
        }

        debug!("create(): qid={} depth={} posted={}", qid, config.rq_depth, queue.pool.wq().outstanding());
        Ok(queue)
    }

    pub fn qid(&self) -> u16 {
        self.qid
    }

    pub fn pool(&self) -> &RxPool {
        &self.pool
    }

    /// Bus address of the completion queue.
    pub fn cq_addr(&self) -> DmaAddr {
        self.cq_dma
    }

    pub fn backpressure(&self) -> &Backpressure {
        &self.backpressure
    }

    pub fn stats(&self) -> RxQueueStats {
        self.stats.snapshot()
    }

    /// Counters shared with readers that sample them from other threads.
    pub fn stats_handle(&self) -> Arc<RxStats> {
        self.stats.clone()
    }

    /// Tells the device about all posted buffers.
    pub fn notify(&self) {
        atomic::fence(Ordering::Release);
        self.hw.rq_update_pi(self.qid, self.pool.wq().pi());
    }

    /// Delivers up to `budget` packets upstream and returns how many were delivered. A super completion that is the
    /// first item of a round is processed whole even if it holds more packets than `budget`.
    pub fn poll(&mut self, budget: usize) -> usize {
        let mask: u16 = self.pool.wq().mask();
        let mut delivered: usize = 0;
        let mut bytes: u64 = 0;
        let mut lro_slots: u32 = 0;
        let mut bp_flagged: u32 = 0;

        while delivered < budget {
            let ci: u16 = self.pool.wq().ci() & mask;
            let offset: usize = ci as usize * CQE_SIZE;
            // The done bit is loaded with acquire ordering, so the other words are complete once it is seen.
            if !RxCqe::is_done(&self.cq, offset) {
                break;
            }
            let cqe: RxCqe = RxCqe::read(&self.cq, offset);

            let completion: Completion = if cqe.is_super() {
                if delivered > 0 && delivered + cqe.super_pkt_num() > budget {
                    break;
                }
                self.rx_super(&cqe, ci, &mut bytes)
            } else {
                self.rx_single(&cqe, ci, &mut bytes)
            };

            let (count, slots, lro): (usize, u16, bool) = match completion {
                Completion::Retry => break,
                Completion::Consumed { delivered, slots, lro } => (delivered, slots, lro),
            };
            if cqe.bp() {
                bp_flagged += 1;
            }
            RxCqe::clear(&self.cq, offset);
            self.pool.wq().advance_consumer(slots);
            delivered += count;

            if lro {
                lro_slots += slots as u32;
                if lro_slots > self.lro_replenish_threshold {
                    break;
                }
            }
        }

        {
            let update = self.stats.0.update();
            update.add(rx_counter::PACKETS, delivered as u64);
            update.add(rx_counter::BYTES, bytes);
            update.add(rx_counter::BP_FLAGGED, bp_flagged as u64);
        }

        if self.pool.unfilled() > self.refill_threshold {
            self.pool.fill_buffers();
        }

        if bp_flagged > 0 {
            self.backpressure.observe(bp_flagged);
            self.maybe_unlock_backpressure();
        }

        delivered
    }

    /// Unmaps and frees every posted buffer. The device must no longer own the queue.
    pub fn release_buffers(&mut self) {
        self.pool.free_all();
    }

    /// Programs the initial back-pressure threshold, if back-pressure is enabled.
    pub fn arm_backpressure(&self) -> Result<(), Fail> {
        match self.backpressure.initial_threshold() {
            Some(threshold) => self.hw.set_rq_bp_threshold(self.qid, threshold),
            None => Ok(()),
        }
    }

    fn maybe_unlock_backpressure(&mut self) {
        let posted: u16 = self.pool.wq().outstanding();
        if let Some(threshold) = self.backpressure.check_unlock(posted) {
            match self.hw.set_rq_bp_threshold(self.qid, threshold) {
                Ok(()) => self.stats.0.update().inc(rx_counter::BP_UNLOCK),
                Err(e) => warn!("poll(): cannot lower back-pressure threshold (qid={}): {:?}", self.qid, e),
            }
        }
    }

    /// Ring slots taken by a packet of `len` bytes.
    fn slots_for(&self, len: usize) -> u16 {
        len.div_ceil(self.buf_len).max(1) as u16
    }

    /// Attaches the buffers of the `slots` slots starting at `first` to `packet`.
    fn gather(&mut self, first: u16, len: usize, slots: u16, packet: &mut RxPacket) {
        let mut remaining: usize = len;
        for i in 0..slots {
            let seg: usize = remaining.min(self.buf_len);
            self.pool.add_rx_frag(first.wrapping_add(i), seg, packet);
            remaining -= seg;
        }
    }

    fn rx_single(&mut self, cqe: &RxCqe, ci: u16, bytes: &mut u64) -> Completion {
        let len: usize = cqe.pkt_len();
        let slots: u16 = self.slots_for(len);
        let mut packet: RxPacket = match self.packets.alloc(self.copy_break) {
            Some(packet) => packet,
            None => {
                self.stats.0.update().inc(rx_counter::ALLOC_PACKET_ERR);
                return Completion::Retry;
            },
        };
        self.gather(ci, len, slots, &mut packet);
        self.finish(cqe, &mut packet);

        let mut wire_bytes: u64 = len as u64;
        let lro_num: u8 = cqe.lro_num();
        if lro_num > 1 {
            let hdr_len: usize = match cqe.l3() {
                RxL3::Ipv6 => self.lro_ipv6_hdr_len as usize,
                _ => self.lro_ipv4_hdr_len as usize,
            };
            wire_bytes += (lro_num as u64 - 1) * hdr_len as u64;
            packet.set_gso(Some(RxGso {
                size: len.saturating_sub(hdr_len).div_ceil(lro_num as usize) as u16,
                segs: lro_num as u16,
            }));
            self.stats.0.update().inc(rx_counter::LRO_PACKETS);
        }
        *bytes += wire_bytes;

        self.stack.deliver(packet);
        Completion::Consumed {
            delivered: 1,
            slots,
            lro: lro_num > 0,
        }
    }

    fn rx_super(&mut self, cqe: &RxCqe, ci: u16, bytes: &mut u64) -> Completion {
        let num: usize = cqe.super_pkt_num();
        let mut cursor: u16 = ci;
        let mut delivered: usize = 0;

        for i in 0..num {
            let len: usize = cqe.super_pkt_len(i);
            let slots: u16 = self.slots_for(len);
            let mut packet: RxPacket = match self.packets.alloc(self.copy_break) {
                Some(packet) => packet,
                None if i == 0 => {
                    self.stats.0.update().inc(rx_counter::ALLOC_PACKET_ERR);
                    return Completion::Retry;
                },
                None => {
                    // Hand the buffers of the remaining packets back to the ring.
                    for k in i..num {
                        for _ in 0..self.slots_for(cqe.super_pkt_len(k)) {
                            self.pool.recycle(cursor);
                            cursor = cursor.wrapping_add(1);
                        }
                    }
                    let update = self.stats.0.update();
                    update.inc(rx_counter::ALLOC_PACKET_ERR);
                    update.add(rx_counter::DROPPED, (num - i) as u64);
                    break;
                },
            };
            self.gather(cursor, len, slots, &mut packet);
            cursor = cursor.wrapping_add(slots);
            self.finish(cqe, &mut packet);
            *bytes += len as u64;
            self.stack.deliver(packet);
            delivered += 1;
        }

        Completion::Consumed {
            delivered,
            slots: cursor.wrapping_sub(ci),
            lro: false,
        }
    }

    /// Applies the offload results of `cqe` to `packet`.
    fn finish(&self, cqe: &RxCqe, packet: &mut RxPacket) {
        packet.set_qid(self.qid);
        packet.set_vlan(cqe.vlan());
        packet.set_rss_hash(cqe.rss_hash());

        if !self.csum_offload {
            return;
        }
        let err: u16 = cqe.csum_err();
        if err == 0 {
            packet.set_csum(RxChecksum::Unnecessary);
        } else if err & !(CSUM_ERR_HW_CHECK_NONE | CSUM_ERR_OTHER) != 0 {
            self.stats.0.update().inc(rx_counter::CSUM_ERR);
        } else if err & CSUM_ERR_OTHER != 0 {
            self.stats.0.update().inc(rx_counter::OTHER_ERR);
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for RxQueue {
    fn drop(&mut self) {
        self.pool.free_all();
        self.mapper
            .unmap(self.cq_dma, self.cq.len(), DmaDirection::Bidirectional);
    }
}

impl Add for RxQueueStats {
    type Output = RxQueueStats;

    fn add(self, other: RxQueueStats) -> RxQueueStats {
        RxQueueStats {
            packets: self.packets + other.packets,
            bytes: self.bytes + other.bytes,
            csum_errors: self.csum_errors + other.csum_errors,
            other_errors: self.other_errors + other.other_errors,
            dropped: self.dropped + other.dropped,
            alloc_packet_errors: self.alloc_packet_errors + other.alloc_packet_errors,
            alloc_page_errors: self.alloc_page_errors + other.alloc_page_errors,
            map_errors: self.map_errors + other.map_errors,
            buf_empty: self.buf_empty + other.buf_empty,
            lro_packets: self.lro_packets + other.lro_packets,
            bp_flagged: self.bp_flagged + other.bp_flagged,
            bp_unlocks: self.bp_unlocks + other.bp_unlocks,
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
