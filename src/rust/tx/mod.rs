// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod mapper;
pub mod offload;
pub mod packet;
pub mod reclaim;
pub mod wqe;

//======================================================================================================================
// Imports
//======================================================================================================================

use self::{
    mapper::{
        MappedPacket,
        SegmentPlan,
    },
    offload::TaskOutcome,
    packet::TxPacket,
    reclaim::TxReclaimer,
    wqe::{
        Sge,
        SqWqe,
    },
};
use crate::{
    config::DataplaneConfig,
    hw::Hardware,
    ring::WorkQueue,
    runtime::{
        fail::Fail,
        limits::{
            MIN_TX_FRAME_LEN,
            SQ_WQEBB_SIZE,
        },
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
use ::crossbeam_channel::Sender;
use ::std::{
    ops::Add,
    sync::{
        atomic::{
            self,
            AtomicBool,
            Ordering,
        },
        Arc,
        Mutex,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Bytes reserved for the consumer index mirror.
const CI_MIRROR_LEN: usize = 64;

// Transmit path counters.
mod xmit_counter {
    pub const BUSY: usize = 0;
    pub const RESTART: usize = 1;
    pub const DROPPED: usize = 2;
    pub const FRAG_SIZE_ERR: usize = 3;
    pub const MALFORMED: usize = 4;
    pub const OFFLOAD_ERR: usize = 5;
    pub const MAP_FRAG_ERR: usize = 6;
    pub const MAP_SCRATCH_ERR: usize = 7;
    pub const ALLOC_SCRATCH_ERR: usize = 8;
    pub const CSUM_FALLBACK: usize = 9;
    pub const SCRATCH_COPIES: usize = 10;
    pub const TSO: usize = 11;
    pub const DOORBELLS: usize = 12;
    pub const COUNT: usize = 13;
}

// Completion path counters.
mod done_counter {
    pub const PACKETS: usize = 0;
    pub const BYTES: usize = 1;
    pub const WAKE: usize = 2;
    pub const COUNT: usize = 3;
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Why a packet was dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// A zero-length fragment precedes a non-empty one.
    FragSize,
    /// Empty header or a segment the device cannot describe.
    Malformed,
    /// The requested offload cannot be expressed.
    Offload,
    /// Mapping the header or a fragment failed.
    MapFrag,
    /// Mapping the scratch buffer failed.
    MapScratch,
    /// Allocating the scratch or padding buffer failed.
    ScratchAlloc,
    /// The queue is being torn down.
    QueueDown,
}

/// Result of [TxQueue::xmit].
#[derive(Debug)]
pub enum TxStatus {
    /// The packet is on the ring.
    Sent,
    /// The ring is full. The queue is stopped and the packet is handed back for a later retry.
    Busy(TxPacket),
    /// The packet was dropped and counted.
    Dropped(DropReason),
}

/// Transmit statistics of one queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxQueueStats {
    /// Wire packets completed.
    pub packets: u64,
    /// Wire bytes completed.
    pub bytes: u64,
    pub busy: u64,
    /// Times a stop was undone by the re-check.
    pub restart: u64,
    pub wake: u64,
    pub dropped: u64,
    pub frag_size_errors: u64,
    pub malformed: u64,
    pub offload_errors: u64,
    pub map_frag_errors: u64,
    pub map_scratch_errors: u64,
    pub alloc_scratch_errors: u64,
    pub csum_fallback: u64,
    pub scratch_copies: u64,
    pub tso_packets: u64,
    pub doorbells: u64,
}

/// Send queue state shared by the transmit path and the completion reclaimer.
pub struct SqShared {
    qid: u16,
    wq: WorkQueue,
    /// Where the device mirrors its consumer index.
    ci_region: DmaRegion,
    ci_dma: DmaAddr,
    mapper: Arc<dyn DmaMapper>,
    /// Stopped for lack of ring space.
    stopped: AtomicBool,
    /// Cleared when the queue is being torn down.
    accepting: AtomicBool,
    /// Shared by all queues of the device.
    intf_up: Arc<AtomicBool>,
    xmit_stats: SeqCounters<{ xmit_counter::COUNT }>,
    done_stats: SeqCounters<{ done_counter::COUNT }>,
}

/// Book-keeping of one outstanding packet, handed from the transmit path to the reclaimer in ring order.
pub(crate) struct TxInfo {
    /// Producer index of the first basic block.
    pi: u16,
    wqebb_cnt: u16,
    mapped: MappedPacket,
    valid_frags: usize,
    /// Kept alive until the device is done with it.
    packet: TxPacket,
    wire_pkts: u64,
    wire_bytes: u64,
}

/// Producer side of a send queue. Callers serialize on the mutex that wraps it.
pub struct TxQueue {
    qid: u16,
    cos: u8,
    node: u16,
    max_sge: usize,
    shared: Arc<SqShared>,
    hw: Arc<dyn Hardware>,
    mapper: Arc<dyn DmaMapper>,
    allocator: Arc<dyn DmaAllocator>,
    infos: Sender<TxInfo>,
    /// Entries were written but the doorbell was deferred.
    doorbell_pending: bool,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl SqShared {
    pub fn qid(&self) -> u16 {
        self.qid
    }

    pub fn wq(&self) -> &WorkQueue {
        &self.wq
    }

    /// Bus address of the consumer index mirror.
    pub fn ci_addr(&self) -> DmaAddr {
        self.ci_dma
    }

    /// Masked consumer index last published by the device.
    pub fn hw_ci(&self) -> u16 {
        self.ci_region.load_u32(0, Ordering::Acquire) as u16 & self.wq.mask()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Refuses further transmits.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    /// Whether the device consumed everything that was posted.
    pub fn is_drained(&self) -> bool {
        self.hw_ci() == self.wq.pi()
    }

    pub fn stats(&self) -> TxQueueStats {
        let x: [u64; xmit_counter::COUNT] = self.xmit_stats.snapshot();
        let d: [u64; done_counter::COUNT] = self.done_stats.snapshot();
        TxQueueStats {
            packets: d[done_counter::PACKETS],
            bytes: d[done_counter::BYTES],
            busy: x[xmit_counter::BUSY],
            restart: x[xmit_counter::RESTART],
            wake: d[done_counter::WAKE],
            dropped: x[xmit_counter::DROPPED],
            frag_size_errors: x[xmit_counter::FRAG_SIZE_ERR],
            malformed: x[xmit_counter::MALFORMED],
            offload_errors: x[xmit_counter::OFFLOAD_ERR],
            map_frag_errors: x[xmit_counter::MAP_FRAG_ERR],
            map_scratch_errors: x[xmit_counter::MAP_SCRATCH_ERR],
            alloc_scratch_errors: x[xmit_counter::ALLOC_SCRATCH_ERR],
            csum_fallback: x[xmit_counter::CSUM_FALLBACK],
            scratch_copies: x[xmit_counter::SCRATCH_COPIES],
            tso_packets: x[xmit_counter::TSO],
            doorbells: x[xmit_counter::DOORBELLS],
        }
    }
}

impl TxQueue {
    /// Creates the send queue `qid` and its completion reclaimer.
    pub fn create(
        qid: u16,
        config: &DataplaneConfig,
        hw: Arc<dyn Hardware>,
        mapper: Arc<dyn DmaMapper>,
        allocator: Arc<dyn DmaAllocator>,
        intf_up: Arc<AtomicBool>,
    ) -> Result<(Arc<Mutex<TxQueue>>, TxReclaimer), Fail> {
        let node: u16 = config.numa_node;
        let wq: WorkQueue = WorkQueue::new(config.sq_depth, SQ_WQEBB_SIZE, node, allocator.as_ref(), mapper.clone())?;

        let ci_region: DmaRegion = match allocator.alloc_buffer(CI_MIRROR_LEN, node) {
            Some(region) => region,
            None => {
                let cause: String = format!("cannot allocate consumer index mirror (qid={})", qid);
                error!("create(): {}", cause);
                return Err(Fail::new(libc::ENOMEM, &cause));
            },
        };
        let ci_dma: DmaAddr = mapper.map(&ci_region, 0, CI_MIRROR_LEN, DmaDirection::FromDevice)?;

        let shared: Arc<SqShared> = Arc::new(SqShared {
            qid,
            wq,
            ci_region,
            ci_dma,
            mapper: mapper.clone(),
            stopped: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
            intf_up,
            xmit_stats: SeqCounters::new(),
            done_stats: SeqCounters::new(),
        });

        // At most depth - 1 packets are outstanding, so sends never block.
        let (infos, completions) = ::crossbeam_channel::bounded(config.sq_depth as usize);
        let queue: Arc<Mutex<TxQueue>> = Arc::new(Mutex::new(TxQueue {
            qid,
            cos: config.cos(qid),
            node,
            max_sge: config.tx.max_sge,
            shared: shared.clone(),
            hw,
            mapper: mapper.clone(),
            allocator,
            infos,
            doorbell_pending: false,
        }));
        let reclaimer: TxReclaimer = TxReclaimer::new(shared, completions, mapper, queue.clone());

        debug!("create(): qid={} depth={}", qid, config.sq_depth);
        Ok((queue, reclaimer))
    }

    pub fn shared(&self) -> &Arc<SqShared> {
        &self.shared
    }

    /// Places `packet` on the ring.
    pub fn xmit(&mut self, mut packet: TxPacket) -> TxStatus {
        if !self.shared.is_accepting() {
            self.count_drop(DropReason::QueueDown);
            return TxStatus::Dropped(DropReason::QueueDown);
        }
        if self.shared.is_stopped() {
            self.shared.xmit_stats.update().inc(xmit_counter::BUSY);
            return TxStatus::Busy(packet);
        }

        let mut plan: SegmentPlan = match SegmentPlan::new(&packet, self.max_sge) {
            Ok(plan) => plan,
            Err(reason) => return self.drop_packet(reason),
        };
        if packet.len() < MIN_TX_FRAME_LEN {
            if packet.linearize_padded(MIN_TX_FRAME_LEN, self.node).is_err() {
                return self.drop_packet(DropReason::ScratchAlloc);
            }
            plan = match SegmentPlan::new(&packet, self.max_sge) {
                Ok(plan) => plan,
                Err(reason) => return self.drop_packet(reason),
            };
        }

        let outcome: TaskOutcome = match offload::build_task(&packet) {
            Ok(outcome) => outcome,
            Err(_) => return self.drop_packet(DropReason::Offload),
        };

        let wqebb_cnt: u16 = SqWqe::wqebb_count(plan.nr_sges());
        if !self.maybe_stop(wqebb_cnt) {
            self.ring_doorbell();
            return TxStatus::Busy(packet);
        }
        let pi: u16 = match self.shared.wq.claim(wqebb_cnt) {
            Some(pi) => pi,
            None => {
                self.ring_doorbell();
                return TxStatus::Busy(packet);
            },
        };

        let mapped: MappedPacket = match MappedPacket::map(
            &packet,
            &plan,
            self.mapper.as_ref(),
            self.allocator.as_ref(),
            self.node,
        ) {
            Ok(mapped) => mapped,
            Err(reason) => {
                self.shared.wq.rollback_producer(wqebb_cnt);
                return self.drop_packet(reason);
            },
        };

        let wqe: SqWqe = SqWqe {
            frame_len: packet.len() as u32,
            task: outcome.task,
            sges: mapped
                .dma
                .iter()
                .map(|info| Sge {
                    addr: info.addr,
                    len: info.len as u32,
                })
                .collect(),
        };
        self.shared.wq.write_wqe(pi, &wqe.encode());

        let (wire_pkts, wire_bytes): (u64, u64) = packet.wire_counts();
        let more: bool = packet.more();
        let gso: bool = packet.gso().is_some();
        let info: TxInfo = TxInfo {
            pi,
            wqebb_cnt,
            mapped,
            valid_frags: plan.valid_frags,
            packet,
            wire_pkts,
            wire_bytes,
        };
        if let Err(e) = self.infos.try_send(info) {
            let mut info: TxInfo = e.into_inner();
            warn!("xmit(): completion channel unavailable (qid={})", self.qid);
            info.mapped.unmap(self.mapper.as_ref());
            self.shared.wq.rollback_producer(wqebb_cnt);
            return self.drop_packet(DropReason::QueueDown);
        }

        {
            let update = self.shared.xmit_stats.update();
            if plan.uses_scratch() {
                update.inc(xmit_counter::SCRATCH_COPIES);
            }
            if outcome.csum_fallback {
                update.inc(xmit_counter::CSUM_FALLBACK);
            }
            if gso {
                update.inc(xmit_counter::TSO);
            }
        }

        self.doorbell_pending = true;
        if !more {
            self.ring_doorbell();
        }
        TxStatus::Sent
    }

    /// Rings a deferred doorbell.
    pub fn flush(&mut self) {
        self.ring_doorbell();
    }

    /// Makes sure `wqebb_cnt` basic blocks are free, stopping the queue if they are not.
    fn maybe_stop(&mut self, wqebb_cnt: u16) -> bool {
        if self.shared.wq.free_wqebbs() >= wqebb_cnt {
            return true;
        }

        self.shared.stopped.store(true, Ordering::Release);
        // Pairs with the fence in the reclaimer between freeing space and checking the stopped flag.
        atomic::fence(Ordering::SeqCst);
        if self.shared.wq.free_wqebbs() < wqebb_cnt {
            self.shared.xmit_stats.update().inc(xmit_counter::BUSY);
            return false;
        }

        self.shared.stopped.store(false, Ordering::Release);
        self.shared.xmit_stats.update().inc(xmit_counter::RESTART);
        true
    }

    fn ring_doorbell(&mut self) {
        if !self.doorbell_pending || !self.shared.intf_up.load(Ordering::Acquire) {
            return;
        }
        // Entries must be visible before the device learns about them.
        atomic::fence(Ordering::Release);
        self.hw.sq_doorbell(self.qid, self.cos, self.shared.wq.pi());
        self.doorbell_pending = false;
        self.shared.xmit_stats.update().inc(xmit_counter::DOORBELLS);
    }

    fn drop_packet(&mut self, reason: DropReason) -> TxStatus {
        self.count_drop(reason);
        TxStatus::Dropped(reason)
    }

    fn count_drop(&self, reason: DropReason) {
        let update = self.shared.xmit_stats.update();
        update.inc(xmit_counter::DROPPED);
        let counter: Option<usize> = match reason {
            DropReason::FragSize => Some(xmit_counter::FRAG_SIZE_ERR),
            DropReason::Malformed => Some(xmit_counter::MALFORMED),
            DropReason::Offload => Some(xmit_counter::OFFLOAD_ERR),
            DropReason::MapFrag => Some(xmit_counter::MAP_FRAG_ERR),
            DropReason::MapScratch => Some(xmit_counter::MAP_SCRATCH_ERR),
            DropReason::ScratchAlloc => Some(xmit_counter::ALLOC_SCRATCH_ERR),
            DropReason::QueueDown => None,
        };
        if let Some(counter) = counter {
            update.inc(counter);
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for SqShared {
    fn drop(&mut self) {
        self.mapper
            .unmap(self.ci_dma, CI_MIRROR_LEN, DmaDirection::FromDevice);
    }
}

impl Add for TxQueueStats {
    type Output = TxQueueStats;

    fn add(self, other: TxQueueStats) -> TxQueueStats {
        TxQueueStats {
            packets: self.packets + other.packets,
            bytes: self.bytes + other.bytes,
            busy: self.busy + other.busy,
            restart: self.restart + other.restart,
            wake: self.wake + other.wake,
            dropped: self.dropped + other.dropped,
            frag_size_errors: self.frag_size_errors + other.frag_size_errors,
            malformed: self.malformed + other.malformed,
            offload_errors: self.offload_errors + other.offload_errors,
            map_frag_errors: self.map_frag_errors + other.map_frag_errors,
            map_scratch_errors: self.map_scratch_errors + other.map_scratch_errors,
            alloc_scratch_errors: self.alloc_scratch_errors + other.alloc_scratch_errors,
            csum_fallback: self.csum_fallback + other.csum_fallback,
            scratch_copies: self.scratch_copies + other.scratch_copies,
            tso_packets: self.tso_packets + other.tso_packets,
            doorbells: self.doorbells + other.doorbells,
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::{
        reclaim::TxReclaimer,
        DropReason,
        TxQueue,
        TxQueueStats,
        TxStatus,
    };
    use crate::{
        config::DataplaneConfig,
        ensure_eq,
        hw::sim::{
            SimAllocator,
            SimIommu,
            SimNic,
        },
        runtime::memory::DmaRegion,
        tx::{
            packet::{
                Fragment,
                HeaderLayout,
                L3Proto,
                L4Proto,
                TxPacket,
            },
            wqe::SqWqe,
        },
    };
    use ::anyhow::Result;
    use ::std::sync::{
        atomic::AtomicBool,
        Arc,
        Mutex,
    };

    struct Harness {
        queue: Arc<Mutex<TxQueue>>,
        iommu: Arc<SimIommu>,
        allocator: Arc<SimAllocator>,
        nic: Arc<SimNic>,
        /// Keeps the completion channel open.
        _reclaimer: TxReclaimer,
    }

    impl Harness {
        fn new() -> Result<Self> {
            let config: DataplaneConfig = DataplaneConfig {
                sq_depth: 64,
                ..Default::default()
            };
            let iommu: Arc<SimIommu> = Arc::new(SimIommu::new());
            let allocator: Arc<SimAllocator> = Arc::new(SimAllocator::new());
            let nic: Arc<SimNic> = Arc::new(SimNic::new(iommu.clone()));
            let (queue, reclaimer) = TxQueue::create(
                0,
                &config,
                nic.clone(),
                iommu.clone(),
                allocator.clone(),
                Arc::new(AtomicBool::new(true)),
            )?;
            Ok(Self {
                queue,
                iommu,
                allocator,
                nic,
                _reclaimer: reclaimer,
            })
        }

        fn xmit(&self, packet: TxPacket) -> TxStatus {
            self.queue.lock().unwrap().xmit(packet)
        }

        fn stats(&self) -> TxQueueStats {
            self.queue.lock().unwrap().shared().stats()
        }

        /// Decodes the WQE that starts at basic block `pi`.
        fn wqe(&self, pi: u16) -> Result<SqWqe> {
            let queue = self.queue.lock().unwrap();
            let head: Vec<u8> = queue.shared().wq().read_wqe(pi, 64);
            let len: usize = SqWqe::peek_wqebb_count(&head) as usize * 64;
            Ok(SqWqe::decode(&queue.shared().wq().read_wqe(pi, len))?)
        }
    }

    fn packet(header_len: usize, frag_sizes: &[usize]) -> Result<TxPacket> {
        let mut packet: TxPacket = TxPacket::new(Fragment::from_bytes(&vec![0x11; header_len], 0)?);
        for size in frag_sizes {
            packet = packet.with_frag(Fragment::new(DmaRegion::new(size + 1, 0)?, 0, *size));
        }
        Ok(packet)
    }

    /// A zero-length fragment in the middle drops the packet before anything is mapped or claimed.
    #[test]
    fn misplaced_zero_length_fragment_is_rejected() -> Result<()> {
        let h: Harness = Harness::new()?;
        let maps_before: usize = h.iommu.map_calls();
        let status: TxStatus = h.xmit(packet(54, &[5, 0, 3, 0, 0])?);
        ensure_eq!(matches!(status, TxStatus::Dropped(DropReason::FragSize)), true);
        ensure_eq!(h.iommu.map_calls(), maps_before);
        ensure_eq!(h.stats().frag_size_errors, 1);
        ensure_eq!(h.stats().dropped, 1);
        ensure_eq!(h.queue.lock().unwrap().shared().wq().outstanding(), 0);
        Ok(())
    }

    #[test]
    fn zero_length_tail_is_ignored() -> Result<()> {
        let h: Harness = Harness::new()?;
        ensure_eq!(matches!(h.xmit(packet(54, &[5, 3, 0, 0])?), TxStatus::Sent), true);
        let wqe: SqWqe = h.wqe(0)?;
        ensure_eq!(wqe.sges.len(), 3);
        ensure_eq!(wqe.frame_len, 62);
        Ok(())
    }

    #[test]
    fn short_frames_are_padded() -> Result<()> {
        let h: Harness = Harness::new()?;
        ensure_eq!(matches!(h.xmit(packet(14, &[4])?), TxStatus::Sent), true);
        let wqe: SqWqe = h.wqe(0)?;
        ensure_eq!(wqe.frame_len, 32);
        ensure_eq!(wqe.sges.len(), 1);
        ensure_eq!(wqe.sges[0].len, 32);
        ensure_eq!(h.iommu.read(wqe.sges[0].addr, 32).map(|b| b[18..].to_vec()), Some(vec![0; 14]));
        Ok(())
    }

    #[test]
    fn oversized_payload_offset_drops_packet() -> Result<()> {
        let h: Harness = Harness::new()?;
        let layout: HeaderLayout = HeaderLayout {
            l2_len: 14,
            l3: L3Proto::Ipv6,
            l3_len: 160,
            l4: L4Proto::Tcp,
            l4_len: 60,
            tunnel: None,
        };
        let status: TxStatus = h.xmit(packet(256, &[1000])?.with_layout(layout).with_gso(1000, 2));
        ensure_eq!(matches!(status, TxStatus::Dropped(DropReason::Offload)), true);
        ensure_eq!(h.stats().offload_errors, 1);
        Ok(())
    }

    #[test]
    fn mapping_failure_returns_ring_space() -> Result<()> {
        let h: Harness = Harness::new()?;
        h.iommu.fail_maps(1, 1);
        let status: TxStatus = h.xmit(packet(54, &[100, 100])?);
        ensure_eq!(matches!(status, TxStatus::Dropped(DropReason::MapFrag)), true);
        ensure_eq!(h.stats().map_frag_errors, 1);
        ensure_eq!(h.queue.lock().unwrap().shared().wq().outstanding(), 0);

        h.allocator.fail_allocs(0, 1);
        let status: TxStatus = h.xmit(packet(54, &[10; 20])?);
        ensure_eq!(matches!(status, TxStatus::Dropped(DropReason::ScratchAlloc)), true);
        ensure_eq!(h.stats().alloc_scratch_errors, 1);
        ensure_eq!(h.stats().dropped, 2);
        Ok(())
    }

    #[test]
    fn doorbell_is_deferred_while_more_packets_follow() -> Result<()> {
        let h: Harness = Harness::new()?;
        for _ in 0..3 {
            ensure_eq!(matches!(h.xmit(packet(60, &[])?.with_more(true)), TxStatus::Sent), true);
        }
        ensure_eq!(h.nic.sq_doorbells(0), 0);
        ensure_eq!(matches!(h.xmit(packet(60, &[])?), TxStatus::Sent), true);
        ensure_eq!(h.nic.sq_doorbells(0), 1);
        ensure_eq!(h.nic.last_sq_pi(0), Some(4));

        ensure_eq!(matches!(h.xmit(packet(60, &[])?.with_more(true)), TxStatus::Sent), true);
        h.queue.lock().unwrap().flush();
        ensure_eq!(h.nic.sq_doorbells(0), 2);
        Ok(())
    }

    #[test]
    fn tso_counts_and_scratch_copies() -> Result<()> {
        let h: Harness = Harness::new()?;
        let layout: HeaderLayout = HeaderLayout {
            l2_len: 14,
            l3: L3Proto::Ipv4,
            l3_len: 20,
            l4: L4Proto::Tcp,
            l4_len: 20,
            tunnel: None,
        };
        let status: TxStatus = h.xmit(packet(54, &[1000; 20])?.with_layout(layout).with_gso(1000, 20));
        ensure_eq!(matches!(status, TxStatus::Sent), true);
        let stats: TxQueueStats = h.stats();
        ensure_eq!(stats.tso_packets, 1);
        ensure_eq!(stats.scratch_copies, 1);
        let wqe: SqWqe = h.wqe(0)?;
        ensure_eq!(wqe.sges.len(), 17);
        ensure_eq!(wqe.task.mss, Some(1000));
        Ok(())
    }

    #[test]
    fn stopped_for_teardown_drops() -> Result<()> {
        let h: Harness = Harness::new()?;
        h.queue.lock().unwrap().shared().stop_accepting();
        let status: TxStatus = h.xmit(packet(60, &[])?);
        ensure_eq!(matches!(status, TxStatus::Dropped(DropReason::QueueDown)), true);
        Ok(())
    }
}
