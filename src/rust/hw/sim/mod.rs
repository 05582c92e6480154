// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Software model of the device, used by the tests and the demo program.

//======================================================================================================================
// Exports
//======================================================================================================================

mod alloc;
mod iommu;

pub use self::{
    alloc::{
        SimAllocator,
        SimPacketAllocator,
    },
    iommu::SimIommu,
};

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    hw::{
        cmd::{
            CommandHandler,
            CommandTable,
            InterruptCfg,
            MgmtCmd,
            QueueCtxt,
            QueueCtxtClear,
            RqBpThreshold,
            SqForceDrop,
        },
        Hardware,
    },
    runtime::{
        fail::Fail,
        limits::{
            CQE_SIZE,
            RQ_WQE_SIZE,
            SQ_WQEBB_SIZE,
        },
        memory::{
            DmaAddr,
            DmaRegion,
        },
    },
    rx::cqe::{
        RqWqe,
        RxCqe,
    },
    tx::{
        offload::TxTask,
        wqe::SqWqe,
    },
};
use ::std::{
    collections::{
        HashMap,
        HashSet,
    },
    sync::{
        atomic::Ordering,
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Fails a window of calls: the first `skip` calls after arming pass, the `count` calls after them fail.
#[derive(Default)]
pub(crate) struct FaultInjector {
    window: Mutex<(usize, usize)>,
}

/// A frame the device took off a send queue.
#[derive(Clone, Debug)]
pub struct SentFrame {
    pub qid: u16,
    pub cos: u8,
    pub data: Vec<u8>,
    pub task: TxTask,
    pub wqebb_cnt: u16,
}

#[derive(Clone, Copy, Debug, Default)]
struct DoorbellLog {
    count: usize,
    last: Option<u16>,
}

/// Device view of one queue pair.
struct SimQueue {
    ctxt: QueueCtxt,
    cos: u8,
    /// Free-running producer index, advanced by each send queue doorbell.
    sq_pi: u16,
    /// Free-running consumer index.
    sq_ci: u16,
    /// Next receive queue entry the device fills.
    rq_ci: u16,
}

#[derive(Default)]
struct NicState {
    queues: HashMap<u16, SimQueue>,
    sent: HashMap<u16, Vec<SentFrame>>,
    /// Frames discarded by force drops.
    discarded: HashMap<u16, usize>,
    sq_doorbells: HashMap<u16, DoorbellLog>,
    rq_doorbells: HashMap<u16, DoorbellLog>,
    interrupt_cfgs: HashMap<u16, InterruptCfg>,
    interrupt_sets: HashMap<u16, usize>,
    bp_thresholds: HashMap<u16, Vec<u16>>,
    force_drops: HashMap<u16, usize>,
    mgmt_calls: HashMap<MgmtCmd, usize>,
    failing: HashSet<MgmtCmd>,
    /// Send queues are consumed as soon as their doorbell rings.
    auto_drain: bool,
    /// Force drop commands are acknowledged but do nothing.
    ignore_force_drop: bool,
}

/// A software device.
///
/// Send queue doorbells are recorded and their entries are consumed on request ([SimNic::complete_tx]) or right away
/// in auto-drain mode. Received frames are written into posted buffers through the IOMMU. Management commands go
/// through a [CommandTable].
pub struct SimNic {
    iommu: Arc<SimIommu>,
    commands: CommandTable,
    state: Arc<Mutex<NicState>>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl FaultInjector {
    pub fn arm(&self, skip: usize, count: usize) {
        *self.window.lock().unwrap_or_else(PoisonError::into_inner) = (skip, count);
    }

    /// Whether the current call fails.
    pub fn hit(&self) -> bool {
        let mut window: MutexGuard<(usize, usize)> = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        match *window {
            (_, 0) => false,
            (0, count) => {
                window.1 = count - 1;
                true
            },
            (skip, _) => {
                window.0 = skip - 1;
                false
            },
        }
    }
}

impl SimNic {
    pub fn new(iommu: Arc<SimIommu>) -> Self {
        let state: Arc<Mutex<NicState>> = Arc::new(Mutex::new(NicState::default()));

        let handlers: [(MgmtCmd, CommandHandler); 6] = [
            (MgmtCmd::SetQueueCtxt, {
                let state: Arc<Mutex<NicState>> = state.clone();
                Box::new(move |req: &[u8]| set_queue_ctxt(&state, req))
            }),
            (MgmtCmd::ClearQueueCtxt, {
                let state: Arc<Mutex<NicState>> = state.clone();
                Box::new(move |req: &[u8]| clear_queue_ctxt(&state, req))
            }),
            (MgmtCmd::GetInterruptCfg, {
                let state: Arc<Mutex<NicState>> = state.clone();
                Box::new(move |req: &[u8]| get_interrupt_cfg(&state, req))
            }),
            (MgmtCmd::SetInterruptCfg, {
                let state: Arc<Mutex<NicState>> = state.clone();
                Box::new(move |req: &[u8]| set_interrupt_cfg(&state, req))
            }),
            (MgmtCmd::SetRqBpThreshold, {
                let state: Arc<Mutex<NicState>> = state.clone();
                Box::new(move |req: &[u8]| set_rq_bp_threshold(&state, req))
            }),
            (MgmtCmd::ForceDropSq, {
                let state: Arc<Mutex<NicState>> = state.clone();
                let iommu: Arc<SimIommu> = iommu.clone();
                Box::new(move |req: &[u8]| force_drop_sq(&state, &iommu, req))
            }),
        ];

        let mut commands: CommandTable = CommandTable::new();
        for (cmd, handler) in handlers {
            if let Err(e) = commands.register(cmd, handler) {
                warn!("new(): {:?}", e);
            }
        }

        Self { iommu, commands, state }
    }

    /// Removes the handler of `cmd`, so that the device rejects it.
    pub fn without_command(mut self, cmd: MgmtCmd) -> Self {
        self.commands.unregister(cmd);
        self
    }

    pub fn iommu(&self) -> &Arc<SimIommu> {
        &self.iommu
    }

    /// Consume send queues as soon as their doorbell rings.
    pub fn set_auto_drain(&self, enabled: bool) {
        self.lock().auto_drain = enabled;
    }

    /// Acknowledge force drop commands without discarding anything.
    pub fn set_ignore_force_drop(&self, ignore: bool) {
        self.lock().ignore_force_drop = ignore;
    }

    /// Makes `cmd` fail with `EIO` until cleared.
    pub fn set_command_failure(&self, cmd: MgmtCmd, fail: bool) {
        let mut state: MutexGuard<NicState> = self.lock();
        if fail {
            state.failing.insert(cmd);
        } else {
            state.failing.remove(&cmd);
        }
    }

    pub fn sq_doorbells(&self, qid: u16) -> usize {
        self.lock().sq_doorbells.get(&qid).map_or(0, |log| log.count)
    }

    pub fn last_sq_pi(&self, qid: u16) -> Option<u16> {
        self.lock().sq_doorbells.get(&qid).and_then(|log| log.last)
    }

    pub fn rq_doorbells(&self, qid: u16) -> usize {
        self.lock().rq_doorbells.get(&qid).map_or(0, |log| log.count)
    }

    pub fn last_rq_pi(&self, qid: u16) -> Option<u16> {
        self.lock().rq_doorbells.get(&qid).and_then(|log| log.last)
    }

    pub fn queue_ctxt(&self, qid: u16) -> Option<QueueCtxt> {
        self.lock().queues.get(&qid).map(|q| q.ctxt)
    }

    pub fn interrupt_cfg(&self, qid: u16) -> Option<InterruptCfg> {
        self.lock().interrupt_cfgs.get(&qid).copied()
    }

    /// Number of interrupt configuration writes for `qid`.
    pub fn interrupt_sets(&self, qid: u16) -> usize {
        self.lock().interrupt_sets.get(&qid).copied().unwrap_or(0)
    }

    pub fn bp_thresholds(&self, qid: u16) -> Vec<u16> {
        self.lock().bp_thresholds.get(&qid).cloned().unwrap_or_default()
    }

    pub fn force_drops(&self, qid: u16) -> usize {
        self.lock().force_drops.get(&qid).copied().unwrap_or(0)
    }

    /// Frames discarded by force drops.
    pub fn discarded(&self, qid: u16) -> usize {
        self.lock().discarded.get(&qid).copied().unwrap_or(0)
    }

    pub fn mgmt_calls(&self, cmd: MgmtCmd) -> usize {
        self.lock().mgmt_calls.get(&cmd).copied().unwrap_or(0)
    }

    /// Takes the frames sent on `qid` so far.
    pub fn take_sent(&self, qid: u16) -> Vec<SentFrame> {
        self.lock().sent.remove(&qid).unwrap_or_default()
    }

    /// Basic blocks rung but not consumed yet.
    pub fn pending_tx(&self, qid: u16) -> u16 {
        self.lock()
            .queues
            .get(&qid)
            .map_or(0, |q| q.sq_pi.wrapping_sub(q.sq_ci))
    }

    /// Consumes up to `max` packets from send queue `qid` and publishes the new consumer index. Returns the number of
    /// packets consumed.
    pub fn complete_tx(&self, qid: u16, max: usize) -> usize {
        let mut state: MutexGuard<NicState> = self.lock();
        let NicState { queues, sent, .. } = &mut *state;
        match queues.get_mut(&qid) {
            Some(queue) => consume_sq(&self.iommu, queue, sent.entry(qid).or_default(), max),
            None => 0,
        }
    }

    /// Moves the send queue consumer index `n` basic blocks forward without looking at the entries.
    pub fn advance_sq_ci(&self, qid: u16, n: u16) -> bool {
        let mut state: MutexGuard<NicState> = self.lock();
        match state.queues.get_mut(&qid) {
            Some(queue) => {
                queue.sq_ci = queue.sq_ci.wrapping_add(n);
                publish_sq_ci(&self.iommu, queue);
                true
            },
            None => false,
        }
    }

    /// Receives `frame` on queue `qid` and reports it with `cqe`, whose length field must match.
    pub fn inject_rx(&self, qid: u16, frame: &[u8], cqe: RxCqe) -> Result<(), Fail> {
        debug_assert_eq!(cqe.pkt_len(), frame.len());
        self.deliver(qid, &[frame], cqe)
    }

    /// Receives `frame` on queue `qid` without offload metadata.
    pub fn receive(&self, qid: u16, frame: &[u8]) -> Result<(), Fail> {
        let len: u16 = frame_len(frame)?;
        self.deliver(qid, &[frame], RxCqe::packet(len))
    }

    /// Receives up to eight frames on queue `qid` and reports them with one completion.
    pub fn inject_rx_super(&self, qid: u16, frames: &[&[u8]]) -> Result<(), Fail> {
        let lens: Vec<u16> = frames.iter().map(|f| frame_len(f)).collect::<Result<_, Fail>>()?;
        self.deliver(qid, frames, RxCqe::super_packet(&lens))
    }

    /// Writes `frames` into consecutive posted buffers and publishes `cqe` in the completion entry of the first one.
    fn deliver(&self, qid: u16, frames: &[&[u8]], cqe: RxCqe) -> Result<(), Fail> {
        let mut state: MutexGuard<NicState> = self.lock();
        let posted: u16 = state.rq_doorbells.get(&qid).and_then(|log| log.last).unwrap_or(0);
        let queue: &mut SimQueue = match state.queues.get_mut(&qid) {
            Some(queue) => queue,
            None => return Err(Fail::new(libc::ENOENT, "no such queue")),
        };

        let buf_len: usize = queue.ctxt.rx_buf_len as usize;
        let slots: usize = frames.iter().map(|f| f.len().div_ceil(buf_len).max(1)).sum();
        if (posted.wrapping_sub(queue.rq_ci) as usize) < slots {
            return Err(Fail::new(libc::ENOBUFS, "not enough posted receive buffers"));
        }

        let first: RqWqe = fetch_rq_wqe(&self.iommu, &queue.ctxt, queue.rq_ci)?;
        let (cq, offset): (DmaRegion, usize) = match self.iommu.translate(first.cqe_addr, CQE_SIZE) {
            Some(entry) => entry,
            None => return Err(Fail::new(libc::EFAULT, "completion entry is not mapped")),
        };
        if RxCqe::is_done(&cq, offset) {
            return Err(Fail::new(libc::EBUSY, "completion entry not yet consumed"));
        }

        let mut slot: u16 = queue.rq_ci;
        for frame in frames {
            if frame.is_empty() {
                slot = slot.wrapping_add(1);
                continue;
            }
            for chunk in frame.chunks(buf_len) {
                let wqe: RqWqe = fetch_rq_wqe(&self.iommu, &queue.ctxt, slot)?;
                if !self.iommu.write(wqe.buf_addr, chunk) {
                    return Err(Fail::new(libc::EFAULT, "receive buffer is not mapped"));
                }
                slot = slot.wrapping_add(1);
            }
        }
        cqe.publish(&cq, offset);
        queue.rq_ci = slot;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<NicState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

fn lock(state: &Mutex<NicState>) -> MutexGuard<NicState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn frame_len(frame: &[u8]) -> Result<u16, Fail> {
    u16::try_from(frame.len()).map_err(|_| Fail::new(libc::EINVAL, "frame too long for a completion entry"))
}

fn set_queue_ctxt(state: &Mutex<NicState>, req: &[u8]) -> Result<Vec<u8>, Fail> {
    let ctxt: QueueCtxt = QueueCtxt::decode(req)?;
    if !ctxt.sq_depth.is_power_of_two() || !ctxt.rq_depth.is_power_of_two() || ctxt.rx_buf_len == 0 {
        let cause: String = format!("invalid queue context (qid={})", ctxt.qid);
        warn!("set_queue_ctxt(): {}", cause);
        return Err(Fail::new(libc::EINVAL, &cause));
    }
    lock(state).queues.insert(
        ctxt.qid,
        SimQueue {
            ctxt,
            cos: ctxt.cos,
            sq_pi: 0,
            sq_ci: 0,
            rq_ci: 0,
        },
    );
    Ok(Vec::new())
}

fn clear_queue_ctxt(state: &Mutex<NicState>, req: &[u8]) -> Result<Vec<u8>, Fail> {
    let msg: QueueCtxtClear = QueueCtxtClear::decode(req)?;
    match lock(state).queues.remove(&msg.qid) {
        Some(_) => Ok(Vec::new()),
        None => Err(Fail::new(libc::ENOENT, "no such queue")),
    }
}

fn get_interrupt_cfg(state: &Mutex<NicState>, req: &[u8]) -> Result<Vec<u8>, Fail> {
    let query: InterruptCfg = InterruptCfg::decode(req)?;
    let cfg: InterruptCfg = lock(state)
        .interrupt_cfgs
        .get(&query.qid)
        .copied()
        .unwrap_or(InterruptCfg {
            qid: query.qid,
            ..Default::default()
        });
    Ok(cfg.encode())
}

fn set_interrupt_cfg(state: &Mutex<NicState>, req: &[u8]) -> Result<Vec<u8>, Fail> {
    let cfg: InterruptCfg = InterruptCfg::decode(req)?;
    let mut state: MutexGuard<NicState> = lock(state);
    state.interrupt_cfgs.insert(cfg.qid, cfg);
    *state.interrupt_sets.entry(cfg.qid).or_default() += 1;
    Ok(Vec::new())
}

fn set_rq_bp_threshold(state: &Mutex<NicState>, req: &[u8]) -> Result<Vec<u8>, Fail> {
    let msg: RqBpThreshold = RqBpThreshold::decode(req)?;
    lock(state).bp_thresholds.entry(msg.qid).or_default().push(msg.threshold);
    Ok(Vec::new())
}

fn force_drop_sq(state: &Mutex<NicState>, iommu: &SimIommu, req: &[u8]) -> Result<Vec<u8>, Fail> {
    let msg: SqForceDrop = SqForceDrop::decode(req)?;
    let mut state: MutexGuard<NicState> = lock(state);
    *state.force_drops.entry(msg.qid).or_default() += 1;
    if state.ignore_force_drop {
        return Ok(Vec::new());
    }

    let NicState { queues, discarded, .. } = &mut *state;
    if let Some(queue) = queues.get_mut(&msg.qid) {
        let mask: u16 = queue.ctxt.sq_depth - 1;
        let mut dropped: usize = 0;
        while queue.sq_ci != queue.sq_pi {
            let n: u16 = match iommu.read(sq_wqebb_addr(&queue.ctxt, queue.sq_ci & mask), SQ_WQEBB_SIZE) {
                Some(head) => SqWqe::peek_wqebb_count(&head).max(1),
                None => queue.sq_pi.wrapping_sub(queue.sq_ci),
            };
            queue.sq_ci = queue.sq_ci.wrapping_add(n);
            dropped += 1;
        }
        *discarded.entry(msg.qid).or_default() += dropped;
        publish_sq_ci(iommu, queue);
    }
    Ok(Vec::new())
}

fn sq_wqebb_addr(ctxt: &QueueCtxt, idx: u16) -> DmaAddr {
    ctxt.sq_base.offset(((idx & (ctxt.sq_depth - 1)) as usize) * SQ_WQEBB_SIZE)
}

/// Reads the whole send queue entry that starts at basic block `idx`, following the wrap of the ring.
fn fetch_sq_wqe(iommu: &SimIommu, ctxt: &QueueCtxt, idx: u16) -> Option<SqWqe> {
    let mut buf: Vec<u8> = iommu.read(sq_wqebb_addr(ctxt, idx), SQ_WQEBB_SIZE)?;
    let n: u16 = SqWqe::peek_wqebb_count(&buf);
    for k in 1..n {
        buf.extend(iommu.read(sq_wqebb_addr(ctxt, idx.wrapping_add(k)), SQ_WQEBB_SIZE)?);
    }
    SqWqe::decode(&buf).ok()
}

fn fetch_rq_wqe(iommu: &SimIommu, ctxt: &QueueCtxt, idx: u16) -> Result<RqWqe, Fail> {
    let addr: DmaAddr = ctxt
        .rq_base
        .offset(((idx & (ctxt.rq_depth - 1)) as usize) * RQ_WQE_SIZE);
    match iommu.read(addr, RQ_WQE_SIZE) {
        Some(buf) => RqWqe::decode(&buf),
        None => Err(Fail::new(libc::EFAULT, "receive queue is not mapped")),
    }
}

/// Consumes up to `max` packets, gathering their frames into `sent`.
fn consume_sq(iommu: &SimIommu, queue: &mut SimQueue, sent: &mut Vec<SentFrame>, max: usize) -> usize {
    let mut done: usize = 0;
    while done < max && queue.sq_ci != queue.sq_pi {
        let wqe: SqWqe = match fetch_sq_wqe(iommu, &queue.ctxt, queue.sq_ci) {
            Some(wqe) => wqe,
            None => {
                warn!("consume_sq(): unreadable entry (qid={}, ci={})", queue.ctxt.qid, queue.sq_ci);
                break;
            },
        };

        let mut data: Vec<u8> = Vec::with_capacity(wqe.frame_len as usize);
        for sge in &wqe.sges {
            match iommu.read(sge.addr, sge.len as usize) {
                Some(bytes) => data.extend(bytes),
                None => warn!("consume_sq(): unmapped segment (qid={}, addr={:?})", queue.ctxt.qid, sge.addr),
            }
        }
        if data.len() != wqe.frame_len as usize {
            warn!(
                "consume_sq(): frame length mismatch (qid={}, expected={}, got={})",
                queue.ctxt.qid,
                wqe.frame_len,
                data.len()
            );
        }

        let wqebb_cnt: u16 = SqWqe::wqebb_count(wqe.sges.len());
        sent.push(SentFrame {
            qid: queue.ctxt.qid,
            cos: queue.cos,
            data,
            task: wqe.task,
            wqebb_cnt,
        });
        queue.sq_ci = queue.sq_ci.wrapping_add(wqebb_cnt);
        done += 1;
    }
    if done > 0 {
        publish_sq_ci(iommu, queue);
    }
    done
}

fn publish_sq_ci(iommu: &SimIommu, queue: &SimQueue) {
    match iommu.translate(queue.ctxt.sq_ci_addr, 4) {
        Some((region, offset)) => region.store_u32(offset, queue.sq_ci as u32, Ordering::Release),
        None => warn!("publish_sq_ci(): consumer index mirror is not mapped (qid={})", queue.ctxt.qid),
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Hardware for SimNic {
    fn sq_doorbell(&self, qid: u16, cos: u8, pi: u16) {
        let mut state: MutexGuard<NicState> = self.lock();
        let log: &mut DoorbellLog = state.sq_doorbells.entry(qid).or_default();
        log.count += 1;
        log.last = Some(pi);

        let NicState {
            queues,
            sent,
            auto_drain,
            ..
        } = &mut *state;
        if let Some(queue) = queues.get_mut(&qid) {
            // The doorbell carries a masked index; the device keeps free-running ones.
            let mask: u16 = queue.ctxt.sq_depth - 1;
            queue.sq_pi = queue.sq_pi.wrapping_add(pi.wrapping_sub(queue.sq_pi) & mask);
            queue.cos = cos;
            if *auto_drain {
                consume_sq(&self.iommu, queue, sent.entry(qid).or_default(), usize::MAX);
            }
        }
    }

    fn rq_update_pi(&self, qid: u16, pi: u16) {
        let mut state: MutexGuard<NicState> = self.lock();
        let log: &mut DoorbellLog = state.rq_doorbells.entry(qid).or_default();
        log.count += 1;
        log.last = Some(pi);
    }

    fn mgmt(&self, cmd: MgmtCmd, req: &[u8]) -> Result<Vec<u8>, Fail> {
        {
            let mut state: MutexGuard<NicState> = self.lock();
            *state.mgmt_calls.entry(cmd).or_default() += 1;
            if state.failing.contains(&cmd) {
                return Err(Fail::new(libc::EIO, "injected command failure"));
            }
        }
        self.commands.dispatch(cmd, req)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
