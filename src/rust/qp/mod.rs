// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    coalesce::{
        CoalesceController,
        CoalesceInfo,
        CoalesceRequest,
        CoalesceTarget,
        QueueCounters,
        RateSource,
    },
    config::DataplaneConfig,
    hw::{
        cmd::QueueCtxt,
        Hardware,
    },
    runtime::{
        fail::{
            Fail,
            FirstFail,
        },
        memory::{
            DmaAllocator,
            DmaMapper,
        },
    },
    rx::{
        packet::{
            NetStack,
            PacketAllocator,
        },
        RxQueue,
        RxQueueStats,
        RxStats,
    },
    tx::{
        packet::TxPacket,
        reclaim::TxReclaimer,
        DropReason,
        SqShared,
        TxQueue,
        TxQueueStats,
        TxStatus,
    },
};
use ::std::{
    ops::Add,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        TryLockError,
    },
    thread,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Delay between two checks of the device consumer index while draining a send queue.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Everything a queue set needs from the rest of the system.
#[derive(Clone)]
pub struct DeviceResources {
    pub hw: Arc<dyn Hardware>,
    pub mapper: Arc<dyn DmaMapper>,
    pub allocator: Arc<dyn DmaAllocator>,
    pub packets: Arc<dyn PacketAllocator>,
    pub stack: Arc<dyn NetStack>,
}

/// Statistics of one queue pair, or of several added together.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub rx: RxQueueStats,
    pub tx: TxQueueStats,
}

/// State owned by the poll context of one queue pair.
struct QueuePoller {
    rx: RxQueue,
    reclaimer: TxReclaimer,
}

struct QueuePair {
    /// Transmit lock.
    tx: Arc<Mutex<TxQueue>>,
    sq: Arc<SqShared>,
    rx_stats: Arc<RxStats>,
    poller: Mutex<QueuePoller>,
}

/// Reads the counters the interrupt moderation is computed from.
struct PairCounters {
    rx: Vec<Arc<RxStats>>,
    sq: Vec<Arc<SqShared>>,
}

/// The queue pairs of an interface that is up.
pub struct QueueSet {
    config: DataplaneConfig,
    hw: Arc<dyn Hardware>,
    /// Cleared first on teardown. Doorbells, wakes and moderation pushes check it.
    intf_up: Arc<AtomicBool>,
    pairs: Vec<QueuePair>,
    coalesce: Arc<CoalesceController>,
    closed: AtomicBool,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl QueueSet {
    /// Creates every queue pair, tells the device about them and brings the interface up.
    pub fn open(config: &DataplaneConfig, resources: DeviceResources) -> Result<Self, Fail> {
        config.validate()?;
        let intf_up: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));

        let mut pairs: Vec<QueuePair> = Vec::with_capacity(config.num_queues as usize);
        for qid in 0..config.num_queues {
            let (tx, reclaimer): (Arc<Mutex<TxQueue>>, TxReclaimer) = TxQueue::create(
                qid,
                config,
                resources.hw.clone(),
                resources.mapper.clone(),
                resources.allocator.clone(),
                intf_up.clone(),
            )?;
            let rx: RxQueue = RxQueue::create(
                qid,
                config,
                resources.hw.clone(),
                resources.mapper.clone(),
                resources.allocator.clone(),
                resources.packets.clone(),
                resources.stack.clone(),
                intf_up.clone(),
            )?;
            pairs.push(QueuePair {
                sq: reclaimer.shared().clone(),
                rx_stats: rx.stats_handle(),
                tx,
                poller: Mutex::new(QueuePoller { rx, reclaimer }),
            });
        }

        let counters: Arc<PairCounters> = Arc::new(PairCounters {
            rx: pairs.iter().map(|pair| pair.rx_stats.clone()).collect(),
            sq: pairs.iter().map(|pair| pair.sq.clone()).collect(),
        });
        let coalesce: Arc<CoalesceController> = Arc::new(CoalesceController::new(
            config.num_queues,
            &config.coalesce,
            resources.hw.clone(),
            counters,
            intf_up.clone(),
        ));

        let set: QueueSet = QueueSet {
            config: config.clone(),
            hw: resources.hw,
            intf_up,
            pairs,
            coalesce,
            closed: AtomicBool::new(true),
        };
        set.start()?;
        info!("open(): num_queues={} sq_depth={} rq_depth={}", config.num_queues, config.sq_depth, config.rq_depth);
        Ok(set)
    }

    /// Registers the queues with the device and rings the first receive doorbells. Undoes what it did on failure.
    fn start(&self) -> Result<(), Fail> {
        for (qid, pair) in self.pairs.iter().enumerate() {
            let ctxt: QueueCtxt = self.queue_ctxt(qid as u16, pair);
            if let Err(e) = self.hw.set_queue_ctxt(&ctxt) {
                self.clear_ctxts(qid);
                return Err(e);
            }
        }
        self.closed.store(false, Ordering::Release);
        self.intf_up.store(true, Ordering::Release);

        let armed: Result<(), Fail> = self.pairs.iter().try_for_each(|pair| {
            let poller: MutexGuard<QueuePoller> = lock(&pair.poller);
            poller.rx.notify();
            poller.rx.arm_backpressure()
        });
        if let Err(e) = armed.and_then(|()| self.coalesce.apply_initial()) {
            error!("start(): cannot bring queues up: {:?}", e);
            let _ = self.close();
            return Err(e);
        }
        Ok(())
    }

    fn queue_ctxt(&self, qid: u16, pair: &QueuePair) -> QueueCtxt {
        let poller: MutexGuard<QueuePoller> = lock(&pair.poller);
        QueueCtxt {
            qid,
            cos: self.config.cos(qid),
            sq_depth: self.config.sq_depth,
            sq_base: pair.sq.wq().base_addr(),
            sq_ci_addr: pair.sq.ci_addr(),
            rq_depth: self.config.rq_depth,
            rq_base: poller.rx.pool().wq().base_addr(),
            cqe_base: poller.rx.cq_addr(),
            rx_buf_len: self.config.rx.buf_len as u32,
        }
    }

    fn clear_ctxts(&self, count: usize) {
        for qid in 0..count as u16 {
            if let Err(e) = self.hw.clear_queue_ctxt(qid) {
                warn!("clear_ctxts(): cannot clear queue context (qid={}): {:?}", qid, e);
            }
        }
    }

    pub fn num_queues(&self) -> u16 {
        self.pairs.len() as u16
    }

    pub fn config(&self) -> &DataplaneConfig {
        &self.config
    }

    pub fn is_up(&self) -> bool {
        self.intf_up.load(Ordering::Acquire)
    }

    /// Controller of the interrupt moderation of this set, for a periodic ticker.
    pub fn coalesce_controller(&self) -> &Arc<CoalesceController> {
        &self.coalesce
    }

    /// Sends `packet` on queue `qid`.
    pub fn xmit(&self, qid: u16, packet: TxPacket) -> TxStatus {
        match self.pairs.get(qid as usize) {
            Some(pair) => lock(&pair.tx).xmit(packet),
            None => TxStatus::Dropped(DropReason::QueueDown),
        }
    }

    /// Rings the doorbell of queue `qid` if packets flagged `more` left it pending.
    pub fn flush_tx(&self, qid: u16) {
        if let Some(pair) = self.pairs.get(qid as usize) {
            lock(&pair.tx).flush();
        }
    }

    /// Reclaims completed transmits and delivers up to `budget` received packets on queue `qid`.
    ///
    /// Returns the number of packets delivered, or `budget` if transmit completions alone used it up. A concurrent
    /// poll of the same queue makes this return 0 immediately.
    pub fn poll(&self, qid: u16, budget: usize) -> usize {
        let pair: &QueuePair = match self.pairs.get(qid as usize) {
            Some(pair) => pair,
            None => return 0,
        };
        let mut poller: MutexGuard<QueuePoller> = match pair.poller.try_lock() {
            Ok(poller) => poller,
            Err(TryLockError::WouldBlock) => return 0,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
        };

        let tx_done: usize = poller.reclaimer.reclaim(budget);
        let rx_done: usize = poller.rx.poll(budget);
        if tx_done >= budget {
            budget
        } else {
            rx_done
        }
    }

    /// Refuses further transmits on queue `qid`. Packets already on the ring are still completed.
    pub fn stop_queue(&self, qid: u16) -> Result<(), Fail> {
        let pair: &QueuePair = self.pair(qid)?;
        pair.sq.stop_accepting();
        debug!("stop_queue(): qid={}", qid);
        Ok(())
    }

    /// Stops queue `qid` and waits until the device consumed everything posted to it.
    ///
    /// If the device does not drain within the stop timeout the queue is force dropped and waited for once more.
    pub fn flush_queue(&self, qid: u16) -> Result<(), Fail> {
        self.stop_queue(qid)?;
        self.flush_tx(qid);
        self.drain(qid)
    }

    fn drain(&self, qid: u16) -> Result<(), Fail> {
        let pair: &QueuePair = self.pair(qid)?;
        let timeout: Duration = self.config.stop_timeout;
        if wait_drained(&pair.sq, timeout) {
            return Ok(());
        }

        warn!("drain(): send queue did not drain, forcing a drop (qid={})", qid);
        self.hw.force_drop_sq(qid)?;
        if wait_drained(&pair.sq, timeout) {
            return Ok(());
        }

        let cause: String = format!(
            "send queue did not drain (qid={}, pi={}, hw_ci={})",
            qid,
            pair.sq.wq().pi(),
            pair.sq.hw_ci()
        );
        error!("drain(): {}", cause);
        Err(Fail::new(libc::ETIMEDOUT, &cause))
    }

    /// Takes the interface down: drains every send queue, removes the queues from the device and frees their
    /// buffers. Teardown runs to completion even if a step fails; the first failure is returned.
    pub fn close(&self) -> Result<(), Fail> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        for (qid, pair) in self.pairs.iter().enumerate() {
            pair.sq.stop_accepting();
            self.flush_tx(qid as u16);
        }
        self.intf_up.store(false, Ordering::Release);

        let mut first: FirstFail = FirstFail::default();
        for qid in 0..self.num_queues() {
            first.record(self.drain(qid));
        }
        for qid in 0..self.num_queues() {
            let result: Result<(), Fail> = self.hw.clear_queue_ctxt(qid);
            if let Err(e) = &result {
                warn!("close(): cannot clear queue context (qid={}): {:?}", qid, e);
            }
            first.record(result);
        }
        for pair in &self.pairs {
            let mut poller: MutexGuard<QueuePoller> = lock(&pair.poller);
            poller.reclaimer.reclaim(usize::MAX);
            poller.reclaimer.release_all();
            poller.rx.release_buffers();
        }

        info!("close(): num_queues={}", self.num_queues());
        first.into_result()
    }

    pub fn set_coalesce(&self, target: CoalesceTarget, request: &CoalesceRequest) -> Result<(), Fail> {
        self.coalesce.set_coalesce(target, request)
    }

    pub fn get_coalesce(&self, qid: u16) -> Result<CoalesceInfo, Fail> {
        self.coalesce.get_coalesce(qid)
    }

    /// Recomputes the adaptive moderation of every queue.
    pub fn tick_coalesce(&self, now: Instant) -> usize {
        self.coalesce.tick(now)
    }

    pub fn queue_stats(&self, qid: u16) -> Result<QueueStats, Fail> {
        let pair: &QueuePair = self.pair(qid)?;
        Ok(QueueStats {
            rx: pair.rx_stats.snapshot(),
            tx: pair.sq.stats(),
        })
    }

    /// Statistics of all queues added together.
    pub fn stats(&self) -> QueueStats {
        self.pairs
            .iter()
            .map(|pair| QueueStats {
                rx: pair.rx_stats.snapshot(),
                tx: pair.sq.stats(),
            })
            .fold(QueueStats::default(), Add::add)
    }

    fn pair(&self, qid: u16) -> Result<&QueuePair, Fail> {
        match self.pairs.get(qid as usize) {
            Some(pair) => Ok(pair),
            None => {
                let cause: String = format!("invalid queue (qid={}, num_queues={})", qid, self.pairs.len());
                error!("pair(): {}", cause);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Waits up to `timeout` for the device consumer index to reach the producer index.
fn wait_drained(sq: &SqShared, timeout: Duration) -> bool {
    let deadline: Instant = Instant::now() + timeout;
    loop {
        if sq.is_drained() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(DRAIN_POLL_INTERVAL);
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl RateSource for PairCounters {
    fn counters(&self, qid: u16) -> QueueCounters {
        let rx: RxQueueStats = self
            .rx
            .get(qid as usize)
            .map(|stats| stats.snapshot())
            .unwrap_or_default();
        let tx_packets: u64 = self.sq.get(qid as usize).map_or(0, |sq| sq.stats().packets);
        QueueCounters {
            rx_packets: rx.packets,
            rx_bytes: rx.bytes,
            tx_packets,
        }
    }
}

impl Add for QueueStats {
    type Output = QueueStats;

    fn add(self, other: QueueStats) -> QueueStats {
        QueueStats {
            rx: self.rx + other.rx,
            tx: self.tx + other.tx,
        }
    }
}

impl Drop for QueueSet {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("drop(): teardown did not complete cleanly: {:?}", e);
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
