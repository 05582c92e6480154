// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod moderation;

//======================================================================================================================
// Imports
//======================================================================================================================

use self::moderation::{
    HwCoalesce,
    Moderation,
    RateSample,
};
use crate::{
    config::CoalesceConfig,
    hw::{
        cmd::InterruptCfg,
        Hardware,
    },
    runtime::fail::Fail,
};
use ::crossbeam_channel::{
    select,
    Receiver,
    Sender,
};
use ::std::{
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
    thread::{
        self,
        JoinHandle,
    },
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// How the moderation of a queue is chosen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoalesceMode {
    /// Values pinned by the user. Never recomputed.
    Static,
    /// Values recomputed from the measured rate on every tick.
    Adaptive,
}

/// Queues affected by a coalescing request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoalesceTarget {
    Queue(u16),
    All,
}

/// One end of the adaptive curve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoalescePoint {
    /// Packets per second.
    pub rate: u64,
    pub timer_us: u32,
    pub pending_limit: u32,
}

/// A change of coalescing parameters. Fields left at `None` keep their current value.
///
/// Setting `timer_us` or `pending_limit` without `adaptive` pins the queue to static moderation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CoalesceRequest {
    pub adaptive: Option<bool>,
    pub timer_us: Option<u32>,
    pub pending_limit: Option<u32>,
    pub low: Option<CoalescePoint>,
    pub high: Option<CoalescePoint>,
}

/// Coalescing parameters of one queue as reported to the control plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoalesceInfo {
    pub mode: CoalesceMode,
    /// Values currently programmed into the device, if any.
    pub programmed: Option<Moderation>,
    /// Values used in static mode.
    pub timer_us: u32,
    pub pending_limit: u32,
    pub low: CoalescePoint,
    pub high: CoalescePoint,
}

/// Cumulative traffic counters of one queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueCounters {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
}

#[derive(Clone, Copy, Debug)]
struct Sample {
    counters: QueueCounters,
    at: Instant,
}

struct QueueCoalesce {
    mode: CoalesceMode,
    params: CoalesceConfig,
    /// `None` until something was written to the device.
    last_programmed: Option<HwCoalesce>,
    last_sample: Option<Sample>,
}

/// Per-queue interrupt moderation.
///
/// The periodic tick and the control plane serialize on the lock of each queue, so a static override can never be
/// overwritten by a tick that sampled before it.
pub struct CoalesceController {
    hw: Arc<dyn Hardware>,
    source: Arc<dyn RateSource>,
    intf_up: Arc<AtomicBool>,
    queues: Vec<Mutex<QueueCoalesce>>,
}

/// Background thread that ticks a [CoalesceController] at a fixed period.
pub struct CoalesceTicker {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

//======================================================================================================================
// Traits
//======================================================================================================================

/// Source of the counters the moderation is computed from.
pub trait RateSource: Send + Sync {
    fn counters(&self, qid: u16) -> QueueCounters;
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl CoalesceController {
    pub fn new(
        num_queues: u16,
        config: &CoalesceConfig,
        hw: Arc<dyn Hardware>,
        source: Arc<dyn RateSource>,
        intf_up: Arc<AtomicBool>,
    ) -> Self {
        let mode: CoalesceMode = if config.adaptive {
            CoalesceMode::Adaptive
        } else {
            CoalesceMode::Static
        };
        let queues: Vec<Mutex<QueueCoalesce>> = (0..num_queues)
            .map(|_| {
                Mutex::new(QueueCoalesce {
                    mode,
                    params: config.clone(),
                    last_programmed: None,
                    last_sample: None,
                })
            })
            .collect();
        Self {
            hw,
            source,
            intf_up,
            queues,
        }
    }

    pub fn num_queues(&self) -> u16 {
        self.queues.len() as u16
    }

    pub fn mode(&self, qid: u16) -> Result<CoalesceMode, Fail> {
        Ok(self.lock(qid)?.mode)
    }

    /// Programs the configured static values on every queue.
    pub fn apply_initial(&self) -> Result<(), Fail> {
        for qid in 0..self.num_queues() {
            let mut queue: MutexGuard<QueueCoalesce> = self.lock(qid)?;
            let static_values: Moderation = queue.static_values();
            self.push(qid, &mut queue, static_values)?;
        }
        Ok(())
    }

    /// Changes the coalescing parameters of one or all queues.
    ///
    /// The request is validated against every target queue before any of them is changed.
    pub fn set_coalesce(&self, target: CoalesceTarget, request: &CoalesceRequest) -> Result<(), Fail> {
        let qids: Vec<u16> = match target {
            CoalesceTarget::Queue(qid) => {
                self.check_qid(qid)?;
                vec![qid]
            },
            CoalesceTarget::All => (0..self.num_queues()).collect(),
        };

        let mut updates: Vec<(u16, CoalesceConfig, CoalesceMode)> = Vec::with_capacity(qids.len());
        for qid in qids {
            let queue: MutexGuard<QueueCoalesce> = self.lock(qid)?;
            let (params, mode) = apply_request(&queue.params, queue.mode, request)?;
            updates.push((qid, params, mode));
        }

        for (qid, params, mode) in updates {
            let mut queue: MutexGuard<QueueCoalesce> = self.lock(qid)?;
            queue.params = params;
            queue.mode = mode;
            debug!(
                "set_coalesce(): qid={} mode={:?} timer_us={} pending_limit={}",
                qid, mode, queue.params.timer_us, queue.params.pending_limit
            );
            if mode == CoalesceMode::Static {
                let static_values: Moderation = queue.static_values();
                self.push(qid, &mut queue, static_values)?;
            } else {
                // Restart rate measurement from the next tick.
                queue.last_sample = None;
            }
        }
        Ok(())
    }

    pub fn get_coalesce(&self, qid: u16) -> Result<CoalesceInfo, Fail> {
        let queue: MutexGuard<QueueCoalesce> = self.lock(qid)?;
        let params: &CoalesceConfig = &queue.params;
        Ok(CoalesceInfo {
            mode: queue.mode,
            programmed: queue
                .last_programmed
                .map(|hw| moderation::dequantize(params, hw)),
            timer_us: params.timer_us,
            pending_limit: params.pending_limit,
            low: CoalescePoint {
                rate: params.low_rate,
                timer_us: params.low_timer_us,
                pending_limit: params.low_pending_limit,
            },
            high: CoalescePoint {
                rate: params.high_rate,
                timer_us: params.high_timer_us,
                pending_limit: params.high_pending_limit,
            },
        })
    }

    /// Recomputes the moderation of every adaptive queue. Returns the number of queues reprogrammed.
    ///
    /// Device errors are logged and the queue is retried on the next tick.
    pub fn tick(&self, now: Instant) -> usize {
        let mut pushed: usize = 0;
        for qid in 0..self.num_queues() {
            let mut queue: MutexGuard<QueueCoalesce> = match self.lock(qid) {
                Ok(queue) => queue,
                Err(_) => continue,
            };
            if queue.mode == CoalesceMode::Static {
                continue;
            }

            let current: Sample = Sample {
                counters: self.source.counters(qid),
                at: now,
            };
            let previous: Sample = match queue.last_sample.replace(current) {
                Some(previous) => previous,
                None => continue,
            };
            let sample: RateSample = match rate_between(&previous, &current) {
                Some(sample) => sample,
                None => continue,
            };

            let target: Moderation = moderation::adaptive(&queue.params, &sample);
            match self.push(qid, &mut queue, target) {
                Ok(true) => pushed += 1,
                Ok(false) => (),
                Err(e) => warn!("tick(): failed to program moderation (qid={}, error={:?})", qid, e),
            }
        }
        pushed
    }

    /// Writes `target` to the device unless it quantizes to what is already programmed.
    fn push(&self, qid: u16, queue: &mut QueueCoalesce, target: Moderation) -> Result<bool, Fail> {
        let hw_value: HwCoalesce = moderation::quantize(&queue.params, target);
        if queue.last_programmed == Some(hw_value) || !self.intf_up.load(Ordering::Acquire) {
            return Ok(false);
        }

        let mut cfg: InterruptCfg = self.hw.get_interrupt_cfg(qid)?;
        cfg.coalesce_timer = hw_value.coalesce_timer;
        cfg.pending_limit = hw_value.pending_limit;
        cfg.resend_timer = hw_value.resend_timer;
        self.hw.set_interrupt_cfg(&cfg)?;

        trace!(
            "push(): qid={} timer={} pending_limit={}",
            qid,
            hw_value.coalesce_timer,
            hw_value.pending_limit
        );
        queue.last_programmed = Some(hw_value);
        Ok(true)
    }

    fn check_qid(&self, qid: u16) -> Result<(), Fail> {
        if qid >= self.num_queues() {
            let cause: String = format!("invalid queue (qid={}, num_queues={})", qid, self.num_queues());
            error!("check_qid(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        Ok(())
    }

    fn lock(&self, qid: u16) -> Result<MutexGuard<QueueCoalesce>, Fail> {
        self.check_qid(qid)?;
        Ok(self.queues[qid as usize]
            .lock()
            .unwrap_or_else(PoisonError::into_inner))
    }
}

impl QueueCoalesce {
    fn static_values(&self) -> Moderation {
        Moderation {
            timer_us: self.params.timer_us,
            pending_limit: self.params.pending_limit,
        }
    }
}

impl CoalesceTicker {
    /// Ticks `controller` every `period` until stopped.
    pub fn spawn(controller: Arc<CoalesceController>, period: Duration) -> Result<Self, Fail> {
        let (stop, stopped): (Sender<()>, Receiver<()>) = ::crossbeam_channel::bounded(1);
        let ticks: Receiver<Instant> = ::crossbeam_channel::tick(period);
        let handle: JoinHandle<()> = thread::Builder::new()
            .name("coalesce".to_string())
            .spawn(move || loop {
                select! {
                    recv(ticks) -> at => match at {
                        Ok(at) => {
                            controller.tick(at);
                        },
                        Err(_) => break,
                    },
                    recv(stopped) -> _ => break,
                }
            })?;
        debug!("spawn(): period={:?}", period);
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stops the thread and waits for it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.stop.send(());
            if handle.join().is_err() {
                warn!("shutdown(): coalescing thread panicked");
            }
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Builds the parameters and mode a queue would have after `request`.
fn apply_request(
    current: &CoalesceConfig,
    mode: CoalesceMode,
    request: &CoalesceRequest,
) -> Result<(CoalesceConfig, CoalesceMode), Fail> {
    let mut params: CoalesceConfig = current.clone();
    if let Some(timer_us) = request.timer_us {
        params.timer_us = timer_us;
    }
    if let Some(pending_limit) = request.pending_limit {
        params.pending_limit = pending_limit;
    }
    if let Some(low) = request.low {
        params.low_rate = low.rate;
        params.low_timer_us = low.timer_us;
        params.low_pending_limit = low.pending_limit;
    }
    if let Some(high) = request.high {
        params.high_rate = high.rate;
        params.high_timer_us = high.timer_us;
        params.high_pending_limit = high.pending_limit;
    }
    params.validate()?;

    let mode: CoalesceMode = match request.adaptive {
        Some(true) => CoalesceMode::Adaptive,
        Some(false) => CoalesceMode::Static,
        None if request.timer_us.is_some() || request.pending_limit.is_some() => CoalesceMode::Static,
        None => mode,
    };
    Ok((params, mode))
}

/// Per-second rates between two samples.
fn rate_between(previous: &Sample, current: &Sample) -> Option<RateSample> {
    let elapsed_us: u128 = current.at.checked_duration_since(previous.at)?.as_micros();
    if elapsed_us == 0 {
        return None;
    }
    let per_second = |delta: u64| -> u64 { (delta as u128 * 1_000_000 / elapsed_us).min(u64::MAX as u128) as u64 };

    let rx_packets: u64 = current
        .counters
        .rx_packets
        .wrapping_sub(previous.counters.rx_packets);
    let rx_bytes: u64 = current.counters.rx_bytes.wrapping_sub(previous.counters.rx_bytes);
    let tx_packets: u64 = current
        .counters
        .tx_packets
        .wrapping_sub(previous.counters.tx_packets);
    Some(RateSample {
        rx_rate: per_second(rx_packets),
        tx_rate: per_second(tx_packets),
        avg_pkt_size: if rx_packets == 0 { 0 } else { rx_bytes / rx_packets },
    })
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for CoalesceTicker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::{
        CoalesceController,
        CoalesceMode,
        CoalescePoint,
        CoalesceRequest,
        CoalesceTarget,
        CoalesceTicker,
        QueueCounters,
        RateSource,
    };
    use crate::{
        config::CoalesceConfig,
        coalesce::moderation::Moderation,
        ensure_eq,
        hw::{
            cmd::{
                InterruptCfg,
                MgmtCmd,
            },
            sim::{
                SimIommu,
                SimNic,
            },
        },
    };
    use ::anyhow::Result;
    use ::std::{
        sync::{
            atomic::{
                AtomicBool,
                Ordering,
            },
            Arc,
            Mutex,
        },
        thread,
        time::{
            Duration,
            Instant,
        },
    };

    #[derive(Default)]
    struct FakeCounters(Mutex<Vec<QueueCounters>>);

    impl FakeCounters {
        fn add(&self, qid: u16, rx_packets: u64, rx_bytes: u64) {
            let mut counters = self.0.lock().unwrap();
            if counters.len() <= qid as usize {
                counters.resize(qid as usize + 1, QueueCounters::default());
            }
            counters[qid as usize].rx_packets += rx_packets;
            counters[qid as usize].rx_bytes += rx_bytes;
        }
    }

    impl RateSource for FakeCounters {
        fn counters(&self, qid: u16) -> QueueCounters {
            self.0
                .lock()
                .unwrap()
                .get(qid as usize)
                .copied()
                .unwrap_or_default()
        }
    }

    struct Harness {
        nic: Arc<SimNic>,
        counters: Arc<FakeCounters>,
        intf_up: Arc<AtomicBool>,
        controller: CoalesceController,
    }

    fn harness(num_queues: u16) -> Harness {
        let nic: Arc<SimNic> = Arc::new(SimNic::new(Arc::new(SimIommu::new())));
        let counters: Arc<FakeCounters> = Arc::new(FakeCounters::default());
        let intf_up: Arc<AtomicBool> = Arc::new(AtomicBool::new(true));
        let controller: CoalesceController = CoalesceController::new(
            num_queues,
            &CoalesceConfig::default(),
            nic.clone(),
            counters.clone(),
            intf_up.clone(),
        );
        Harness {
            nic,
            counters,
            intf_up,
            controller,
        }
    }

    #[test]
    fn first_tick_only_samples() -> Result<()> {
        let h: Harness = harness(1);
        let start: Instant = Instant::now();
        ensure_eq!(h.controller.tick(start), 0);
        ensure_eq!(h.nic.mgmt_calls(MgmtCmd::GetInterruptCfg), 0);

        h.counters.add(0, 1_000_000, 1_000_000 * 1500);
        ensure_eq!(h.controller.tick(start + Duration::from_secs(1)), 1);
        let cfg: InterruptCfg = h.nic.interrupt_cfg(0).ok_or(anyhow::anyhow!("not programmed"))?;
        ensure_eq!(cfg.coalesce_timer, 25);
        ensure_eq!(cfg.pending_limit, 8);
        ensure_eq!(cfg.resend_timer, 8);
        Ok(())
    }

    #[test]
    fn unchanged_values_are_not_pushed() -> Result<()> {
        let h: Harness = harness(1);
        let mut now: Instant = Instant::now();
        h.controller.tick(now);
        for _ in 0..10 {
            h.counters.add(0, 1_000_000, 1_000_000 * 1500);
            now += Duration::from_secs(1);
            h.controller.tick(now);
        }
        ensure_eq!(h.nic.interrupt_sets(0), 1);

        // Same rate at half the period is twice the rate.
        h.counters.add(0, 100_000, 100_000 * 1500);
        now += Duration::from_millis(500);
        h.controller.tick(now);
        ensure_eq!(h.nic.interrupt_sets(0), 2);
        let info = h.controller.get_coalesce(0)?;
        ensure_eq!(
            info.programmed,
            Some(Moderation {
                timer_us: 18,
                pending_limit: 16
            })
        );
        Ok(())
    }

    #[test]
    fn small_packets_use_lowest_latency() -> Result<()> {
        let h: Harness = harness(1);
        let start: Instant = Instant::now();
        h.controller.tick(start);
        h.counters.add(0, 1_000, 64_000);
        h.controller.tick(start + Duration::from_secs(1));
        let cfg: InterruptCfg = h.nic.interrupt_cfg(0).ok_or(anyhow::anyhow!("not programmed"))?;
        ensure_eq!(cfg.coalesce_timer, 1);
        ensure_eq!(cfg.pending_limit, 0);
        Ok(())
    }

    /// Once pinned, ticks never touch the device again.
    #[test]
    fn static_override_is_idempotent() -> Result<()> {
        let h: Harness = harness(2);
        let request: CoalesceRequest = CoalesceRequest {
            timer_us: Some(90),
            pending_limit: Some(32),
            ..Default::default()
        };
        h.controller.set_coalesce(CoalesceTarget::Queue(0), &request)?;
        ensure_eq!(h.controller.mode(0)?, CoalesceMode::Static);
        ensure_eq!(h.controller.mode(1)?, CoalesceMode::Adaptive);
        ensure_eq!(h.nic.interrupt_sets(0), 1);

        let mut now: Instant = Instant::now();
        for i in 0..1000u64 {
            h.counters.add(0, 10_000 * (i % 97), 1500 * 10_000 * (i % 97));
            now += Duration::from_millis(100);
            h.controller.tick(now);
        }
        ensure_eq!(h.nic.interrupt_sets(0), 1);
        // Queue 1 stays adaptive and keeps its own get-modify-set going.
        anyhow::ensure!(h.nic.interrupt_sets(1) > 0);
        let cfg: InterruptCfg = h.nic.interrupt_cfg(0).ok_or(anyhow::anyhow!("not programmed"))?;
        ensure_eq!(cfg.coalesce_timer, 10);
        ensure_eq!(cfg.pending_limit, 4);
        Ok(())
    }

    #[test]
    fn invalid_request_changes_nothing() -> Result<()> {
        let h: Harness = harness(4);
        let request: CoalesceRequest = CoalesceRequest {
            adaptive: Some(false),
            low: Some(CoalescePoint {
                rate: 700_000,
                timer_us: 18,
                pending_limit: 16,
            }),
            ..Default::default()
        };
        let e = h.controller.set_coalesce(CoalesceTarget::All, &request).err();
        ensure_eq!(e.map(|e| e.errno), Some(libc::EINVAL));
        for qid in 0..4 {
            ensure_eq!(h.controller.mode(qid)?, CoalesceMode::Adaptive);
        }
        ensure_eq!(h.nic.mgmt_calls(MgmtCmd::SetInterruptCfg), 0);

        let e = h.controller.set_coalesce(CoalesceTarget::Queue(4), &CoalesceRequest::default()).err();
        ensure_eq!(e.map(|e| e.errno), Some(libc::EINVAL));
        Ok(())
    }

    #[test]
    fn returning_to_adaptive_resumes_ticks() -> Result<()> {
        let h: Harness = harness(1);
        let pin: CoalesceRequest = CoalesceRequest {
            adaptive: Some(false),
            ..Default::default()
        };
        h.controller.set_coalesce(CoalesceTarget::All, &pin)?;
        let resume: CoalesceRequest = CoalesceRequest {
            adaptive: Some(true),
            ..Default::default()
        };
        h.controller.set_coalesce(CoalesceTarget::All, &resume)?;
        let sets: usize = h.nic.interrupt_sets(0);

        let start: Instant = Instant::now();
        h.controller.tick(start);
        h.counters.add(0, 1_000_000, 1_000_000 * 1500);
        ensure_eq!(h.controller.tick(start + Duration::from_secs(1)), 1);
        ensure_eq!(h.nic.interrupt_sets(0), sets + 1);
        Ok(())
    }

    #[test]
    fn nothing_is_pushed_while_down() -> Result<()> {
        let h: Harness = harness(1);
        h.intf_up.store(false, Ordering::Release);
        h.controller.apply_initial()?;
        let start: Instant = Instant::now();
        h.controller.tick(start);
        h.counters.add(0, 1_000_000, 1_000_000 * 1500);
        ensure_eq!(h.controller.tick(start + Duration::from_secs(1)), 0);
        ensure_eq!(h.nic.mgmt_calls(MgmtCmd::SetInterruptCfg), 0);
        ensure_eq!(h.controller.get_coalesce(0)?.programmed, None);
        Ok(())
    }

    #[test]
    fn device_errors_are_retried() -> Result<()> {
        let h: Harness = harness(1);
        h.nic.set_command_failure(MgmtCmd::SetInterruptCfg, true);
        let start: Instant = Instant::now();
        h.controller.tick(start);
        h.counters.add(0, 1_000_000, 1_000_000 * 1500);
        ensure_eq!(h.controller.tick(start + Duration::from_secs(1)), 0);

        h.nic.set_command_failure(MgmtCmd::SetInterruptCfg, false);
        h.counters.add(0, 1_000_000, 1_000_000 * 1500);
        ensure_eq!(h.controller.tick(start + Duration::from_secs(2)), 1);
        Ok(())
    }

    #[test]
    fn ticker_runs_until_stopped() -> Result<()> {
        let h: Harness = harness(1);
        let controller: Arc<CoalesceController> = Arc::new(h.controller);
        let ticker: CoalesceTicker = CoalesceTicker::spawn(controller.clone(), Duration::from_millis(5))?;
        for _ in 0..200 {
            h.counters.add(0, 10_000, 10_000 * 1500);
            if h.nic.interrupt_sets(0) > 0 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        ticker.stop();
        anyhow::ensure!(h.nic.interrupt_sets(0) > 0, "ticker never programmed the queue");
        ensure_eq!(Arc::strong_count(&controller), 1);
        Ok(())
    }
}
