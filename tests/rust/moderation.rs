// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::common::{
    frame,
    single_queue,
    Test,
};
use ::anyhow::Result;
use ::nicq::{
    coalesce::{
        moderation::{
            self,
            Moderation,
            RateSample,
        },
        CoalesceInfo,
    },
    config::CoalesceConfig,
    ensure_eq,
    hw::cmd::MgmtCmd,
    CoalesceMode,
    CoalesceRequest,
    CoalesceTarget,
    DataplaneConfig,
};
use ::rand::{
    rngs::SmallRng,
    Rng,
    SeedableRng,
};
use ::std::time::{
    Duration,
    Instant,
};

//======================================================================================================================
// test_interpolation_is_monotonic()
//======================================================================================================================

/// For any valid curve, a higher rate between the two points never gives a shorter timer.
#[test]
fn test_interpolation_is_monotonic() -> Result<()> {
    let mut rng: SmallRng = SmallRng::seed_from_u64(42);
    for _ in 0..200 {
        let mut config: CoalesceConfig = CoalesceConfig::default();
        config.low_rate = rng.gen_range(1_000..500_000);
        config.high_rate = config.low_rate + rng.gen_range(2..2_000_000);
        config.low_timer_us = rng.gen_range(0..1_000);
        config.high_timer_us = config.low_timer_us + rng.gen_range(0..1_000);
        config.low_pending_limit = rng.gen_range(0..512);
        config.high_pending_limit = config.low_pending_limit + rng.gen_range(0..512);
        config.interpolate_pending_limit = rng.gen_bool(0.5);

        for _ in 0..100 {
            let r1: u64 = rng.gen_range(config.low_rate + 1..config.high_rate);
            let r2: u64 = rng.gen_range(r1..config.high_rate);
            let m1: Moderation = moderation::interpolate(&config, r1);
            let m2: Moderation = moderation::interpolate(&config, r2);
            anyhow::ensure!(
                m2.timer_us >= m1.timer_us,
                "timer went down: r1={} r2={} {:?} {:?} {:?}",
                r1,
                r2,
                m1,
                m2,
                config
            );
            anyhow::ensure!(m1.timer_us >= config.low_timer_us && m2.timer_us <= config.high_timer_us);
        }
    }
    Ok(())
}

//======================================================================================================================
// test_lowest_latency_override()
//======================================================================================================================

#[test]
fn test_lowest_latency_override() -> Result<()> {
    let config: CoalesceConfig = CoalesceConfig::default();
    let quiet: RateSample = RateSample {
        rx_rate: 10,
        tx_rate: 0,
        avg_pkt_size: 64,
    };
    ensure_eq!(moderation::adaptive(&config, &quiet).timer_us, config.lowest_timer_us);

    let bulky: RateSample = RateSample {
        avg_pkt_size: 1500,
        ..quiet
    };
    ensure_eq!(moderation::adaptive(&config, &bulky).timer_us, config.low_timer_us);
    Ok(())
}

//======================================================================================================================
// test_adaptive_queue_follows_traffic()
//======================================================================================================================

/// Received traffic drives the programmed moderation of an adaptive queue.
#[test]
fn test_adaptive_queue_follows_traffic() -> Result<()> {
    let mut config: DataplaneConfig = single_queue(256);
    config.coalesce.adaptive = true;
    let test: Test = Test::open(&config)?;
    let start: Instant = Instant::now();

    test.set.tick_coalesce(start);
    for i in 0..100u8 {
        test.nic.receive(0, &frame(1500, i))?;
        test.set.poll(0, 64);
    }
    // 100 frames in 100us is a million packets per second.
    ensure_eq!(test.set.tick_coalesce(start + Duration::from_micros(100)), 1);
    let info: CoalesceInfo = test.set.get_coalesce(0)?;
    ensure_eq!(info.mode, CoalesceMode::Adaptive);
    ensure_eq!(
        info.programmed.map(|m| m.timer_us),
        Some(config.coalesce.high_timer_us / 9 * 9)
    );

    // An idle period falls back to the lowest latency setting.
    ensure_eq!(test.set.tick_coalesce(start + Duration::from_secs(1)), 1);
    ensure_eq!(
        test.set.get_coalesce(0)?.programmed.map(|m| m.timer_us),
        Some(config.coalesce.lowest_timer_us)
    );
    Ok(())
}

//======================================================================================================================
// test_static_override_is_idempotent()
//======================================================================================================================

/// Once a user pins a queue, a thousand ticks under changing traffic never reprogram it.
#[test]
fn test_static_override_is_idempotent() -> Result<()> {
    let mut config: DataplaneConfig = single_queue(256);
    config.num_queues = 2;
    config.coalesce.adaptive = true;
    let test: Test = Test::open(&config)?;

    let request: CoalesceRequest = CoalesceRequest {
        timer_us: Some(54),
        pending_limit: Some(24),
        ..Default::default()
    };
    test.set.set_coalesce(CoalesceTarget::Queue(0), &request)?;
    let sets: usize = test.nic.interrupt_sets(0);
    let gets: usize = test.nic.mgmt_calls(MgmtCmd::GetInterruptCfg);

    let mut rng: SmallRng = SmallRng::seed_from_u64(7);
    let mut now: Instant = Instant::now();
    for tick in 0..1000 {
        for _ in 0..rng.gen_range(0..4) {
            test.nic.receive(0, &frame(rng.gen_range(60..1500), tick as u8))?;
            test.nic.receive(1, &frame(rng.gen_range(60..1500), tick as u8))?;
        }
        test.set.poll(0, 64);
        test.set.poll(1, 64);
        now += Duration::from_micros(rng.gen_range(1..2_000));
        test.set.tick_coalesce(now);
    }

    ensure_eq!(test.nic.interrupt_sets(0), sets);
    let info: CoalesceInfo = test.set.get_coalesce(0)?;
    ensure_eq!(info.mode, CoalesceMode::Static);
    ensure_eq!(
        info.programmed,
        Some(Moderation {
            timer_us: 54,
            pending_limit: 24
        })
    );
    // Only the adaptive queue was queried.
    anyhow::ensure!(test.nic.mgmt_calls(MgmtCmd::GetInterruptCfg) > gets);
    anyhow::ensure!(test.nic.interrupt_sets(1) > 1);
    Ok(())
}

//======================================================================================================================
// test_invalid_parameters_are_rejected()
//======================================================================================================================

#[test]
fn test_invalid_parameters_are_rejected() -> Result<()> {
    let test: Test = Test::open(&single_queue(64))?;
    let before: CoalesceInfo = test.set.get_coalesce(0)?;

    // The timer does not fit the 8-bit hardware field.
    let request: CoalesceRequest = CoalesceRequest {
        timer_us: Some(9 * 256),
        ..Default::default()
    };
    let e = test.set.set_coalesce(CoalesceTarget::All, &request).err();
    ensure_eq!(e.map(|e| e.errno), Some(libc::EINVAL));
    ensure_eq!(test.set.get_coalesce(0)?, before);
    Ok(())
}
