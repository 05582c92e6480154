// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::config::CoalesceConfig;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Interrupt moderation in microseconds and frames.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Moderation {
    pub timer_us: u32,
    pub pending_limit: u32,
}

/// Interrupt moderation in hardware units, as programmed into the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HwCoalesce {
    pub coalesce_timer: u8,
    pub pending_limit: u8,
    pub resend_timer: u8,
}

/// Traffic measured on one queue over one period.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RateSample {
    /// Received packets per second.
    pub rx_rate: u64,
    /// Sent packets per second.
    pub tx_rate: u64,
    /// Average received packet size in bytes.
    pub avg_pkt_size: u64,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Moderation for the measured traffic.
pub fn adaptive(config: &CoalesceConfig, sample: &RateSample) -> Moderation {
    let tx_busy: bool = config.consider_tx_rate && sample.tx_rate > config.tx_rate_threshold;
    if sample.rx_rate < config.rate_threshold && sample.avg_pkt_size < config.small_packet_size && !tx_busy {
        return Moderation {
            timer_us: config.lowest_timer_us,
            pending_limit: config.lowest_pending_limit,
        };
    }
    interpolate(config, sample.rx_rate)
}

/// Moderation on the curve between the low and the high point.
pub fn interpolate(config: &CoalesceConfig, rate: u64) -> Moderation {
    if rate < config.low_rate {
        return Moderation {
            timer_us: config.low_timer_us,
            pending_limit: config.low_pending_limit,
        };
    }
    if rate > config.high_rate {
        return Moderation {
            timer_us: config.high_timer_us,
            pending_limit: config.high_pending_limit,
        };
    }

    let span: u64 = config.high_rate - config.low_rate;
    let pos: u64 = rate - config.low_rate;
    // The product can exceed 64 bits for wide curves; the quotient never exceeds `high - low`.
    let between = |low: u32, high: u32| -> u32 { low + ((pos as u128 * (high - low) as u128) / span as u128) as u32 };
    Moderation {
        timer_us: between(config.low_timer_us, config.high_timer_us),
        pending_limit: if config.interpolate_pending_limit {
            between(config.low_pending_limit, config.high_pending_limit)
        } else {
            config.low_pending_limit
        },
    }
}

/// Converts to hardware units, rounding down.
pub fn quantize(config: &CoalesceConfig, moderation: Moderation) -> HwCoalesce {
    let to_u8 = |value: u32, unit: u32| -> u8 { (value / unit).min(u8::MAX as u32) as u8 };
    HwCoalesce {
        coalesce_timer: to_u8(moderation.timer_us, config.timer_unit_us),
        pending_limit: to_u8(moderation.pending_limit, config.pending_unit),
        resend_timer: to_u8(config.resend_timer_us, config.timer_unit_us),
    }
}

/// Converts back from hardware units.
pub fn dequantize(config: &CoalesceConfig, hw: HwCoalesce) -> Moderation {
    Moderation {
        timer_us: hw.coalesce_timer as u32 * config.timer_unit_us,
        pending_limit: hw.pending_limit as u32 * config.pending_unit,
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::{
        adaptive,
        dequantize,
        interpolate,
        quantize,
        HwCoalesce,
        Moderation,
        RateSample,
    };
    use crate::{
        config::CoalesceConfig,
        ensure_eq,
    };
    use ::anyhow::Result;
    use ::rand::{
        rngs::SmallRng,
        Rng,
        SeedableRng,
    };

    #[test]
    fn end_points_are_clamped() -> Result<()> {
        let config: CoalesceConfig = CoalesceConfig::default();
        ensure_eq!(
            interpolate(&config, 0),
            Moderation {
                timer_us: config.low_timer_us,
                pending_limit: config.low_pending_limit
            }
        );
        ensure_eq!(
            interpolate(&config, u64::MAX),
            Moderation {
                timer_us: config.high_timer_us,
                pending_limit: config.high_pending_limit
            }
        );
        ensure_eq!(interpolate(&config, config.high_rate).timer_us, config.high_timer_us);
        Ok(())
    }

    /// Within the curve a higher rate never yields a shorter timer.
    #[test]
    fn timer_is_monotonic_between_points() -> Result<()> {
        let mut rng: SmallRng = SmallRng::seed_from_u64(0xc0a1);
        let mut config: CoalesceConfig = CoalesceConfig::default();
        config.interpolate_pending_limit = true;
        for _ in 0..10_000 {
            let r1: u64 = rng.gen_range(config.low_rate + 1..config.high_rate);
            let r2: u64 = rng.gen_range(r1..config.high_rate);
            let m1: Moderation = interpolate(&config, r1);
            let m2: Moderation = interpolate(&config, r2);
            anyhow::ensure!(m2.timer_us >= m1.timer_us, "r1={} r2={} {:?} {:?}", r1, r2, m1, m2);
            anyhow::ensure!(m2.pending_limit >= m1.pending_limit, "r1={} r2={}", r1, r2);
        }
        Ok(())
    }

    #[test]
    fn midpoint_interpolation() -> Result<()> {
        let mut config: CoalesceConfig = CoalesceConfig::default();
        let mid: u64 = (config.low_rate + config.high_rate) / 2;
        let expected_timer: u32 = (config.low_timer_us + config.high_timer_us) / 2;
        ensure_eq!(interpolate(&config, mid).timer_us, expected_timer);
        ensure_eq!(interpolate(&config, mid).pending_limit, config.low_pending_limit);

        config.interpolate_pending_limit = true;
        let expected_limit: u32 = (config.low_pending_limit + config.high_pending_limit) / 2;
        ensure_eq!(interpolate(&config, mid).pending_limit, expected_limit);
        Ok(())
    }

    #[test]
    fn small_slow_traffic_gets_lowest_latency() -> Result<()> {
        let mut config: CoalesceConfig = CoalesceConfig::default();
        let lowest: Moderation = Moderation {
            timer_us: config.lowest_timer_us,
            pending_limit: config.lowest_pending_limit,
        };
        let sample: RateSample = RateSample {
            rx_rate: config.rate_threshold - 1,
            tx_rate: 0,
            avg_pkt_size: config.small_packet_size - 1,
        };
        ensure_eq!(adaptive(&config, &sample), lowest);

        // Large packets stay on the curve.
        let large: RateSample = RateSample {
            avg_pkt_size: config.small_packet_size,
            ..sample
        };
        ensure_eq!(adaptive(&config, &large), interpolate(&config, large.rx_rate));

        // A busy transmit side keeps the curve when it is taken into account.
        let busy: RateSample = RateSample {
            tx_rate: config.tx_rate_threshold + 1,
            ..sample
        };
        ensure_eq!(adaptive(&config, &busy), lowest);
        config.consider_tx_rate = true;
        ensure_eq!(adaptive(&config, &busy), interpolate(&config, busy.rx_rate));
        Ok(())
    }

    #[test]
    fn wide_curve_does_not_overflow() -> Result<()> {
        let mut config: CoalesceConfig = CoalesceConfig::default();
        config.low_rate = 1;
        config.high_rate = u64::MAX;
        config.low_timer_us = 0;
        config.high_timer_us = 1000;
        config.interpolate_pending_limit = true;
        config.low_pending_limit = 0;
        config.high_pending_limit = u32::MAX;

        let middle: Moderation = interpolate(&config, u64::MAX / 2);
        anyhow::ensure!((499..=500).contains(&middle.timer_us), "timer {}", middle.timer_us);
        anyhow::ensure!(middle.pending_limit >= u32::MAX / 2 - 1 && middle.pending_limit <= u32::MAX / 2 + 1);
        ensure_eq!(interpolate(&config, u64::MAX).timer_us, 1000);
        ensure_eq!(interpolate(&config, u64::MAX).pending_limit, u32::MAX);
        Ok(())
    }

    #[test]
    fn quantization_uses_hardware_units() -> Result<()> {
        let config: CoalesceConfig = CoalesceConfig::default();
        let hw: HwCoalesce = quantize(
            &config,
            Moderation {
                timer_us: 230,
                pending_limit: 70,
            },
        );
        ensure_eq!(
            hw,
            HwCoalesce {
                coalesce_timer: 25,
                pending_limit: 8,
                resend_timer: 8
            }
        );
        ensure_eq!(
            dequantize(&config, hw),
            Moderation {
                timer_us: 225,
                pending_limit: 64
            }
        );
        Ok(())
    }
}
