// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    limits::{
        MAX_MTU,
        MAX_QUEUES,
        MAX_QUEUE_DEPTH,
        MAX_SQ_SGE,
        MIN_MTU,
        MIN_QUEUE_DEPTH,
    },
};
use ::std::{
    fs::File,
    io::Read,
    ops::Index,
    str::FromStr,
    time::Duration,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Constants
//======================================================================================================================

// Queue set options. Keys of this section may be overridden through environment variables.
mod dataplane_config {
    pub const SECTION_NAME: &str = "dataplane";
    pub const NUM_QUEUES: &str = "num_queues";
    pub const SQ_DEPTH: &str = "sq_depth";
    pub const RQ_DEPTH: &str = "rq_depth";
    pub const MTU: &str = "mtu";
    pub const NUMA_NODE: &str = "numa_node";
    pub const STOP_TIMEOUT_MS: &str = "stop_timeout_ms";
    pub const COS_MAP: &str = "cos_map";
}

// Receive path options.
mod rx_config {
    pub const SECTION_NAME: &str = "rx";
    pub const BUF_LEN: &str = "buf_len";
    pub const COPY_BREAK: &str = "copy_break";
    pub const REFILL_THRESHOLD: &str = "refill_threshold";
    pub const LRO_REPLENISH_THRESHOLD: &str = "lro_replenish_threshold";
    pub const LRO_IPV4_HDR_LEN: &str = "lro_ipv4_hdr_len";
    pub const LRO_IPV6_HDR_LEN: &str = "lro_ipv6_hdr_len";
    pub const CSUM_OFFLOAD: &str = "csum_offload";
}

// Transmit path options.
mod tx_config {
    pub const SECTION_NAME: &str = "tx";
    pub const MAX_SGE: &str = "max_sge";
}

// Receive back-pressure options.
mod backpressure_config {
    pub const SECTION_NAME: &str = "backpressure";
    pub const ENABLED: &str = "enabled";
    pub const UPPER_THD: &str = "upper_thd";
    pub const LOWER_THD: &str = "lower_thd";
    pub const COUNT_THD: &str = "count_thd";
}

// Interrupt moderation options.
mod coalesce_config {
    pub const SECTION_NAME: &str = "coalesce";
    pub const ADAPTIVE: &str = "adaptive";
    pub const PERIOD_MS: &str = "period_ms";
    pub const TIMER_US: &str = "timer_us";
    pub const PENDING_LIMIT: &str = "pending_limit";
    pub const LOW_RATE: &str = "low_rate";
    pub const LOW_TIMER_US: &str = "low_timer_us";
    pub const LOW_PENDING_LIMIT: &str = "low_pending_limit";
    pub const HIGH_RATE: &str = "high_rate";
    pub const HIGH_TIMER_US: &str = "high_timer_us";
    pub const HIGH_PENDING_LIMIT: &str = "high_pending_limit";
    pub const RATE_THRESHOLD: &str = "rate_threshold";
    pub const SMALL_PACKET_SIZE: &str = "small_packet_size";
    pub const LOWEST_TIMER_US: &str = "lowest_timer_us";
    pub const LOWEST_PENDING_LIMIT: &str = "lowest_pending_limit";
    pub const TIMER_UNIT_US: &str = "timer_unit_us";
    pub const PENDING_UNIT: &str = "pending_unit";
    pub const RESEND_TIMER_US: &str = "resend_timer_us";
    pub const INTERPOLATE_PENDING_LIMIT: &str = "interpolate_pending_limit";
    pub const CONSIDER_TX_RATE: &str = "consider_tx_rate";
    pub const TX_RATE_THRESHOLD: &str = "tx_rate_threshold";
}

/// Smallest receive buffer.
const MIN_RX_BUF_LEN: usize = 256;

/// Largest receive buffer.
const MAX_RX_BUF_LEN: usize = 16384;

/// Largest value of a quantised hardware moderation field.
const MAX_QUANTISED: u32 = u8::MAX as u32;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Configuration of a queue set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataplaneConfig {
    /// Number of queue pairs.
    pub num_queues: u16,
    /// Send queue depth in WQEBBs.
    pub sq_depth: u16,
    /// Receive queue depth in WQEs.
    pub rq_depth: u16,
    /// Interface MTU.
    pub mtu: u16,
    /// NUMA node the queues are allocated on.
    pub numa_node: u16,
    /// Upper bound on the wait for a send queue to drain.
    pub stop_timeout: Duration,
    /// Class of service of each queue. Empty means class 0 everywhere.
    pub cos_map: Vec<u8>,
    pub rx: RxConfig,
    pub tx: TxConfig,
    pub backpressure: BackpressureConfig,
    pub coalesce: CoalesceConfig,
}

/// Receive path configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RxConfig {
    /// Bytes of a receive buffer. A page holds two buffers.
    pub buf_len: usize,
    /// Packets up to this size are copied out of the ring buffer.
    pub copy_break: usize,
    /// Refill once more than this many ring slots are unfilled.
    pub refill_threshold: u16,
    /// Stop a poll round once LRO packets consumed this many WQEs.
    pub lro_replenish_threshold: u32,
    /// Header bytes accounted per merged IPv4 segment.
    pub lro_ipv4_hdr_len: u32,
    /// Header bytes accounted per merged IPv6 segment.
    pub lro_ipv6_hdr_len: u32,
    /// Report hardware checksum validation results.
    pub csum_offload: bool,
}

/// Transmit path configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxConfig {
    /// Scatter-gather entries per send WQE, header included.
    pub max_sge: usize,
}

/// Receive back-pressure configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackpressureConfig {
    pub enabled: bool,
    /// Posted buffers required before the threshold is lowered.
    pub upper_thd: u16,
    /// Threshold programmed when the condition is cleared.
    pub lower_thd: u16,
    /// Flagged completions required before the threshold is lowered.
    pub count_thd: u32,
}

/// Interrupt moderation configuration. Times are in microseconds and limits in frames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoalesceConfig {
    /// Start queues in adaptive mode.
    pub adaptive: bool,
    /// Sampling period of the adaptive controller.
    pub period: Duration,
    /// Static timer.
    pub timer_us: u32,
    /// Static pending limit.
    pub pending_limit: u32,
    pub low_rate: u64,
    pub low_timer_us: u32,
    pub low_pending_limit: u32,
    pub high_rate: u64,
    pub high_timer_us: u32,
    pub high_pending_limit: u32,
    /// Below this rate (and packet size) the lowest latency setting is used.
    pub rate_threshold: u64,
    pub small_packet_size: u64,
    pub lowest_timer_us: u32,
    pub lowest_pending_limit: u32,
    /// Hardware timer granularity.
    pub timer_unit_us: u32,
    /// Hardware pending limit granularity.
    pub pending_unit: u32,
    /// Resend timer written along with the moderation values.
    pub resend_timer_us: u32,
    /// Interpolate the pending limit as well as the timer.
    pub interpolate_pending_limit: bool,
    /// Let a high transmit rate keep a queue on the adaptive curve.
    pub consider_tx_rate: bool,
    pub tx_rate_threshold: u64,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl DataplaneConfig {
    /// Reads a configuration file.
    pub fn from_file(path: &str) -> Result<Self, Fail> {
        let mut config_s: String = String::new();
        File::open(path)?.read_to_string(&mut config_s)?;
        Self::from_yaml_str(&config_s)
    }

    /// Parses a YAML document. Missing sections and keys take their default values.
    pub fn from_yaml_str(config_s: &str) -> Result<Self, Fail> {
        let docs: Vec<Yaml> = YamlLoader::load_from_str(config_s).map_err(|e| {
            let fail: Fail = Fail::from(e);
            error!("from_yaml_str(): {}", fail.cause);
            fail
        })?;
        let empty: Yaml = Yaml::Null;
        let yaml: &Yaml = match &docs[..] {
            [] => &empty,
            [doc] => doc,
            _ => return Err(Fail::new(libc::EINVAL, "wrong number of config objects")),
        };

        let config: Self = Self {
            num_queues: Self::get_dataplane_option(yaml, dataplane_config::NUM_QUEUES, 4)?,
            sq_depth: Self::get_dataplane_option(yaml, dataplane_config::SQ_DEPTH, 1024)?,
            rq_depth: Self::get_dataplane_option(yaml, dataplane_config::RQ_DEPTH, 1024)?,
            mtu: Self::get_dataplane_option(yaml, dataplane_config::MTU, 1500)?,
            numa_node: Self::get_dataplane_option(yaml, dataplane_config::NUMA_NODE, 0)?,
            stop_timeout: Duration::from_millis(Self::get_dataplane_option(
                yaml,
                dataplane_config::STOP_TIMEOUT_MS,
                1000,
            )?),
            cos_map: Self::get_cos_map(Self::get_subsection(yaml, dataplane_config::SECTION_NAME)?)?,
            rx: RxConfig::from_yaml(Self::get_subsection(yaml, rx_config::SECTION_NAME)?)?,
            tx: TxConfig::from_yaml(Self::get_subsection(yaml, tx_config::SECTION_NAME)?)?,
            backpressure: BackpressureConfig::from_yaml(Self::get_subsection(
                yaml,
                backpressure_config::SECTION_NAME,
            )?)?,
            coalesce: CoalesceConfig::from_yaml(Self::get_subsection(yaml, coalesce_config::SECTION_NAME)?)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks that all values are consistent with each other and with the hardware limits.
    pub fn validate(&self) -> Result<(), Fail> {
        if self.num_queues == 0 || self.num_queues > MAX_QUEUES {
            return Err(invalid(format!(
                "number of queues must be in [1, {}] (num_queues={})",
                MAX_QUEUES, self.num_queues
            )));
        }
        for (name, depth) in [("sq_depth", self.sq_depth), ("rq_depth", self.rq_depth)] {
            if !depth.is_power_of_two() || depth < MIN_QUEUE_DEPTH || depth > MAX_QUEUE_DEPTH {
                return Err(invalid(format!(
                    "{} must be a power of two in [{}, {}] ({}={})",
                    name, MIN_QUEUE_DEPTH, MAX_QUEUE_DEPTH, name, depth
                )));
            }
        }
        if self.mtu < MIN_MTU || self.mtu > MAX_MTU {
            return Err(invalid(format!(
                "mtu must be in [{}, {}] (mtu={})",
                MIN_MTU, MAX_MTU, self.mtu
            )));
        }
        if !self.cos_map.is_empty() && self.cos_map.len() != self.num_queues as usize {
            return Err(invalid(format!(
                "cos_map must have one entry per queue (entries={}, num_queues={})",
                self.cos_map.len(),
                self.num_queues
            )));
        }
        self.rx.validate()?;
        self.tx.validate()?;
        self.backpressure.validate(self.rq_depth)?;
        self.coalesce.validate()?;
        Ok(())
    }

    /// Class of service of queue `qid`.
    pub fn cos(&self, qid: u16) -> u8 {
        self.cos_map.get(qid as usize).copied().unwrap_or(0)
    }

    /// Reads a key of the dataplane section. The environment variable named after the upper-cased key takes precedence.
    fn get_dataplane_option<T: FromStr + TryFrom<i64>>(yaml: &Yaml, index: &str, default: T) -> Result<T, Fail> {
        if let Some(value) = get_typed_env_option(index)? {
            return Ok(value);
        }
        get_int_option(Self::get_subsection(yaml, dataplane_config::SECTION_NAME)?, index, default)
    }

    fn get_cos_map(section: &Yaml) -> Result<Vec<u8>, Fail> {
        match section.index(dataplane_config::COS_MAP) {
            Yaml::BadValue | Yaml::Null => Ok(Vec::new()),
            Yaml::Array(entries) => entries
                .iter()
                .map(|entry| match entry.as_i64().map(u8::try_from) {
                    Some(Ok(cos)) if cos < 8 => Ok(cos),
                    _ => Err(invalid(format!("cos_map entry {:?} is not a class of service", entry))),
                })
                .collect(),
            other => Err(invalid(format!("parameter \"cos_map\" has unexpected type ({:?})", other))),
        }
    }

    /// Looks up a section. A missing section reads as empty.
    fn get_subsection<'a>(yaml: &'a Yaml, index: &str) -> Result<&'a Yaml, Fail> {
        match yaml.index(index) {
            section @ (Yaml::Hash(_) | Yaml::BadValue | Yaml::Null) => Ok(section),
            _ => Err(invalid(format!("parameter \"{}\" has unexpected type", index))),
        }
    }
}

impl RxConfig {
    fn from_yaml(section: &Yaml) -> Result<Self, Fail> {
        let default: Self = Self::default();
        Ok(Self {
            buf_len: get_int_option(section, rx_config::BUF_LEN, default.buf_len)?,
            copy_break: get_int_option(section, rx_config::COPY_BREAK, default.copy_break)?,
            refill_threshold: get_int_option(section, rx_config::REFILL_THRESHOLD, default.refill_threshold)?,
            lro_replenish_threshold: get_int_option(
                section,
                rx_config::LRO_REPLENISH_THRESHOLD,
                default.lro_replenish_threshold,
            )?,
            lro_ipv4_hdr_len: get_int_option(section, rx_config::LRO_IPV4_HDR_LEN, default.lro_ipv4_hdr_len)?,
            lro_ipv6_hdr_len: get_int_option(section, rx_config::LRO_IPV6_HDR_LEN, default.lro_ipv6_hdr_len)?,
            csum_offload: get_bool_option(section, rx_config::CSUM_OFFLOAD, default.csum_offload)?,
        })
    }

    fn validate(&self) -> Result<(), Fail> {
        if !self.buf_len.is_power_of_two() || self.buf_len < MIN_RX_BUF_LEN || self.buf_len > MAX_RX_BUF_LEN {
            return Err(invalid(format!(
                "rx buf_len must be a power of two in [{}, {}] (buf_len={})",
                MIN_RX_BUF_LEN, MAX_RX_BUF_LEN, self.buf_len
            )));
        }
        if self.copy_break > self.buf_len {
            return Err(invalid(format!(
                "rx copy_break must not exceed the buffer length (copy_break={}, buf_len={})",
                self.copy_break, self.buf_len
            )));
        }
        Ok(())
    }
}

impl TxConfig {
    fn from_yaml(section: &Yaml) -> Result<Self, Fail> {
        Ok(Self {
            max_sge: get_int_option(section, tx_config::MAX_SGE, Self::default().max_sge)?,
        })
    }

    fn validate(&self) -> Result<(), Fail> {
        if self.max_sge < 2 || self.max_sge > MAX_SQ_SGE {
            return Err(invalid(format!(
                "tx max_sge must be in [2, {}] (max_sge={})",
                MAX_SQ_SGE, self.max_sge
            )));
        }
        Ok(())
    }
}

impl BackpressureConfig {
    fn from_yaml(section: &Yaml) -> Result<Self, Fail> {
        let default: Self = Self::default();
        Ok(Self {
            enabled: get_bool_option(section, backpressure_config::ENABLED, default.enabled)?,
            upper_thd: get_int_option(section, backpressure_config::UPPER_THD, default.upper_thd)?,
            lower_thd: get_int_option(section, backpressure_config::LOWER_THD, default.lower_thd)?,
            count_thd: get_int_option(section, backpressure_config::COUNT_THD, default.count_thd)?,
        })
    }

    fn validate(&self, rq_depth: u16) -> Result<(), Fail> {
        if self.enabled && (self.lower_thd >= self.upper_thd || self.upper_thd > rq_depth || self.count_thd == 0) {
            return Err(invalid(format!(
                "back-pressure thresholds are inconsistent (lower_thd={}, upper_thd={}, count_thd={}, rq_depth={})",
                self.lower_thd, self.upper_thd, self.count_thd, rq_depth
            )));
        }
        Ok(())
    }
}

impl CoalesceConfig {
    fn from_yaml(section: &Yaml) -> Result<Self, Fail> {
        let d: Self = Self::default();
        Ok(Self {
            adaptive: get_bool_option(section, coalesce_config::ADAPTIVE, d.adaptive)?,
            period: Duration::from_millis(get_int_option(
                section,
                coalesce_config::PERIOD_MS,
                d.period.as_millis() as u64,
            )?),
            timer_us: get_int_option(section, coalesce_config::TIMER_US, d.timer_us)?,
            pending_limit: get_int_option(section, coalesce_config::PENDING_LIMIT, d.pending_limit)?,
            low_rate: get_int_option(section, coalesce_config::LOW_RATE, d.low_rate)?,
            low_timer_us: get_int_option(section, coalesce_config::LOW_TIMER_US, d.low_timer_us)?,
            low_pending_limit: get_int_option(section, coalesce_config::LOW_PENDING_LIMIT, d.low_pending_limit)?,
            high_rate: get_int_option(section, coalesce_config::HIGH_RATE, d.high_rate)?,
            high_timer_us: get_int_option(section, coalesce_config::HIGH_TIMER_US, d.high_timer_us)?,
            high_pending_limit: get_int_option(section, coalesce_config::HIGH_PENDING_LIMIT, d.high_pending_limit)?,
            rate_threshold: get_int_option(section, coalesce_config::RATE_THRESHOLD, d.rate_threshold)?,
            small_packet_size: get_int_option(section, coalesce_config::SMALL_PACKET_SIZE, d.small_packet_size)?,
            lowest_timer_us: get_int_option(section, coalesce_config::LOWEST_TIMER_US, d.lowest_timer_us)?,
            lowest_pending_limit: get_int_option(
                section,
                coalesce_config::LOWEST_PENDING_LIMIT,
                d.lowest_pending_limit,
            )?,
            timer_unit_us: get_int_option(section, coalesce_config::TIMER_UNIT_US, d.timer_unit_us)?,
            pending_unit: get_int_option(section, coalesce_config::PENDING_UNIT, d.pending_unit)?,
            resend_timer_us: get_int_option(section, coalesce_config::RESEND_TIMER_US, d.resend_timer_us)?,
            interpolate_pending_limit: get_bool_option(
                section,
                coalesce_config::INTERPOLATE_PENDING_LIMIT,
                d.interpolate_pending_limit,
            )?,
            consider_tx_rate: get_bool_option(section, coalesce_config::CONSIDER_TX_RATE, d.consider_tx_rate)?,
            tx_rate_threshold: get_int_option(section, coalesce_config::TX_RATE_THRESHOLD, d.tx_rate_threshold)?,
        })
    }

    /// Checks the adaptive curve and that every value fits the hardware fields.
    pub fn validate(&self) -> Result<(), Fail> {
        if self.timer_unit_us == 0 || self.pending_unit == 0 {
            return Err(invalid(format!(
                "coalescing units must be non-zero (timer_unit_us={}, pending_unit={})",
                self.timer_unit_us, self.pending_unit
            )));
        }
        if self.period.is_zero() {
            return Err(invalid("coalescing period must be non-zero".to_string()));
        }
        if self.high_rate <= self.low_rate {
            return Err(invalid(format!(
                "high rate must exceed low rate (low_rate={}, high_rate={})",
                self.low_rate, self.high_rate
            )));
        }
        if self.high_timer_us < self.low_timer_us || self.high_pending_limit < self.low_pending_limit {
            return Err(invalid(format!(
                "high point must not be below low point (timer {}..{}, pending limit {}..{})",
                self.low_timer_us, self.high_timer_us, self.low_pending_limit, self.high_pending_limit
            )));
        }
        for timer in [
            self.timer_us,
            self.low_timer_us,
            self.high_timer_us,
            self.lowest_timer_us,
            self.resend_timer_us,
        ] {
            self.check_quantised("timer", timer, self.timer_unit_us)?;
        }
        for limit in [
            self.pending_limit,
            self.low_pending_limit,
            self.high_pending_limit,
            self.lowest_pending_limit,
        ] {
            self.check_quantised("pending limit", limit, self.pending_unit)?;
        }
        Ok(())
    }

    fn check_quantised(&self, what: &str, value: u32, unit: u32) -> Result<(), Fail> {
        if value / unit > MAX_QUANTISED {
            return Err(invalid(format!(
                "{} {} does not fit the hardware field (unit={})",
                what, value, unit
            )));
        }
        Ok(())
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

fn invalid(cause: String) -> Fail {
    error!("validate(): {}", cause);
    Fail::new(libc::EINVAL, &cause)
}

/// Get value where the environment value overrides the config file if it exists.
fn get_typed_env_option<T: FromStr>(index: &str) -> Result<Option<T>, Fail> {
    if let Ok(var) = ::std::env::var(index.to_uppercase()) {
        if let Ok(value) = var.as_str().parse() {
            return Ok(Some(value));
        } else {
            let message: String = format!("parameter {} has unexpected type", index);
            return Err(Fail::new(libc::EINVAL, message.as_str()));
        }
    }
    Ok(None)
}

/// Reads an integer key, verifying that the destination type may hold the value.
fn get_int_option<T: TryFrom<i64>>(yaml: &Yaml, index: &str, default: T) -> Result<T, Fail> {
    match yaml.index(index) {
        Yaml::BadValue | Yaml::Null => Ok(default),
        Yaml::Integer(val) => match T::try_from(*val) {
            Ok(val) => Ok(val),
            _ => {
                let message: String = format!("parameter \"{}\" is out of range", index);
                Err(Fail::new(libc::ERANGE, message.as_str()))
            },
        },
        _ => {
            let message: String = format!("parameter {} has unexpected type", index);
            Err(Fail::new(libc::EINVAL, message.as_str()))
        },
    }
}

fn get_bool_option(yaml: &Yaml, index: &str, default: bool) -> Result<bool, Fail> {
    match yaml.index(index) {
        Yaml::BadValue | Yaml::Null => Ok(default),
        Yaml::Boolean(val) => Ok(*val),
        _ => {
            let message: String = format!("parameter {} has unexpected type", index);
            Err(Fail::new(libc::EINVAL, message.as_str()))
        },
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for DataplaneConfig {
    fn default() -> Self {
        Self {
            num_queues: 4,
            sq_depth: 1024,
            rq_depth: 1024,
            mtu: 1500,
            numa_node: 0,
            stop_timeout: Duration::from_secs(1),
            cos_map: Vec::new(),
            rx: RxConfig::default(),
            tx: TxConfig::default(),
            backpressure: BackpressureConfig::default(),
            coalesce: CoalesceConfig::default(),
        }
    }
}

impl Default for RxConfig {
    fn default() -> Self {
        Self {
            buf_len: 2048,
            copy_break: 256,
            refill_threshold: 16,
            lro_replenish_threshold: 256,
            lro_ipv4_hdr_len: 66,
            lro_ipv6_hdr_len: 86,
            csum_offload: true,
        }
    }
}

impl Default for TxConfig {
    fn default() -> Self {
        Self { max_sge: MAX_SQ_SGE }
    }
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            upper_thd: 512,
            lower_thd: 128,
            count_thd: 32,
        }
    }
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            adaptive: true,
            period: Duration::from_secs(1),
            timer_us: 36,
            pending_limit: 16,
            low_rate: 200_000,
            low_timer_us: 18,
            low_pending_limit: 16,
            high_rate: 650_000,
            high_timer_us: 225,
            high_pending_limit: 64,
            rate_threshold: 50_000,
            small_packet_size: 256,
            lowest_timer_us: 9,
            lowest_pending_limit: 0,
            timer_unit_us: 9,
            pending_unit: 8,
            resend_timer_us: 72,
            interpolate_pending_limit: false,
            consider_tx_rate: false,
            tx_rate_threshold: 500_000,
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
