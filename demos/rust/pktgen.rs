// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::{
    bail,
    Result,
};
use ::clap::{
    Arg,
    ArgMatches,
    Command,
};
use ::crossbeam_channel::{
    Receiver,
    Sender,
};
use ::nicq::{
    coalesce::CoalesceInfo,
    hw::sim::{
        SimAllocator,
        SimIommu,
        SimNic,
        SimPacketAllocator,
    },
    qp::QueueStats,
    DataplaneConfig,
    DataplaneContext,
    DeviceId,
    DeviceResources,
    QueueSet,
    RxPacket,
    TxPacket,
    TxStatus,
};
use ::std::{
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Program Arguments
//======================================================================================================================

/// Program Arguments
#[derive(Debug)]
pub struct ProgramArguments {
    /// Configuration file.
    config: Option<String>,
    /// Packets sent and received per queue and round.
    burst: usize,
    /// Frame size (in bytes).
    size: usize,
    /// Number of rounds.
    rounds: usize,
    /// Poll budget.
    budget: usize,
}

impl ProgramArguments {
    /// Default burst.
    const DEFAULT_BURST: usize = 32;
    /// Default frame size.
    const DEFAULT_SIZE: usize = 1024;
    /// Default number of rounds.
    const DEFAULT_ROUNDS: usize = 100;
    /// Default poll budget.
    const DEFAULT_BUDGET: usize = 64;

    /// Parses the program arguments from the command line interface.
    pub fn new(app_name: &'static str, app_author: &'static str, app_about: &'static str) -> Result<Self> {
        let matches: ArgMatches = Command::new(app_name)
            .author(app_author)
            .about(app_about)
            .arg(
                Arg::new("config")
                    .long("config")
                    .value_parser(clap::value_parser!(String))
                    .required(false)
                    .value_name("FILE")
                    .help("Sets the YAML configuration file"),
            )
            .arg(
                Arg::new("burst")
                    .long("burst")
                    .value_parser(clap::value_parser!(usize))
                    .required(false)
                    .value_name("PACKETS")
                    .help("Sets packets per queue and round"),
            )
            .arg(
                Arg::new("size")
                    .long("size")
                    .value_parser(clap::value_parser!(usize))
                    .required(false)
                    .value_name("BYTES")
                    .help("Sets frame size"),
            )
            .arg(
                Arg::new("rounds")
                    .long("rounds")
                    .value_parser(clap::value_parser!(usize))
                    .required(false)
                    .value_name("NUMBER")
                    .help("Sets number of rounds"),
            )
            .arg(
                Arg::new("budget")
                    .long("budget")
                    .value_parser(clap::value_parser!(usize))
                    .required(false)
                    .value_name("PACKETS")
                    .help("Sets poll budget"),
            )
            .get_matches();

        let mut args: ProgramArguments = Self {
            config: matches.get_one::<String>("config").cloned(),
            burst: Self::DEFAULT_BURST,
            size: Self::DEFAULT_SIZE,
            rounds: Self::DEFAULT_ROUNDS,
            budget: Self::DEFAULT_BUDGET,
        };

        if let Some(burst) = matches.get_one::<usize>("burst") {
            if *burst == 0 {
                bail!("invalid burst");
            }
            args.burst = *burst;
        }
        if let Some(size) = matches.get_one::<usize>("size") {
            if *size == 0 || *size > u16::MAX as usize {
                bail!("invalid frame size");
            }
            args.size = *size;
        }
        if let Some(rounds) = matches.get_one::<usize>("rounds") {
            args.rounds = *rounds;
        }
        if let Some(budget) = matches.get_one::<usize>("budget") {
            if *budget == 0 {
                bail!("invalid budget");
            }
            args.budget = *budget;
        }

        Ok(args)
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Runs one round of traffic on every queue. Returns the packets sent and received.
fn round(set: &QueueSet, nic: &SimNic, args: &ProgramArguments, frame: &[u8]) -> Result<(usize, usize)> {
    let mut sent: usize = 0;
    let mut received: usize = 0;
    for qid in 0..set.num_queues() {
        for _ in 0..args.burst {
            match set.xmit(qid, TxPacket::from_bytes(frame, 0)?) {
                TxStatus::Sent => sent += 1,
                TxStatus::Busy(_) => break,
                TxStatus::Dropped(reason) => bail!("packet dropped on queue {}: {:?}", qid, reason),
            }
        }
        nic.complete_tx(qid, args.burst);

        for i in 0..args.burst {
            // The receive ring is out of buffers until the next poll refills it.
            if nic.receive(qid, frame).is_err() {
                received += set.poll(qid, args.budget);
                continue;
            }
            if (i + 1) % args.budget == 0 {
                received += set.poll(qid, args.budget);
            }
        }
        received += set.poll(qid, args.budget);
    }
    Ok((sent, received))
}

fn print_stats(stats: &QueueStats, elapsed: Duration) {
    let secs: f64 = elapsed.as_secs_f64().max(f64::EPSILON);
    println!(
        "tx: {} pkts {} bytes busy={} wake={} dropped={} | rx: {} pkts {} bytes dropped={} | {:.0} pps",
        stats.tx.packets,
        stats.tx.bytes,
        stats.tx.busy,
        stats.tx.wake,
        stats.tx.dropped,
        stats.rx.packets,
        stats.rx.bytes,
        stats.rx.dropped,
        (stats.tx.packets + stats.rx.packets) as f64 / secs
    );
}

//======================================================================================================================
// main()
//======================================================================================================================

fn main() -> Result<()> {
    let args: ProgramArguments = ProgramArguments::new(
        "pktgen",
        "Microsoft Corporation",
        "Generates traffic on a queue set backed by the software device.",
    )?;
    let config: DataplaneConfig = match &args.config {
        Some(path) => DataplaneConfig::from_file(path)?,
        None => DataplaneConfig::default(),
    };

    let mut ctx: DataplaneContext = DataplaneContext::init();
    let iommu: Arc<SimIommu> = Arc::new(SimIommu::new());
    let nic: Arc<SimNic> = Arc::new(SimNic::new(iommu.clone()));
    let (stack, delivered): (Sender<RxPacket>, Receiver<RxPacket>) = ::crossbeam_channel::unbounded();
    let resources: DeviceResources = DeviceResources {
        hw: nic.clone(),
        mapper: iommu,
        allocator: Arc::new(SimAllocator::new()),
        packets: Arc::new(SimPacketAllocator::new()),
        stack: Arc::new(stack),
    };
    let id: DeviceId = ctx.register("sim0", config, resources)?;
    let set: Arc<QueueSet> = match ctx.get_mut(id) {
        Some(dev) => dev.up()?,
        None => bail!("device vanished"),
    };

    let frame: Vec<u8> = (0..args.size).map(|i| i as u8).collect();
    let start: Instant = Instant::now();
    let mut last_report: Instant = start;
    let mut total_sent: usize = 0;
    let mut total_received: usize = 0;
    for _ in 0..args.rounds {
        let (sent, received): (usize, usize) = round(&set, &nic, &args, &frame)?;
        total_sent += sent;
        total_received += received;
        delivered.try_iter().for_each(drop);

        if last_report.elapsed() >= Duration::from_secs(1) {
            print_stats(&set.stats(), start.elapsed());
            last_report = Instant::now();
        }
    }
    print_stats(&set.stats(), start.elapsed());
    println!("sent={} received={}", total_sent, total_received);
    for qid in 0..set.num_queues() {
        let info: CoalesceInfo = set.get_coalesce(qid)?;
        println!("queue {}: mode={:?} programmed={:?}", qid, info.mode, info.programmed);
    }

    drop(set);
    if let Err(e) = ctx.teardown() {
        bail!("teardown failed: {:?}", e);
    }
    Ok(())
}
