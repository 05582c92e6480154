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
    ensure_eq,
    hw::cmd::MgmtCmd,
    qp::QueueStats,
    tx::packet::{
        Fragment,
        TxPacket,
    },
    DataplaneConfig,
    RxPacket,
    TxStatus,
};
use ::rand::{
    rngs::SmallRng,
    Rng,
    SeedableRng,
};
use ::std::time::Duration;

//======================================================================================================================
// test_full_ring_reports_busy_until_reclaimed()
//======================================================================================================================

/// Fills a 1024-entry send queue without reclaiming, then completes 500 packets and reclaims them.
#[test]
fn test_full_ring_reports_busy_until_reclaimed() -> Result<()> {
    let mut config: DataplaneConfig = single_queue(1024);
    config.mtu = 1500;
    let test: Test = Test::open(&config)?;

    let mut sent: usize = 0;
    let mut first_busy: Option<usize> = None;
    for i in 0..2000 {
        match test.set.xmit(0, TxPacket::from_bytes(&frame(64, i as u8), 0)?) {
            TxStatus::Sent => sent += 1,
            TxStatus::Busy(_) => {
                first_busy.get_or_insert(i);
            },
            TxStatus::Dropped(reason) => anyhow::bail!("packet {} dropped: {:?}", i, reason),
        }
    }
    ensure_eq!(sent, 1023);
    ensure_eq!(first_busy, Some(1023));
    ensure_eq!(test.set.queue_stats(0)?.tx.busy, 2000 - 1023);

    ensure_eq!(test.nic.complete_tx(0, 500), 500);
    ensure_eq!(test.set.poll(0, 1024), 0);
    let stats: QueueStats = test.set.queue_stats(0)?;
    ensure_eq!(stats.tx.packets, 500);
    ensure_eq!(stats.tx.bytes, 500 * 64);
    ensure_eq!(stats.tx.wake, 1);

    match test.set.xmit(0, TxPacket::from_bytes(&frame(64, 0), 0)?) {
        TxStatus::Sent => Ok(()),
        status => anyhow::bail!("queue still busy after reclaim: {:?}", status),
    }
}

//======================================================================================================================
// test_random_traffic_is_completed_in_order()
//======================================================================================================================

/// Interleaves sends of random shape with partial device completions and reclaim passes.
#[test]
fn test_random_traffic_is_completed_in_order() -> Result<()> {
    let mut rng: SmallRng = SmallRng::seed_from_u64(0x5eed);
    let test: Test = Test::open(&single_queue(128))?;

    let mut expected: Vec<Vec<u8>> = Vec::new();
    let mut wire: Vec<Vec<u8>> = Vec::new();
    for round in 0..400usize {
        let nr_frags: usize = rng.gen_range(0..24);
        let header: Vec<u8> = frame(rng.gen_range(32..128), round as u8);
        let mut packet: TxPacket = TxPacket::new(Fragment::from_bytes(&header, 0)?);
        let mut data: Vec<u8> = header.clone();
        for f in 0..nr_frags {
            let bytes: Vec<u8> = frame(rng.gen_range(1..600), (round + f) as u8);
            data.extend_from_slice(&bytes);
            packet = packet.with_frag(Fragment::from_bytes(&bytes, 0)?);
        }

        match test.set.xmit(0, packet) {
            TxStatus::Sent => expected.push(data),
            TxStatus::Busy(_) => (),
            TxStatus::Dropped(reason) => anyhow::bail!("round {} dropped: {:?}", round, reason),
        }
        if rng.gen_bool(0.3) {
            test.nic.complete_tx(0, rng.gen_range(1..16));
            test.set.poll(0, rng.gen_range(1..64));
        }
    }
    while test.nic.complete_tx(0, 64) > 0 {}
    test.set.poll(0, usize::MAX);
    wire.extend(test.nic.take_sent(0).into_iter().map(|f| f.data));

    ensure_eq!(wire.len(), expected.len());
    for (i, (got, want)) in wire.iter().zip(expected.iter()).enumerate() {
        anyhow::ensure!(got == want, "frame {} differs", i);
    }
    ensure_eq!(test.set.queue_stats(0)?.tx.packets, expected.len() as u64);
    ensure_eq!(test.iommu.unmap_errors(), 0);
    Ok(())
}

//======================================================================================================================
// test_send_queue_wraps()
//======================================================================================================================

/// Sends one packet at a time through a 64-entry send queue, completing and reclaiming it before the next, well past
/// the end of the ring.
#[test]
fn test_send_queue_wraps() -> Result<()> {
    let test: Test = Test::open(&single_queue(64))?;
    let mut expected: Vec<Vec<u8>> = Vec::new();
    for i in 0..200usize {
        let data: Vec<u8> = frame(64 + i % 32, i as u8);
        match test.set.xmit(0, TxPacket::from_bytes(&data, 0)?) {
            TxStatus::Sent => expected.push(data),
            status => anyhow::bail!("packet {} not sent: {:?}", i, status),
        }
        ensure_eq!(test.nic.complete_tx(0, 8), 1, "packet {}", i);
        ensure_eq!(test.nic.pending_tx(0), 0);
        test.set.poll(0, 64);
    }

    let wire: Vec<Vec<u8>> = test.nic.take_sent(0).into_iter().map(|f| f.data).collect();
    ensure_eq!(wire.len(), expected.len());
    anyhow::ensure!(wire == expected, "frames differ after the ring wrapped");
    ensure_eq!(test.set.queue_stats(0)?.tx.packets, 200);
    ensure_eq!(test.iommu.unmap_errors(), 0);
    Ok(())
}

//======================================================================================================================
// test_receive_single_and_super_completions()
//======================================================================================================================

#[test]
fn test_receive_single_and_super_completions() -> Result<()> {
    let test: Test = Test::open(&single_queue(256))?;
    let frames: Vec<Vec<u8>> = vec![frame(60, 1), frame(1400, 2), frame(3000, 3), frame(200, 4)];

    test.nic.receive(0, &frames[0])?;
    let refs: Vec<&[u8]> = frames[1..].iter().map(|f| f.as_slice()).collect();
    test.nic.inject_rx_super(0, &refs)?;

    ensure_eq!(test.set.poll(0, 64), 4);
    let got: Vec<Vec<u8>> = test.delivered.try_iter().map(|p: RxPacket| p.to_vec()).collect();
    ensure_eq!(got, frames.clone());

    let stats: QueueStats = test.set.stats();
    ensure_eq!(stats.rx.packets, 4);
    ensure_eq!(stats.rx.bytes, frames.iter().map(|f| f.len() as u64).sum::<u64>());
    Ok(())
}

//======================================================================================================================
// test_super_completion_unwinds_on_allocation_failure()
//======================================================================================================================

/// Packet allocation fails on the third of four packets merged into one completion.
#[test]
fn test_super_completion_unwinds_on_allocation_failure() -> Result<()> {
    let test: Test = Test::open(&single_queue(256))?;
    let frames: Vec<Vec<u8>> = vec![frame(100, 1), frame(3000, 2), frame(100, 3), frame(5000, 4)];
    let refs: Vec<&[u8]> = frames.iter().map(|f| f.as_slice()).collect();
    test.nic.inject_rx_super(0, &refs)?;

    test.packets.fail_allocs(2, 1);
    ensure_eq!(test.set.poll(0, 64), 2);
    let stats: QueueStats = test.set.queue_stats(0)?;
    ensure_eq!(stats.rx.packets, 2);
    ensure_eq!(stats.rx.dropped, 2);
    ensure_eq!(stats.rx.alloc_packet_errors, 1);

    // The ring moved past all seven buffers, so the next frame lands behind them.
    test.nic.receive(0, &frames[0])?;
    ensure_eq!(test.set.poll(0, 64), 1);
    ensure_eq!(test.delivered.try_iter().count(), 3);
    Ok(())
}

//======================================================================================================================
// test_teardown()
//======================================================================================================================

/// A device that never completes is force dropped on flush, and teardown still frees everything.
#[test]
fn test_teardown() -> Result<()> {
    let mut config: DataplaneConfig = single_queue(64);
    config.num_queues = 2;
    config.stop_timeout = Duration::from_millis(10);
    let test: Test = Test::open(&config)?;

    for i in 0..10u8 {
        for qid in 0..2 {
            match test.set.xmit(qid, TxPacket::from_bytes(&frame(80, i), 0)?) {
                TxStatus::Sent => (),
                status => anyhow::bail!("packet {} on queue {} not sent: {:?}", i, qid, status),
            }
        }
    }
    test.set.flush_queue(0)?;
    ensure_eq!(test.nic.force_drops(0), 1);
    ensure_eq!(test.nic.discarded(0), 10);

    test.nic.set_auto_drain(true);
    test.nic.complete_tx(1, 10);
    test.set.close()?;
    ensure_eq!(test.nic.force_drops(1), 0);
    ensure_eq!(test.nic.mgmt_calls(MgmtCmd::ClearQueueCtxt), 2);

    let iommu = test.iommu.clone();
    drop(test);
    ensure_eq!(iommu.live_mappings(), 0);
    ensure_eq!(iommu.unmap_errors(), 0);
    Ok(())
}
