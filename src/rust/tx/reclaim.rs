// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::memory::DmaMapper,
    tx::{
        done_counter,
        packet::TxPacket,
        SqShared,
        TxInfo,
        TxQueue,
    },
};
use ::crossbeam_channel::Receiver;
use ::std::sync::{
    atomic::{
        self,
        Ordering,
    },
    Arc,
    Mutex,
    MutexGuard,
    PoisonError,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Frees send queue entries once the device consumed all of their basic blocks.
pub struct TxReclaimer {
    shared: Arc<SqShared>,
    /// Outstanding packets in ring order.
    completions: Receiver<TxInfo>,
    /// Oldest outstanding packet, if it was already taken off the channel.
    head: Option<TxInfo>,
    mapper: Arc<dyn DmaMapper>,
    /// Transmit lock, only taken to wake a stopped queue.
    queue: Arc<Mutex<TxQueue>>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl TxReclaimer {
    pub(crate) fn new(
        shared: Arc<SqShared>,
        completions: Receiver<TxInfo>,
        mapper: Arc<dyn DmaMapper>,
        queue: Arc<Mutex<TxQueue>>,
    ) -> Self {
        Self {
            shared,
            completions,
            head: None,
            mapper,
            queue,
        }
    }

    pub fn shared(&self) -> &Arc<SqShared> {
        &self.shared
    }

    /// Frees up to `budget` completed packets and returns how many were freed.
    pub fn reclaim(&mut self, budget: usize) -> usize {
        self.reclaim_each(budget, |_| ())
    }

    /// Like [TxReclaimer::reclaim], calling `on_free` on every packet in the order they are freed.
    pub fn reclaim_each<F: FnMut(&TxPacket)>(&mut self, budget: usize, mut on_free: F) -> usize {
        let shared: &SqShared = &self.shared;
        let mask: u16 = shared.wq.mask();
        let hw_ci: u16 = shared.hw_ci();
        let mut sw_ci: u16 = shared.wq.ci();

        let mut pkts: usize = 0;
        let mut freed_wqebbs: u16 = 0;
        let mut wire_pkts: u64 = 0;
        let mut wire_bytes: u64 = 0;

        while pkts < budget {
            if hw_ci == sw_ci {
                break;
            }
            let mut info: TxInfo = match self.head.take().or_else(|| self.completions.try_recv().ok()) {
                Some(info) => info,
                None => break,
            };
            // Never free a packet whose last basic block is still owned by the device.
            if (hw_ci.wrapping_sub(sw_ci) & mask) < info.wqebb_cnt {
                self.head = Some(info);
                break;
            }
            debug_assert_eq!(info.pi, sw_ci, "completions out of ring order");
            debug_assert!(info.mapped.dma.len() <= info.valid_frags + 1);

            info.mapped.unmap(self.mapper.as_ref());
            on_free(&info.packet);
            sw_ci = sw_ci.wrapping_add(info.wqebb_cnt) & mask;
            freed_wqebbs += info.wqebb_cnt;
            wire_pkts += info.wire_pkts;
            wire_bytes += info.wire_bytes;
            pkts += 1;
        }

        if freed_wqebbs > 0 {
            shared.wq.advance_consumer(freed_wqebbs);
            {
                let update = shared.done_stats.update();
                update.add(done_counter::PACKETS, wire_pkts);
                update.add(done_counter::BYTES, wire_bytes);
            }
            // Pairs with the fence the transmit path issues after stopping the queue.
            atomic::fence(Ordering::SeqCst);
            self.maybe_wake();
        }
        pkts
    }

    /// Frees every outstanding packet whether or not the device consumed it. Only valid once the device context of
    /// the queue is gone.
    pub(crate) fn release_all(&mut self) -> usize {
        let mut released: usize = 0;
        let mut wqebbs: u16 = 0;
        while let Some(mut info) = self.head.take().or_else(|| self.completions.try_recv().ok()) {
            info.mapped.unmap(self.mapper.as_ref());
            wqebbs += info.wqebb_cnt;
            released += 1;
        }
        if wqebbs > 0 {
            self.shared.wq.advance_consumer(wqebbs);
            warn!(
                "release_all(): freed packets the device never completed (qid={}, packets={})",
                self.shared.qid, released
            );
        }
        released
    }

    fn maybe_wake(&self) {
        let shared: &SqShared = &self.shared;
        if !shared.is_stopped() || shared.wq.free_wqebbs() == 0 || !shared.intf_up.load(Ordering::Acquire) {
            return;
        }
        let _guard: MutexGuard<TxQueue> = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if shared.is_stopped() && shared.intf_up.load(Ordering::Acquire) {
            shared.stopped.store(false, Ordering::Release);
            shared.done_stats.update().inc(done_counter::WAKE);
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
