// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    limits::{
        CQE_SIZE,
        MAX_SUPER_CQE_PKTS,
        RQ_WQE_SIZE,
    },
    memory::{
        DmaAddr,
        DmaRegion,
    },
};
use ::std::sync::atomic::Ordering;

//======================================================================================================================
// Constants
//======================================================================================================================

const CQE_WORDS: usize = CQE_SIZE / 4;

// Status word.
const STATUS_DONE: u32 = 1 << 31;
const STATUS_BP: u32 = 1 << 30;
const STATUS_LRO_NUM_SHIFT: u32 = 16;
const STATUS_LRO_NUM_MASK: u32 = 0xff;
const STATUS_CSUM_ERR_MASK: u32 = 0x1ff;

/// Checksum error bit meaning that the hardware did not check the packet.
pub const CSUM_ERR_HW_CHECK_NONE: u16 = 1 << 7;
/// Checksum error bit for errors the hardware cannot classify.
pub const CSUM_ERR_OTHER: u16 = 1 << 8;

// Offload type word.
const OFFLOAD_VLAN_EN: u32 = 1 << 21;
const OFFLOAD_IP_TYPE_SHIFT: u32 = 5;
const OFFLOAD_IP_TYPE_MASK: u32 = 0x3;

// Packet info word.
const PKT_INFO_SUPER: u32 = 1 << 31;
const PKT_INFO_NUM_SHIFT: u32 = 24;
const PKT_INFO_NUM_MASK: u32 = 0xf;

// Word indexes.
const W_STATUS: usize = 0;
const W_VLAN_LEN: usize = 1;
const W_OFFLOAD: usize = 2;
const W_HASH: usize = 3;
const W_SUPER_LENS: usize = 3;
const W_PKT_INFO: usize = 7;

//======================================================================================================================
// Structures
//======================================================================================================================

/// L3 protocol reported by the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RxL3 {
    #[default]
    Other,
    Ipv4,
    Ipv6,
}

/// Receive queue entry. The completion address is written once when the queue is created, the buffer address on every
/// refill.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RqWqe {
    pub cqe_addr: DmaAddr,
    pub buf_addr: DmaAddr,
    pub buf_len: u32,
}

/// A completion queue entry copied out of device memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RxCqe {
    words: [u32; CQE_WORDS],
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl RqWqe {
    /// Word holding the high half of the buffer address.
    pub const BUF_ADDR_HI_WORD: usize = 2;
    /// Word holding the low half of the buffer address.
    pub const BUF_ADDR_LO_WORD: usize = 3;

    pub fn encode(&self) -> [u8; RQ_WQE_SIZE] {
        let (cqe_hi, cqe_lo): (u32, u32) = self.cqe_addr.split();
        let (buf_hi, buf_lo): (u32, u32) = self.buf_addr.split();
        let words: [u32; RQ_WQE_SIZE / 4] = [cqe_hi, cqe_lo, buf_hi, buf_lo, self.buf_len, 0, 0, 0];
        let mut out: [u8; RQ_WQE_SIZE] = [0; RQ_WQE_SIZE];
        for (chunk, word) in out.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Fail> {
        if buf.len() != RQ_WQE_SIZE {
            return Err(Fail::new(libc::EBADMSG, "bad receive queue entry length"));
        }
        let word = |i: usize| u32::from_le_bytes([buf[4 * i], buf[4 * i + 1], buf[4 * i + 2], buf[4 * i + 3]]);
        Ok(Self {
            cqe_addr: DmaAddr::join(word(0), word(1)),
            buf_addr: DmaAddr::join(word(2), word(3)),
            buf_len: word(4),
        })
    }
}

impl RxCqe {
    /// Checks the done bit of the entry at `offset`. The acquire load orders every later read of the entry after it.
    pub fn is_done(cq: &DmaRegion, offset: usize) -> bool {
        cq.load_u32(offset + W_STATUS * 4, Ordering::Acquire) & STATUS_DONE != 0
    }

    /// Copies the entry at `offset`. Only valid after [RxCqe::is_done] returned true.
    pub fn read(cq: &DmaRegion, offset: usize) -> Self {
        let mut words: [u32; CQE_WORDS] = [0; CQE_WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            *word = cq.read_u32(offset + i * 4);
        }
        Self { words }
    }

    /// Hands the entry at `offset` back to the device.
    pub fn clear(cq: &DmaRegion, offset: usize) {
        cq.store_u32(offset + W_STATUS * 4, 0, Ordering::Release);
    }

    /// Publishes this entry at `offset`. The status word goes last so that the done bit covers all other words.
    pub fn publish(&self, cq: &DmaRegion, offset: usize) {
        for (i, word) in self.words.iter().enumerate().skip(1) {
            cq.write_u32(offset + i * 4, *word);
        }
        cq.store_u32(offset + W_STATUS * 4, self.words[W_STATUS] | STATUS_DONE, Ordering::Release);
    }

    /// Builds a completion for a single packet of `len` bytes.
    pub fn packet(len: u16) -> Self {
        let mut cqe: Self = Self::default();
        cqe.words[W_VLAN_LEN] = (len as u32) << 16;
        cqe
    }

    /// Builds a completion for up to eight packets with the given lengths.
    pub fn super_packet(lens: &[u16]) -> Self {
        debug_assert!(!lens.is_empty() && lens.len() <= MAX_SUPER_CQE_PKTS);
        let mut cqe: Self = Self::default();
        for (i, len) in lens.iter().enumerate() {
            let shift: u32 = if i % 2 == 0 { 0 } else { 16 };
            cqe.words[W_SUPER_LENS + i / 2] |= (*len as u32) << shift;
        }
        cqe.words[W_PKT_INFO] = PKT_INFO_SUPER | ((lens.len() as u32 & PKT_INFO_NUM_MASK) << PKT_INFO_NUM_SHIFT);
        cqe
    }

    pub fn with_vlan(mut self, tag: u16) -> Self {
        self.words[W_VLAN_LEN] = (self.words[W_VLAN_LEN] & 0xffff_0000) | tag as u32;
        self.words[W_OFFLOAD] |= OFFLOAD_VLAN_EN;
        self
    }

    pub fn with_l3(mut self, l3: RxL3) -> Self {
        let ip_type: u32 = match l3 {
            RxL3::Other => 0,
            RxL3::Ipv4 => 1,
            RxL3::Ipv6 => 2,
        };
        self.words[W_OFFLOAD] &= !(OFFLOAD_IP_TYPE_MASK << OFFLOAD_IP_TYPE_SHIFT);
        self.words[W_OFFLOAD] |= ip_type << OFFLOAD_IP_TYPE_SHIFT;
        self
    }

    pub fn with_lro(mut self, num: u8) -> Self {
        self.words[W_STATUS] &= !(STATUS_LRO_NUM_MASK << STATUS_LRO_NUM_SHIFT);
        self.words[W_STATUS] |= (num as u32) << STATUS_LRO_NUM_SHIFT;
        self
    }

    pub fn with_csum_err(mut self, err: u16) -> Self {
        self.words[W_STATUS] = (self.words[W_STATUS] & !STATUS_CSUM_ERR_MASK) | (err as u32 & STATUS_CSUM_ERR_MASK);
        self
    }

    pub fn with_bp(mut self) -> Self {
        self.words[W_STATUS] |= STATUS_BP;
        self
    }

    pub fn with_hash(mut self, hash: u32) -> Self {
        debug_assert!(!self.is_super());
        self.words[W_HASH] = hash;
        self
    }

    pub fn bp(&self) -> bool {
        self.words[W_STATUS] & STATUS_BP != 0
    }

    pub fn lro_num(&self) -> u8 {
        ((self.words[W_STATUS] >> STATUS_LRO_NUM_SHIFT) & STATUS_LRO_NUM_MASK) as u8
    }

    pub fn csum_err(&self) -> u16 {
        (self.words[W_STATUS] & STATUS_CSUM_ERR_MASK) as u16
    }

    pub fn pkt_len(&self) -> usize {
        (self.words[W_VLAN_LEN] >> 16) as usize
    }

    /// VLAN tag stripped by the device, if any.
    pub fn vlan(&self) -> Option<u16> {
        if self.words[W_OFFLOAD] & OFFLOAD_VLAN_EN != 0 {
            Some(self.words[W_VLAN_LEN] as u16)
        } else {
            None
        }
    }

    pub fn l3(&self) -> RxL3 {
        match (self.words[W_OFFLOAD] >> OFFLOAD_IP_TYPE_SHIFT) & OFFLOAD_IP_TYPE_MASK {
            1 => RxL3::Ipv4,
            2 => RxL3::Ipv6,
            _ => RxL3::Other,
        }
    }

    /// RSS hash. Super completions reuse the word for packet lengths.
    pub fn rss_hash(&self) -> u32 {
        if self.is_super() {
            0
        } else {
            self.words[W_HASH]
        }
    }

    pub fn is_super(&self) -> bool {
        self.words[W_PKT_INFO] & PKT_INFO_SUPER != 0
    }

    /// Number of packets described by a super completion.
    pub fn super_pkt_num(&self) -> usize {
        (((self.words[W_PKT_INFO] >> PKT_INFO_NUM_SHIFT) & PKT_INFO_NUM_MASK) as usize).min(MAX_SUPER_CQE_PKTS)
    }

    /// Length of packet `i` of a super completion.
    pub fn super_pkt_len(&self, i: usize) -> usize {
        let word: u32 = self.words[W_SUPER_LENS + i / 2];
        (if i % 2 == 0 { word & 0xffff } else { word >> 16 }) as usize
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
