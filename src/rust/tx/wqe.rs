// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Send queue entry layout: a 16-byte control section, a 16-byte task section and one 16-byte buffer descriptor per
//! scatter-gather entry, padded to whole basic blocks.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::{
        fail::Fail,
        limits::{
            MAX_SQ_SGE,
            SQ_WQEBB_SIZE,
        },
        memory::DmaAddr,
    },
    tx::{
        offload::{
            L4Offload,
            TxTask,
        },
        packet::{
            L3Proto,
            TunnelKind,
        },
    },
};
use ::arrayvec::ArrayVec;

//======================================================================================================================
// Constants
//======================================================================================================================

const CTRL_LEN: usize = 16;
const TASK_LEN: usize = 16;
const SGE_LEN: usize = 16;

// Control word 0.
const CTRL_SGE_CNT_MASK: u32 = 0xff;
const CTRL_WQEBB_CNT_SHIFT: u32 = 8;

// Task word 1.
const TASK_TSO: u32 = 1 << 12;
const TASK_VLAN_EN: u32 = 1 << 13;

//======================================================================================================================
// Structures
//======================================================================================================================

/// One scatter-gather entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sge {
    pub addr: DmaAddr,
    pub len: u32,
}

/// A decoded send queue entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SqWqe {
    /// Frame length before segmentation.
    pub frame_len: u32,
    pub task: TxTask,
    pub sges: ArrayVec<Sge, MAX_SQ_SGE>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl SqWqe {
    /// Number of basic blocks taken by a WQE with `nr_sges` scatter-gather entries.
    pub fn wqebb_count(nr_sges: usize) -> u16 {
        (CTRL_LEN + TASK_LEN + nr_sges * SGE_LEN).div_ceil(SQ_WQEBB_SIZE) as u16
    }

    /// Number of basic blocks of the WQE whose first basic block is `head`.
    pub fn peek_wqebb_count(head: &[u8]) -> u16 {
        ((word(head, 0) >> CTRL_WQEBB_CNT_SHIFT) & 0xff) as u16
    }

    pub fn encode(&self) -> Vec<u8> {
        let nr_wqebbs: u16 = Self::wqebb_count(self.sges.len());
        let mut out: Vec<u8> = vec![0; nr_wqebbs as usize * SQ_WQEBB_SIZE];

        put(
            &mut out,
            0,
            (self.sges.len() as u32 & CTRL_SGE_CNT_MASK) | ((nr_wqebbs as u32) << CTRL_WQEBB_CNT_SHIFT),
        );
        put(&mut out, 1, self.frame_len);

        let t: &TxTask = &self.task;
        let (outer_type, outer_len): (u32, u32) = t.outer_l3.map_or((0, 0), |(l3, len)| (l3_code(l3), len as u32));
        let (tunnel_type, tunnel_len): (u32, u32) = t.tunnel.map_or((0, 0), |(kind, len)| {
            let code: u32 = match kind {
                TunnelKind::Udp => 1,
                TunnelKind::Gre => 2,
            };
            (code, len as u32)
        });
        let (inner_type, inner_len): (u32, u32) = t.inner_l3.map_or((0, 0), |(l3, len)| (l3_code(l3), len as u32));
        let l4: u32 = match t.l4 {
            L4Offload::None => 0,
            L4Offload::Tcp => 1,
            L4Offload::Udp => 2,
            L4Offload::Sctp => 3,
        };

        let base: usize = CTRL_LEN / 4;
        put(
            &mut out,
            base,
            t.l2_len as u32 | (outer_len << 8) | (outer_type << 16) | (tunnel_type << 18) | (tunnel_len << 20),
        );
        let mut w1: u32 = inner_len | (inner_type << 8) | (l4 << 10);
        if t.mss.is_some() {
            w1 |= TASK_TSO;
        }
        if let Some(tag) = t.vlan {
            w1 |= TASK_VLAN_EN | ((tag as u32) << 16);
        }
        put(&mut out, base + 1, w1);
        put(
            &mut out,
            base + 2,
            t.l4_len as u32 | ((t.l4_offset as u32) << 8) | ((t.mss.unwrap_or(0) as u32 & 0x3fff) << 16),
        );
        put(&mut out, base + 3, t.payload_offset as u32);

        for (i, sge) in self.sges.iter().enumerate() {
            let w: usize = (CTRL_LEN + TASK_LEN + i * SGE_LEN) / 4;
            let (hi, lo): (u32, u32) = sge.addr.split();
            put(&mut out, w, hi);
            put(&mut out, w + 1, lo);
            put(&mut out, w + 2, sge.len);
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Fail> {
        if buf.len() < SQ_WQEBB_SIZE {
            return Err(Fail::new(libc::EBADMSG, "send queue entry is shorter than a basic block"));
        }
        let w0: u32 = word(buf, 0);
        let nr_sges: usize = (w0 & CTRL_SGE_CNT_MASK) as usize;
        let nr_wqebbs: usize = ((w0 >> CTRL_WQEBB_CNT_SHIFT) & 0xff) as usize;
        if nr_sges > MAX_SQ_SGE || nr_wqebbs != Self::wqebb_count(nr_sges) as usize || buf.len() < nr_wqebbs * SQ_WQEBB_SIZE
        {
            return Err(Fail::new(libc::EBADMSG, "malformed send queue entry"));
        }

        let base: usize = CTRL_LEN / 4;
        let t0: u32 = word(buf, base);
        let t1: u32 = word(buf, base + 1);
        let t2: u32 = word(buf, base + 2);
        let t3: u32 = word(buf, base + 3);

        let tunnel: Option<(TunnelKind, u8)> = match (t0 >> 18) & 0x3 {
            1 => Some((TunnelKind::Udp, (t0 >> 20) as u8)),
            2 => Some((TunnelKind::Gre, (t0 >> 20) as u8)),
            _ => None,
        };
        let task: TxTask = TxTask {
            l2_len: t0 as u8,
            outer_l3: l3_decode((t0 >> 16) & 0x3).map(|l3| (l3, (t0 >> 8) as u8)),
            tunnel,
            inner_l3: l3_decode((t1 >> 8) & 0x3).map(|l3| (l3, t1 as u8)),
            l4: match (t1 >> 10) & 0x3 {
                1 => L4Offload::Tcp,
                2 => L4Offload::Udp,
                3 => L4Offload::Sctp,
                _ => L4Offload::None,
            },
            l4_offset: (t2 >> 8) as u8,
            l4_len: t2 as u8,
            mss: if t1 & TASK_TSO != 0 {
                Some(((t2 >> 16) & 0x3fff) as u16)
            } else {
                None
            },
            vlan: if t1 & TASK_VLAN_EN != 0 {
                Some((t1 >> 16) as u16)
            } else {
                None
            },
            payload_offset: t3 as u8,
        };

        let mut sges: ArrayVec<Sge, MAX_SQ_SGE> = ArrayVec::new();
        for i in 0..nr_sges {
            let w: usize = (CTRL_LEN + TASK_LEN + i * SGE_LEN) / 4;
            sges.push(Sge {
                addr: DmaAddr::join(word(buf, w), word(buf, w + 1)),
                len: word(buf, w + 2),
            });
        }

        Ok(Self {
            frame_len: word(buf, 1),
            task,
            sges,
        })
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

fn put(buf: &mut [u8], index: usize, value: u32) {
    buf[index * 4..index * 4 + 4].copy_from_slice(&value.to_le_bytes());
}

fn word(buf: &[u8], index: usize) -> u32 {
    u32::from_le_bytes([buf[index * 4], buf[index * 4 + 1], buf[index * 4 + 2], buf[index * 4 + 3]])
}

fn l3_code(l3: L3Proto) -> u32 {
    match l3 {
        L3Proto::Ipv4 => 1,
        L3Proto::Ipv6 => 2,
    }
}

fn l3_decode(code: u32) -> Option<L3Proto> {
    match code {
        1 => Some(L3Proto::Ipv4),
        2 => Some(L3Proto::Ipv6),
        _ => None,
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::{
        Sge,
        SqWqe,
    };
    use crate::{
        ensure_eq,
        runtime::memory::DmaAddr,
        tx::{
            offload::{
                L4Offload,
                TxTask,
            },
            packet::{
                L3Proto,
                TunnelKind,
            },
        },
    };
    use ::anyhow::Result;
    use ::arrayvec::ArrayVec;

    #[test]
    fn wqebb_count_grows_with_sges() -> Result<()> {
        ensure_eq!(SqWqe::wqebb_count(1), 1);
        ensure_eq!(SqWqe::wqebb_count(2), 1);
        ensure_eq!(SqWqe::wqebb_count(3), 2);
        ensure_eq!(SqWqe::wqebb_count(17), 5);
        Ok(())
    }

    #[test]
    fn decode_recovers_task_and_sges() -> Result<()> {
        let mut sges: ArrayVec<Sge, 17> = ArrayVec::new();
        for i in 0..5u64 {
            sges.push(Sge {
                addr: DmaAddr::new(0x1_0000_0000 + i * 0x1000),
                len: 100 + i as u32,
            });
        }
        let wqe: SqWqe = SqWqe {
            frame_len: 4000,
            task: TxTask {
                l2_len: 14,
                outer_l3: Some((L3Proto::Ipv4, 20)),
                tunnel: Some((TunnelKind::Udp, 30)),
                inner_l3: Some((L3Proto::Ipv6, 40)),
                l4: L4Offload::Tcp,
                l4_offset: 104,
                l4_len: 20,
                mss: Some(1400),
                vlan: Some(100),
                payload_offset: 124,
            },
            sges,
        };
        let buf: Vec<u8> = wqe.encode();
        ensure_eq!(buf.len(), 2 * 64);
        ensure_eq!(SqWqe::peek_wqebb_count(&buf[..64]), 2);
        ensure_eq!(SqWqe::decode(&buf)?, wqe);
        Ok(())
    }
}
