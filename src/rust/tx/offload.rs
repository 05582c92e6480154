// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::limits::MAX_PAYLOAD_OFFSET,
    tx::packet::{
        HeaderLayout,
        L3Proto,
        L4Proto,
        TunnelKind,
        TxPacket,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Largest segment size of the task section.
const MAX_MSS: u16 = 0x3fff;

//======================================================================================================================
// Structures
//======================================================================================================================

/// L4 offload the device performs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum L4Offload {
    #[default]
    None,
    Tcp,
    Udp,
    Sctp,
}

/// Task section of a send WQE. Offsets and lengths are in bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxTask {
    pub l2_len: u8,
    pub outer_l3: Option<(L3Proto, u8)>,
    pub tunnel: Option<(TunnelKind, u8)>,
    pub inner_l3: Option<(L3Proto, u8)>,
    pub l4: L4Offload,
    pub l4_offset: u8,
    pub l4_len: u8,
    /// Segment size when segmentation offload is on.
    pub mss: Option<u16>,
    pub vlan: Option<u16>,
    pub payload_offset: u8,
}

/// Outcome of offload task construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskOutcome {
    pub task: TxTask,
    /// Checksum offload was requested but cannot be done by the device, the packet goes out without it.
    pub csum_fallback: bool,
}

/// The packet asks for an offload the send task section cannot express.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OffloadInvalid;

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Builds the task section of `packet`.
pub fn build_task(packet: &TxPacket) -> Result<TaskOutcome, OffloadInvalid> {
    let mut task: TxTask = TxTask {
        vlan: packet.vlan(),
        ..Default::default()
    };

    if let Some(gso) = packet.gso() {
        let layout: &HeaderLayout = packet.layout().ok_or(OffloadInvalid)?;
        let l4: L4Offload = match layout.l4 {
            L4Proto::Tcp => L4Offload::Tcp,
            L4Proto::Udp => L4Offload::Udp,
            _ => return Err(OffloadInvalid),
        };
        if gso.mss == 0 || gso.mss > MAX_MSS {
            return Err(OffloadInvalid);
        }
        fill_headers(&mut task, layout, l4)?;
        task.mss = Some(gso.mss);
        return Ok(TaskOutcome {
            task,
            csum_fallback: false,
        });
    }

    if packet.csum() {
        let l4: L4Offload = match packet.layout().map(|layout| layout.l4) {
            Some(L4Proto::Tcp) => L4Offload::Tcp,
            Some(L4Proto::Udp) => L4Offload::Udp,
            Some(L4Proto::Sctp) => L4Offload::Sctp,
            _ => {
                return Ok(TaskOutcome {
                    task,
                    csum_fallback: true,
                })
            },
        };
        if let Some(layout) = packet.layout() {
            fill_headers(&mut task, layout, l4)?;
        }
    }

    Ok(TaskOutcome {
        task,
        csum_fallback: false,
    })
}

fn fill_headers(task: &mut TxTask, layout: &HeaderLayout, l4: L4Offload) -> Result<(), OffloadInvalid> {
    if layout.payload_offset() > MAX_PAYLOAD_OFFSET {
        return Err(OffloadInvalid);
    }
    // Every length below is bounded by the payload offset.
    task.l2_len = layout.l2_len as u8;
    if let Some(tunnel) = layout.tunnel {
        task.outer_l3 = Some((tunnel.outer_l3, tunnel.outer_l3_len as u8));
        task.tunnel = Some((tunnel.kind, tunnel.tunnel_len as u8));
    }
    task.inner_l3 = Some((layout.l3, layout.l3_len as u8));
    task.l4 = l4;
    task.l4_offset = layout.l4_offset() as u8;
    task.l4_len = layout.l4_len as u8;
    task.payload_offset = layout.payload_offset() as u8;
    Ok(())
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
