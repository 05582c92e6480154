// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::memory::DmaRegion;
use ::crossbeam_channel::Sender;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Checksum state of a received packet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RxChecksum {
    /// Not validated, the stack must check it.
    #[default]
    None,
    /// Validated by the device.
    Unnecessary,
}

/// Segmentation metadata of a packet merged by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RxGso {
    /// Payload bytes per merged segment.
    pub size: u16,
    /// Number of merged segments.
    pub segs: u16,
}

/// A reference to part of a receive page.
#[derive(Clone, Debug)]
pub struct RxFrag {
    region: DmaRegion,
    offset: usize,
    len: usize,
}

/// A received packet: optional copied bytes followed by page fragments.
#[derive(Debug, Default)]
pub struct RxPacket {
    linear: Vec<u8>,
    frags: Vec<RxFrag>,
    qid: u16,
    csum: RxChecksum,
    vlan: Option<u16>,
    rss_hash: u32,
    gso: Option<RxGso>,
}

//======================================================================================================================
// Traits
//======================================================================================================================

/// Source of packet objects.
pub trait PacketAllocator: Send + Sync {
    /// Allocates an empty packet whose linear area holds at least `linear` bytes. `None` means out of memory.
    fn alloc(&self, linear: usize) -> Option<RxPacket>;
}

/// Upper layer that consumes received packets.
pub trait NetStack: Send + Sync {
    fn deliver(&self, packet: RxPacket);
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Packet allocator backed by the process heap.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeapPacketAllocator;

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl RxFrag {
    pub fn new(region: DmaRegion, offset: usize, len: usize) -> Self {
        Self { region, offset, len }
    }

    pub fn region(&self) -> &DmaRegion {
        &self.region
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl RxPacket {
    pub fn with_capacity(linear: usize) -> Self {
        Self {
            linear: Vec::with_capacity(linear),
            ..Default::default()
        }
    }

    /// Total length in bytes.
    pub fn len(&self) -> usize {
        self.linear.len() + self.frags.iter().map(|f| f.len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any bytes live in page fragments.
    pub fn is_nonlinear(&self) -> bool {
        !self.frags.is_empty()
    }

    pub fn linear(&self) -> &[u8] {
        &self.linear
    }

    pub fn frags(&self) -> &[RxFrag] {
        &self.frags
    }

    pub fn qid(&self) -> u16 {
        self.qid
    }

    pub fn csum(&self) -> RxChecksum {
        self.csum
    }

    pub fn vlan(&self) -> Option<u16> {
        self.vlan
    }

    pub fn rss_hash(&self) -> u32 {
        self.rss_hash
    }

    pub fn gso(&self) -> Option<RxGso> {
        self.gso
    }

    /// Copies the whole packet into one buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out: Vec<u8> = self.linear.clone();
        for frag in &self.frags {
            out.extend(frag.region.read_bytes(frag.offset, frag.len));
        }
        out
    }

    pub(crate) fn append_linear(&mut self, bytes: &[u8]) {
        self.linear.extend_from_slice(bytes);
    }

    pub(crate) fn append_frag(&mut self, frag: RxFrag) {
        self.frags.push(frag);
    }

    pub(crate) fn set_qid(&mut self, qid: u16) {
        self.qid = qid;
    }

    pub(crate) fn set_csum(&mut self, csum: RxChecksum) {
        self.csum = csum;
    }

    pub(crate) fn set_vlan(&mut self, vlan: Option<u16>) {
        self.vlan = vlan;
    }

    pub(crate) fn set_rss_hash(&mut self, hash: u32) {
        self.rss_hash = hash;
    }

    pub(crate) fn set_gso(&mut self, gso: Option<RxGso>) {
        self.gso = gso;
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl PacketAllocator for HeapPacketAllocator {
    fn alloc(&self, linear: usize) -> Option<RxPacket> {
        let mut bytes: Vec<u8> = Vec::new();
        bytes.try_reserve_exact(linear).ok()?;
        Some(RxPacket {
            linear: bytes,
            ..Default::default()
        })
    }
}

/// Packets are dropped if the receiving end of the channel is gone.
impl NetStack for Sender<RxPacket> {
    fn deliver(&self, packet: RxPacket) {
        let _ = self.send(packet);
    }
}
