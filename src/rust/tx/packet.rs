// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    memory::DmaRegion,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A contiguous byte range of a packet.
#[derive(Clone, Debug)]
pub struct Fragment {
    region: DmaRegion,
    offset: usize,
    len: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum L3Proto {
    Ipv4,
    Ipv6,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum L4Proto {
    Tcp,
    Udp,
    Sctp,
    /// Any other IP protocol number.
    Other(u8),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelKind {
    /// UDP based encapsulation such as VXLAN or GENEVE.
    Udp,
    Gre,
}

/// Outer headers of an encapsulated packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tunnel {
    pub kind: TunnelKind,
    pub outer_l3: L3Proto,
    pub outer_l3_len: usize,
    /// Bytes between the end of the outer L3 header and the start of the inner L3 header.
    pub tunnel_len: usize,
}

/// Header lengths of a packet, as parsed by the stack. For an encapsulated packet `l2_len` is the outer L2 header and
/// `l3`/`l4` describe the inner headers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderLayout {
    pub l2_len: usize,
    pub l3: L3Proto,
    pub l3_len: usize,
    pub l4: L4Proto,
    pub l4_len: usize,
    pub tunnel: Option<Tunnel>,
}

/// Segmentation offload request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Gso {
    /// Payload bytes per wire segment.
    pub mss: u16,
    /// Number of wire segments.
    pub segs: u16,
}

/// An outgoing packet: a linear header followed by page fragments.
#[derive(Clone, Debug)]
pub struct TxPacket {
    header: Fragment,
    frags: Vec<Fragment>,
    layout: Option<HeaderLayout>,
    csum: bool,
    gso: Option<Gso>,
    vlan: Option<u16>,
    more: bool,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Fragment {
    pub fn new(region: DmaRegion, offset: usize, len: usize) -> Self {
        debug_assert!(offset + len <= region.len());
        Self { region, offset, len }
    }

    /// Copies `data` into a fresh region on `node`.
    pub fn from_bytes(data: &[u8], node: u16) -> Result<Self, Fail> {
        let region: DmaRegion = DmaRegion::from_bytes(data, node)?;
        Ok(Self::new(region, 0, data.len()))
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

    pub fn to_vec(&self) -> Vec<u8> {
        self.region.read_bytes(self.offset, self.len)
    }
}

impl HeaderLayout {
    /// Offset of the (inner) L4 header.
    pub fn l4_offset(&self) -> usize {
        let outer: usize = self.tunnel.map_or(0, |t| t.outer_l3_len + t.tunnel_len);
        self.l2_len + outer + self.l3_len
    }

    /// Offset of the first payload byte.
    pub fn payload_offset(&self) -> usize {
        self.l4_offset() + self.l4_len
    }
}

impl TxPacket {
    pub fn new(header: Fragment) -> Self {
        Self {
            header,
            frags: Vec::new(),
            layout: None,
            csum: false,
            gso: None,
            vlan: None,
            more: false,
        }
    }

    /// A linear packet holding a copy of `data`.
    pub fn from_bytes(data: &[u8], node: u16) -> Result<Self, Fail> {
        Ok(Self::new(Fragment::from_bytes(data, node)?))
    }

    pub fn with_frag(mut self, frag: Fragment) -> Self {
        self.frags.push(frag);
        self
    }

    pub fn with_frags(mut self, frags: impl IntoIterator<Item = Fragment>) -> Self {
        self.frags.extend(frags);
        self
    }

    pub fn with_layout(mut self, layout: HeaderLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    /// Requests L4 checksum offload.
    pub fn with_csum(mut self) -> Self {
        self.csum = true;
        self
    }

    /// Requests segmentation offload. Implies checksum offload.
    pub fn with_gso(mut self, mss: u16, segs: u16) -> Self {
        self.gso = Some(Gso { mss, segs });
        self.csum = true;
        self
    }

    /// Requests insertion of a VLAN tag.
    pub fn with_vlan(mut self, tag: u16) -> Self {
        self.vlan = Some(tag);
        self
    }

    /// Marks that another packet follows immediately, so the doorbell may be deferred.
    pub fn with_more(mut self, more: bool) -> Self {
        self.more = more;
        self
    }

    pub fn header(&self) -> &Fragment {
        &self.header
    }

    pub fn frags(&self) -> &[Fragment] {
        &self.frags
    }

    pub fn layout(&self) -> Option<&HeaderLayout> {
        self.layout.as_ref()
    }

    pub fn csum(&self) -> bool {
        self.csum
    }

    pub fn gso(&self) -> Option<Gso> {
        self.gso
    }

    pub fn vlan(&self) -> Option<u16> {
        self.vlan
    }

    pub fn more(&self) -> bool {
        self.more
    }

    /// Total length in bytes.
    pub fn len(&self) -> usize {
        self.header.len + self.frags.iter().map(|f| f.len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the whole packet into one buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out: Vec<u8> = self.header.to_vec();
        for frag in &self.frags {
            out.extend(frag.to_vec());
        }
        out
    }

    /// Replaces the contents with a single linear copy zero-padded to `min_len` bytes.
    pub(crate) fn linearize_padded(&mut self, min_len: usize, node: u16) -> Result<(), Fail> {
        let mut data: Vec<u8> = self.to_vec();
        if data.len() < min_len {
            data.resize(min_len, 0);
        }
        self.header = Fragment::from_bytes(&data, node)?;
        self.frags.clear();
        Ok(())
    }

    /// Number of wire packets and wire bytes this packet turns into.
    pub(crate) fn wire_counts(&self) -> (u64, u64) {
        let len: u64 = self.len() as u64;
        match (self.gso, self.layout) {
            (Some(gso), Some(layout)) if gso.segs > 1 => {
                let segs: u64 = gso.segs as u64;
                (segs, len + (segs - 1) * layout.payload_offset() as u64)
            },
            _ => (1, len),
        }
    }
}
