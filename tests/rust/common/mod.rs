// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::crossbeam_channel::Receiver;
use ::nicq::{
    hw::sim::{
        SimAllocator,
        SimIommu,
        SimNic,
        SimPacketAllocator,
    },
    DataplaneConfig,
    DeviceResources,
    QueueSet,
    RxPacket,
};
use ::std::sync::Arc;

//======================================================================================================================
// Structures
//======================================================================================================================

/// A queue set running on the software device.
#[allow(dead_code)]
pub struct Test {
    pub nic: Arc<SimNic>,
    pub iommu: Arc<SimIommu>,
    pub packets: Arc<SimPacketAllocator>,
    /// Packets delivered to the network stack.
    pub delivered: Receiver<RxPacket>,
    pub set: QueueSet,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Test {
    pub fn open(config: &DataplaneConfig) -> Result<Self> {
        ::nicq::runtime::logging::initialize();
        let iommu: Arc<SimIommu> = Arc::new(SimIommu::new());
        let nic: Arc<SimNic> = Arc::new(SimNic::new(iommu.clone()));
        let packets: Arc<SimPacketAllocator> = Arc::new(SimPacketAllocator::new());
        let (stack, delivered) = ::crossbeam_channel::unbounded();
        let resources: DeviceResources = DeviceResources {
            hw: nic.clone(),
            mapper: iommu.clone(),
            allocator: Arc::new(SimAllocator::new()),
            packets: packets.clone(),
            stack: Arc::new(stack),
        };
        let set: QueueSet = match QueueSet::open(config, resources) {
            Ok(set) => set,
            Err(e) => anyhow::bail!("failed to open queue set: {:?}", e),
        };
        Ok(Self {
            nic,
            iommu,
            packets,
            delivered,
            set,
        })
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Configuration with a single queue pair of the given depth.
#[allow(dead_code)]
pub fn single_queue(depth: u16) -> DataplaneConfig {
    let mut config: DataplaneConfig = DataplaneConfig::default();
    config.num_queues = 1;
    config.sq_depth = depth;
    config.rq_depth = depth;
    config.coalesce.adaptive = false;
    config
}

/// A frame of `len` bytes whose content depends on `seed`.
#[allow(dead_code)]
pub fn frame(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add((i % 251) as u8)).collect()
}
