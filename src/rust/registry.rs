// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    config::DataplaneConfig,
    device::NicDevice,
    qp::DeviceResources,
    runtime::{
        fail::{
            Fail,
            FirstFail,
        },
        logging,
    },
};
use ::slab::Slab;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Device Identifier
#[derive(Debug, Eq, PartialEq, Hash, Copy, Clone)]
pub struct DeviceId(u32);

/// Owns every device of the data plane. There is no global state; callers hold the context.
pub struct DataplaneContext {
    devices: Slab<NicDevice>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl DataplaneContext {
    /// Creates an empty context and initializes logging.
    pub fn init() -> Self {
        logging::initialize();
        Self { devices: Slab::new() }
    }

    /// Adds a device that is down.
    pub fn register(
        &mut self,
        name: &str,
        config: DataplaneConfig,
        resources: DeviceResources,
    ) -> Result<DeviceId, Fail> {
        if self.devices.iter().any(|(_, dev)| dev.name() == name) {
            let cause: String = format!("device already registered (name={})", name);
            error!("register(): {}", cause);
            return Err(Fail::new(libc::EEXIST, &cause));
        }
        let dev: NicDevice = NicDevice::new(name, config, resources)?;
        let id: DeviceId = DeviceId::from(self.devices.insert(dev));
        debug!("register(): name={} id={:?}", name, id);
        Ok(id)
    }

    pub fn get(&self, id: DeviceId) -> Option<&NicDevice> {
        self.devices.get(id.into())
    }

    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut NicDevice> {
        self.devices.get_mut(id.into())
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Takes a device down and removes it.
    pub fn remove(&mut self, id: DeviceId) -> Result<(), Fail> {
        if !self.devices.contains(id.into()) {
            let cause: String = format!("no such device (id={:?})", id);
            error!("remove(): {}", cause);
            return Err(Fail::new(libc::ENODEV, &cause));
        }
        let mut dev: NicDevice = self.devices.remove(id.into());
        dev.down()
    }

    /// Takes every device down and removes it. Returns the first teardown error.
    pub fn teardown(&mut self) -> Result<(), Fail> {
        let mut first: FirstFail = FirstFail::default();
        for mut dev in self.devices.drain() {
            first.record(dev.down());
        }
        first.into_result()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<DeviceId> for usize {
    fn from(val: DeviceId) -> Self {
        val.0 as usize
    }
}

impl From<usize> for DeviceId {
    fn from(val: usize) -> Self {
        DeviceId(val as u32)
    }
}

impl From<DeviceId> for u32 {
    fn from(val: DeviceId) -> Self {
        val.0
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::{
        DataplaneContext,
        DeviceId,
    };
    use crate::{
        config::DataplaneConfig,
        ensure_eq,
        ensure_neq,
        hw::{
            cmd::MgmtCmd,
            sim::{
                SimAllocator,
                SimIommu,
                SimNic,
                SimPacketAllocator,
            },
        },
        qp::DeviceResources,
        rx::packet::RxPacket,
    };
    use ::anyhow::Result;
    use ::crossbeam_channel::Sender;
    use ::std::sync::Arc;

    fn resources(nic: &Arc<SimNic>) -> DeviceResources {
        let (tx, _): (Sender<RxPacket>, _) = ::crossbeam_channel::unbounded();
        DeviceResources {
            hw: nic.clone(),
            mapper: nic.iommu().clone(),
            allocator: Arc::new(SimAllocator::new()),
            packets: Arc::new(SimPacketAllocator::new()),
            stack: Arc::new(tx),
        }
    }

    fn config() -> DataplaneConfig {
        let mut config: DataplaneConfig = DataplaneConfig::default();
        config.num_queues = 1;
        config.sq_depth = 64;
        config.rq_depth = 64;
        config.coalesce.adaptive = false;
        config
    }

    #[test]
    fn register_and_remove() -> Result<()> {
        let mut ctx: DataplaneContext = DataplaneContext::init();
        let nic: Arc<SimNic> = Arc::new(SimNic::new(Arc::new(SimIommu::new())));
        let a: DeviceId = ctx.register("eth0", config(), resources(&nic))?;
        let b: DeviceId = ctx.register("eth1", config(), resources(&nic))?;
        ensure_neq!(a, b);
        ensure_eq!(ctx.len(), 2);
        let e = ctx.register("eth0", config(), resources(&nic)).err();
        ensure_eq!(e.map(|e| e.errno), Some(libc::EEXIST));

        ctx.get_mut(a).ok_or(anyhow::anyhow!("missing device"))?.up()?;
        ensure_eq!(ctx.get(a).map(|dev| dev.is_up()), Some(true));
        ctx.remove(a)?;
        ensure_eq!(ctx.get(a).is_none(), true);
        ensure_eq!(ctx.remove(a).err().map(|e| e.errno), Some(libc::ENODEV));
        ensure_eq!(nic.mgmt_calls(MgmtCmd::ClearQueueCtxt), 1);

        ctx.teardown()?;
        ensure_eq!(ctx.is_empty(), true);
        Ok(())
    }

    #[test]
    fn teardown_downs_every_device() -> Result<()> {
        let mut ctx: DataplaneContext = DataplaneContext::init();
        let nic0: Arc<SimNic> = Arc::new(SimNic::new(Arc::new(SimIommu::new())));
        let nic1: Arc<SimNic> = Arc::new(SimNic::new(Arc::new(SimIommu::new())));
        for (name, nic) in [("eth0", &nic0), ("eth1", &nic1)] {
            let id: DeviceId = ctx.register(name, config(), resources(nic))?;
            ctx.get_mut(id).ok_or(anyhow::anyhow!("missing device"))?.up()?;
        }
        ctx.teardown()?;
        ensure_eq!(nic0.mgmt_calls(MgmtCmd::ClearQueueCtxt), 1);
        ensure_eq!(nic1.mgmt_calls(MgmtCmd::ClearQueueCtxt), 1);
        ensure_eq!(nic0.iommu().live_mappings(), 0);
        Ok(())
    }
}
