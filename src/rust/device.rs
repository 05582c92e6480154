// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    coalesce::CoalesceTicker,
    config::DataplaneConfig,
    qp::{
        DeviceResources,
        QueueSet,
    },
    runtime::fail::Fail,
};
use ::std::sync::Arc;

//======================================================================================================================
// Structures
//======================================================================================================================

/// One network interface: its configuration, the resources it runs on and, while it is up, its queues.
pub struct NicDevice {
    name: String,
    config: DataplaneConfig,
    resources: DeviceResources,
    queues: Option<Arc<QueueSet>>,
    ticker: Option<CoalesceTicker>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl NicDevice {
    /// Creates a device that is down.
    pub fn new(name: &str, config: DataplaneConfig, resources: DeviceResources) -> Result<Self, Fail> {
        config.validate()?;
        Ok(Self {
            name: name.to_string(),
            config,
            resources,
            queues: None,
            ticker: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &DataplaneConfig {
        &self.config
    }

    pub fn is_up(&self) -> bool {
        self.queues.is_some()
    }

    /// Queues of the device while it is up.
    pub fn queues(&self) -> Option<&Arc<QueueSet>> {
        self.queues.as_ref()
    }

    /// Opens the queues and starts the periodic interrupt moderation.
    pub fn up(&mut self) -> Result<Arc<QueueSet>, Fail> {
        if let Some(queues) = &self.queues {
            return Ok(queues.clone());
        }

        let queues: Arc<QueueSet> = Arc::new(QueueSet::open(&self.config, self.resources.clone())?);
        if self.config.coalesce.adaptive {
            match CoalesceTicker::spawn(queues.coalesce_controller().clone(), self.config.coalesce.period) {
                Ok(ticker) => self.ticker = Some(ticker),
                Err(e) => {
                    error!("up(): cannot start interrupt moderation (device={}): {:?}", self.name, e);
                    let _ = queues.close();
                    return Err(e);
                },
            }
        }

        info!("up(): device={} num_queues={}", self.name, self.config.num_queues);
        self.queues = Some(queues.clone());
        Ok(queues)
    }

    /// Stops the moderation and closes the queues. The device is down afterwards even if teardown reported an error.
    pub fn down(&mut self) -> Result<(), Fail> {
        if let Some(ticker) = self.ticker.take() {
            ticker.stop();
        }
        let queues: Arc<QueueSet> = match self.queues.take() {
            Some(queues) => queues,
            None => return Ok(()),
        };
        info!("down(): device={}", self.name);
        queues.close()
    }

    /// Replaces the configuration, reopening the queues if the device is up.
    pub fn reconfigure(&mut self, config: DataplaneConfig) -> Result<(), Fail> {
        config.validate()?;
        let was_up: bool = self.is_up();
        if was_up {
            self.down()?;
        }
        self.config = config;
        if was_up {
            self.up()?;
        }
        Ok(())
    }

    /// Changes the MTU of the device.
    pub fn set_mtu(&mut self, mtu: u16) -> Result<(), Fail> {
        let mut config: DataplaneConfig = self.config.clone();
        config.mtu = mtu;
        self.reconfigure(config)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for NicDevice {
    fn drop(&mut self) {
        if let Err(e) = self.down() {
            warn!("drop(): device {} did not go down cleanly: {:?}", self.name, e);
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
