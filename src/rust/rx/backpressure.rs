// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::config::BackpressureConfig;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Back-pressure state of one receive queue.
///
/// The device flags completions while the receive queue is congested. Once enough flagged completions were seen and
/// the ring holds more than `upper_thd` posted buffers, the condition is cleared by programming `lower_thd`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backpressure {
    enabled: bool,
    upper_thd: u16,
    lower_thd: u16,
    count_thd: u32,
    /// Flagged completions since the last unlock.
    flagged: u32,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Backpressure {
    pub fn new(config: &BackpressureConfig) -> Self {
        Self {
            enabled: config.enabled,
            upper_thd: config.upper_thd,
            lower_thd: config.lower_thd,
            count_thd: config.count_thd,
            flagged: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Threshold programmed when the queue opens.
    pub fn initial_threshold(&self) -> Option<u16> {
        self.enabled.then_some(self.upper_thd)
    }

    pub fn flagged(&self) -> u32 {
        self.flagged
    }

    /// Records `count` flagged completions.
    pub fn observe(&mut self, count: u32) {
        if self.enabled {
            self.flagged = self.flagged.saturating_add(count);
        }
    }

    /// Returns the threshold to program if the condition can be cleared with `posted` buffers on the ring.
    pub fn check_unlock(&mut self, posted: u16) -> Option<u16> {
        if !self.enabled || self.flagged < self.count_thd || posted <= self.upper_thd {
            return None;
        }
        self.flagged = 0;
        Some(self.lower_thd)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
