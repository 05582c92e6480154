// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

#[macro_use]
extern crate log;

pub mod coalesce;
pub mod config;
pub mod device;
pub mod hw;
pub mod qp;
pub mod registry;
pub mod ring;
pub mod runtime;
pub mod rx;
pub mod tx;

pub use self::{
    coalesce::{
        CoalesceController,
        CoalesceMode,
        CoalesceRequest,
        CoalesceTarget,
    },
    config::DataplaneConfig,
    device::NicDevice,
    qp::{
        DeviceResources,
        QueueSet,
    },
    registry::{
        DataplaneContext,
        DeviceId,
    },
    runtime::fail::Fail,
    rx::packet::RxPacket,
    tx::{
        packet::TxPacket,
        TxStatus,
    },
};

//======================================================================================================================
// Macros
//======================================================================================================================

/// Ensures that two expressions are equal, bailing out of the enclosing `anyhow::Result` function otherwise.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr $(,)?) => {{
        match (&$left, &$right) {
            (left_val, right_val) => {
                if !(*left_val == *right_val) {
                    ::anyhow::bail!(
                        "ensure failed: `(left == right)` left: `{:?}`, right: `{:?}`",
                        left_val,
                        right_val
                    );
                }
            },
        }
    }};
    ($left:expr, $right:expr, $($arg:tt)+) => {{
        match (&$left, &$right) {
            (left_val, right_val) => {
                if !(*left_val == *right_val) {
                    ::anyhow::bail!(
                        "ensure failed: `(left == right)` left: `{:?}`, right: `{:?}`: {}",
                        left_val,
                        right_val,
                        format_args!($($arg)+)
                    );
                }
            },
        }
    }};
}

/// Ensures that two expressions are not equal, bailing out of the enclosing `anyhow::Result` function otherwise.
#[macro_export]
macro_rules! ensure_neq {
    ($left:expr, $right:expr $(,)?) => {{
        match (&$left, &$right) {
            (left_val, right_val) => {
                if *left_val == *right_val {
                    ::anyhow::bail!(
                        "ensure failed: `(left != right)` left: `{:?}`, right: `{:?}`",
                        left_val,
                        right_val
                    );
                }
            },
        }
    }};
}
