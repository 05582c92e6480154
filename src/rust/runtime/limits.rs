// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Hardware limits of the queue engine. Calibration values that differ between boards live in
//! [crate::config] instead.

/// Size of a work queue entry basic block (WQEBB) in a send queue.
pub const SQ_WQEBB_SIZE: usize = 64;

/// Size of a receive queue entry. Receive WQEs always occupy exactly one basic block.
pub const RQ_WQE_SIZE: usize = 32;

/// Size of a receive completion queue entry.
pub const CQE_SIZE: usize = 32;

/// Maximum number of scatter-gather entries in a send WQE, header included.
pub const MAX_SQ_SGE: usize = 17;

/// Largest payload offset the send task section can express.
pub const MAX_PAYLOAD_OFFSET: usize = 221;

/// Largest byte count a single scatter-gather entry may describe.
pub const MAX_SGE_LEN: usize = 65536;

/// Largest non-fragmented frame accepted for transmission.
pub const GSO_MAX_SIZE: usize = 65536;

/// Frames shorter than this are zero-padded before transmission.
pub const MIN_TX_FRAME_LEN: usize = 32;

/// Smallest and largest supported queue depths.
pub const MIN_QUEUE_DEPTH: u16 = 64;
pub const MAX_QUEUE_DEPTH: u16 = 16384;

/// Smallest and largest supported MTU.
pub const MIN_MTU: u16 = 256;
pub const MAX_MTU: u16 = 9600;

/// Base page size used by the receive buffer pool.
pub const PAGE_SIZE: usize = 4096;

/// Maximum number of sub-packets that a single super CQE may describe.
pub const MAX_SUPER_CQE_PKTS: usize = 8;

/// Maximum number of queue pairs.
pub const MAX_QUEUES: u16 = 64;
