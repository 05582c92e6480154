// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod cmd;
pub mod sim;

//======================================================================================================================
// Imports
//======================================================================================================================

use self::cmd::{
    InterruptCfg,
    MgmtCmd,
    QueueCtxt,
    QueueCtxtClear,
    RqBpThreshold,
    SqForceDrop,
};
use crate::runtime::fail::Fail;

//======================================================================================================================
// Traits
//======================================================================================================================

/// Device side of the queue engine.
///
/// Doorbells are fire-and-forget. The caller orders all descriptor writes before a doorbell with a release fence.
pub trait Hardware: Send + Sync {
    /// Publishes send queue entries up to producer index `pi`.
    fn sq_doorbell(&self, qid: u16, cos: u8, pi: u16);

    /// Publishes receive buffers up to producer index `pi`.
    fn rq_update_pi(&self, qid: u16, pi: u16);

    /// Runs a management command and returns its response body.
    fn mgmt(&self, cmd: MgmtCmd, req: &[u8]) -> Result<Vec<u8>, Fail>;

    fn set_queue_ctxt(&self, ctxt: &QueueCtxt) -> Result<(), Fail> {
        self.mgmt(MgmtCmd::SetQueueCtxt, &ctxt.encode()).map(|_| ())
    }

    fn clear_queue_ctxt(&self, qid: u16) -> Result<(), Fail> {
        self.mgmt(MgmtCmd::ClearQueueCtxt, &QueueCtxtClear { qid }.encode())
            .map(|_| ())
    }

    fn get_interrupt_cfg(&self, qid: u16) -> Result<InterruptCfg, Fail> {
        let resp: Vec<u8> = self.mgmt(MgmtCmd::GetInterruptCfg, &InterruptCfg::encode_query(qid))?;
        InterruptCfg::decode(&resp)
    }

    fn set_interrupt_cfg(&self, cfg: &InterruptCfg) -> Result<(), Fail> {
        self.mgmt(MgmtCmd::SetInterruptCfg, &cfg.encode()).map(|_| ())
    }

    fn set_rq_bp_threshold(&self, qid: u16, threshold: u16) -> Result<(), Fail> {
        self.mgmt(MgmtCmd::SetRqBpThreshold, &RqBpThreshold { qid, threshold }.encode())
            .map(|_| ())
    }

    fn force_drop_sq(&self, qid: u16) -> Result<(), Fail> {
        self.mgmt(MgmtCmd::ForceDropSq, &SqForceDrop { qid }.encode())
            .map(|_| ())
    }
}
