// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    memory::DmaAddr,
};
use ::std::collections::HashMap;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Management commands issued by the queue engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MgmtCmd {
    SetQueueCtxt,
    ClearQueueCtxt,
    GetInterruptCfg,
    SetInterruptCfg,
    SetRqBpThreshold,
    ForceDropSq,
}

/// Describes the memory of one queue pair to the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueCtxt {
    pub qid: u16,
    pub cos: u8,
    pub sq_depth: u16,
    pub sq_base: DmaAddr,
    /// Where the device mirrors its send queue consumer index.
    pub sq_ci_addr: DmaAddr,
    pub rq_depth: u16,
    pub rq_base: DmaAddr,
    pub cqe_base: DmaAddr,
    pub rx_buf_len: u32,
}

/// Releases the device state of one queue pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueCtxtClear {
    pub qid: u16,
}

/// Interrupt moderation of one queue. Values are in hardware units.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InterruptCfg {
    pub qid: u16,
    pub pending_limit: u8,
    pub coalesce_timer: u8,
    pub resend_timer: u8,
}

/// Reprograms the receive back-pressure threshold of one queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RqBpThreshold {
    pub qid: u16,
    pub threshold: u16,
}

/// Asks the device to discard everything still queued on a send queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SqForceDrop {
    pub qid: u16,
}

/// A management command handler.
pub type CommandHandler = Box<dyn Fn(&[u8]) -> Result<Vec<u8>, Fail> + Send + Sync>;

/// Maps management commands to their handlers.
#[derive(Default)]
pub struct CommandTable {
    handlers: HashMap<MgmtCmd, CommandHandler>,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Sequential little-endian reader over a message body.
struct Reader<'a> {
    cmd: &'static str,
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(cmd: &'static str, buf: &'a [u8], len: usize) -> Result<Self, Fail> {
        if buf.len() != len {
            let cause: String = format!("{}: bad message length (expected={}, got={})", cmd, len, buf.len());
            warn!("decode(): {}", cause);
            return Err(Fail::new(libc::EBADMSG, &cause));
        }
        Ok(Self { cmd, buf })
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut bytes: [u8; N] = [0; N];
        bytes.copy_from_slice(&self.buf[..N]);
        self.buf = &self.buf[N..];
        bytes
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn addr(&mut self) -> DmaAddr {
        DmaAddr::new(u64::from_le_bytes(self.take()))
    }

    fn skip(&mut self, n: usize) {
        self.buf = &self.buf[n..];
    }

    fn finish(self) -> Result<(), Fail> {
        debug_assert!(self.buf.is_empty(), "{}: trailing bytes", self.cmd);
        Ok(())
    }
}

impl QueueCtxt {
    pub const LEN: usize = 48;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf: Vec<u8> = Vec::with_capacity(Self::LEN);
        buf.extend_from_slice(&self.qid.to_le_bytes());
        buf.push(self.cos);
        buf.push(0);
        buf.extend_from_slice(&self.sq_depth.to_le_bytes());
        buf.extend_from_slice(&self.rq_depth.to_le_bytes());
        buf.extend_from_slice(&self.sq_base.get().to_le_bytes());
        buf.extend_from_slice(&self.sq_ci_addr.get().to_le_bytes());
        buf.extend_from_slice(&self.rq_base.get().to_le_bytes());
        buf.extend_from_slice(&self.cqe_base.get().to_le_bytes());
        buf.extend_from_slice(&self.rx_buf_len.to_le_bytes());
        buf.extend_from_slice(&[0; 4]);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Fail> {
        let mut r: Reader = Reader::new("queue context", buf, Self::LEN)?;
        let qid: u16 = r.u16();
        let cos: u8 = r.u8();
        r.skip(1);
        let ctxt: Self = Self {
            qid,
            cos,
            sq_depth: r.u16(),
            rq_depth: r.u16(),
            sq_base: r.addr(),
            sq_ci_addr: r.addr(),
            rq_base: r.addr(),
            cqe_base: r.addr(),
            rx_buf_len: r.u32(),
        };
        r.skip(4);
        r.finish()?;
        Ok(ctxt)
    }
}

impl QueueCtxtClear {
    pub const LEN: usize = 4;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf: Vec<u8> = self.qid.to_le_bytes().to_vec();
        buf.extend_from_slice(&[0, 0]);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Fail> {
        let mut r: Reader = Reader::new("queue context clear", buf, Self::LEN)?;
        let qid: u16 = r.u16();
        r.skip(2);
        r.finish()?;
        Ok(Self { qid })
    }
}

impl InterruptCfg {
    pub const LEN: usize = 8;

    /// Encodes a get request, which only carries the queue.
    pub fn encode_query(qid: u16) -> Vec<u8> {
        Self {
            qid,
            ..Default::default()
        }
        .encode()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf: Vec<u8> = Vec::with_capacity(Self::LEN);
        buf.extend_from_slice(&self.qid.to_le_bytes());
        buf.push(self.pending_limit);
        buf.push(self.coalesce_timer);
        buf.push(self.resend_timer);
        buf.extend_from_slice(&[0, 0, 0]);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Fail> {
        let mut r: Reader = Reader::new("interrupt config", buf, Self::LEN)?;
        let cfg: Self = Self {
            qid: r.u16(),
            pending_limit: r.u8(),
            coalesce_timer: r.u8(),
            resend_timer: r.u8(),
        };
        r.skip(3);
        r.finish()?;
        Ok(cfg)
    }
}

impl RqBpThreshold {
    pub const LEN: usize = 4;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf: Vec<u8> = self.qid.to_le_bytes().to_vec();
        buf.extend_from_slice(&self.threshold.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Fail> {
        let mut r: Reader = Reader::new("rq back-pressure threshold", buf, Self::LEN)?;
        let msg: Self = Self {
            qid: r.u16(),
            threshold: r.u16(),
        };
        r.finish()?;
        Ok(msg)
    }
}

impl SqForceDrop {
    pub const LEN: usize = 4;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf: Vec<u8> = self.qid.to_le_bytes().to_vec();
        buf.extend_from_slice(&[1, 0]);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Fail> {
        let mut r: Reader = Reader::new("sq force drop", buf, Self::LEN)?;
        let qid: u16 = r.u16();
        r.skip(2);
        r.finish()?;
        Ok(Self { qid })
    }
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the handler of `cmd`. A command has at most one handler.
    pub fn register<F>(&mut self, cmd: MgmtCmd, handler: F) -> Result<(), Fail>
    where
        F: Fn(&[u8]) -> Result<Vec<u8>, Fail> + Send + Sync + 'static,
    {
        if self.handlers.contains_key(&cmd) {
            let cause: String = format!("command already has a handler (cmd={:?})", cmd);
            error!("register(): {}", cause);
            return Err(Fail::new(libc::EEXIST, &cause));
        }
        self.handlers.insert(cmd, Box::new(handler));
        Ok(())
    }

    /// Removes the handler of `cmd`, returning whether one was installed.
    pub fn unregister(&mut self, cmd: MgmtCmd) -> bool {
        self.handlers.remove(&cmd).is_some()
    }

    pub fn is_registered(&self, cmd: MgmtCmd) -> bool {
        self.handlers.contains_key(&cmd)
    }

    /// Runs the handler of `cmd` on `req`.
    pub fn dispatch(&self, cmd: MgmtCmd, req: &[u8]) -> Result<Vec<u8>, Fail> {
        match self.handlers.get(&cmd) {
            Some(handler) => handler(req),
            None => {
                let cause: String = format!("no handler for command (cmd={:?})", cmd);
                warn!("dispatch(): {}", cause);
                Err(Fail::new(libc::EOPNOTSUPP, &cause))
            },
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod test {
    use super::{
        CommandTable,
        InterruptCfg,
        MgmtCmd,
        QueueCtxt,
    };
    use crate::{
        ensure_eq,
        runtime::memory::DmaAddr,
    };
    use ::anyhow::Result;

    #[test]
    fn queue_context_layout() -> Result<()> {
        let ctxt: QueueCtxt = QueueCtxt {
            qid: 3,
            cos: 5,
            sq_depth: 1024,
            sq_base: DmaAddr::new(0x1_0000_1000),
            sq_ci_addr: DmaAddr::new(0x2000),
            rq_depth: 512,
            rq_base: DmaAddr::new(0x3000),
            cqe_base: DmaAddr::new(0x4000),
            rx_buf_len: 2048,
        };
        let buf: Vec<u8> = ctxt.encode();
        ensure_eq!(buf.len(), QueueCtxt::LEN);
        ensure_eq!(&buf[..4], &[3, 0, 5, 0]);
        ensure_eq!(&buf[8..16], &0x1_0000_1000u64.to_le_bytes());
        ensure_eq!(QueueCtxt::decode(&buf)?, ctxt);
        Ok(())
    }

    #[test]
    fn short_message_is_rejected() -> Result<()> {
        let e = InterruptCfg::decode(&[1, 2, 3]).err();
        ensure_eq!(e.map(|e| e.errno), Some(libc::EBADMSG));
        Ok(())
    }

    #[test]
    fn dispatch_follows_registration() -> Result<()> {
        let mut table: CommandTable = CommandTable::new();
        ensure_eq!(
            table.dispatch(MgmtCmd::ForceDropSq, &[]).err().map(|e| e.errno),
            Some(libc::EOPNOTSUPP)
        );

        table.register(MgmtCmd::ForceDropSq, |req: &[u8]| Ok(req.to_vec()))?;
        ensure_eq!(
            table
                .register(MgmtCmd::ForceDropSq, |_: &[u8]| Ok(Vec::new()))
                .err()
                .map(|e| e.errno),
            Some(libc::EEXIST)
        );
        ensure_eq!(table.dispatch(MgmtCmd::ForceDropSq, &[7])?, vec![7]);

        ensure_eq!(table.unregister(MgmtCmd::ForceDropSq), true);
        ensure_eq!(table.unregister(MgmtCmd::ForceDropSq), false);
        ensure_eq!(table.is_registered(MgmtCmd::ForceDropSq), false);
        Ok(())
    }
}
