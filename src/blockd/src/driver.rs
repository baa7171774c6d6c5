//! The lower block-driver contract consumed by the server, and the adapter
//! that unifies its two historical shapes: the modern block-operation record
//! (block-unit offsets, 16-bit length field) and the legacy byte-oriented
//! io-transaction. Exactly one shape is used per device, chosen when the
//! session opens.

use std::sync::Arc;

use interface::{DeviceInfo, IoFlags, Status};

use crate::vmo::Vmo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCommand {
    Read,
    Write,
    Flush,
}

/// Invoked exactly once per issued operation.
pub type OpCompletion = Box<dyn FnOnce(Status) + Send>;

/// The modern operation record. All offsets are in block units.
pub struct BlockOp {
    pub command: BlockCommand,
    /// Transfer length in blocks, minus one.
    pub length: u16,
    pub offset_dev: u64,
    pub offset_vmo: u64,
    pub flags: IoFlags,
    /// Absent for `Flush`.
    pub vmo: Option<Arc<Vmo>>,
    completion: Option<OpCompletion>,
}

impl BlockOp {
    pub fn rw(
        command: BlockCommand,
        length: u16,
        offset_dev: u64,
        offset_vmo: u64,
        flags: IoFlags,
        vmo: Arc<Vmo>,
        completion: OpCompletion,
    ) -> BlockOp {
        BlockOp {
            command,
            length,
            offset_dev,
            offset_vmo,
            flags,
            vmo: Some(vmo),
            completion: Some(completion),
        }
    }

    pub fn flush(completion: OpCompletion) -> BlockOp {
        BlockOp {
            command: BlockCommand::Flush,
            length: 0,
            offset_dev: 0,
            offset_vmo: 0,
            flags: IoFlags::empty(),
            vmo: None,
            completion: Some(completion),
        }
    }

    /// Transfer length in blocks.
    #[inline]
    pub fn blocks(&self) -> u64 {
        u64::from(self.length) + 1
    }

    /// Consume the operation, firing its completion.
    pub fn complete(mut self, status: Status) {
        if let Some(completion) = self.completion.take() {
            completion(status);
        }
    }
}

pub trait BlockQueue: Send + Sync {
    /// Device geometry plus the operation record size the driver expects.
    fn query(&self) -> (DeviceInfo, usize);
    /// Asynchronous; the driver fires the operation's completion exactly
    /// once, possibly on another thread.
    fn queue(&self, op: BlockOp);
}

/// The legacy io-transaction record. Offsets and length are in bytes.
pub struct Iotxn {
    pub opcode: BlockCommand,
    pub flags: IoFlags,
    pub length: u64,
    /// Device offset, bytes.
    pub offset: u64,
    pub vmo_offset: u64,
    pub vmo: Option<Arc<Vmo>>,
    completion: Option<OpCompletion>,
}

impl Iotxn {
    pub fn new(
        opcode: BlockCommand,
        flags: IoFlags,
        length: u64,
        offset: u64,
        vmo_offset: u64,
        vmo: Option<Arc<Vmo>>,
        completion: OpCompletion,
    ) -> Iotxn {
        Iotxn {
            opcode,
            flags,
            length,
            offset,
            vmo_offset,
            vmo,
            completion: Some(completion),
        }
    }

    pub fn complete(mut self, status: Status) {
        if let Some(completion) = self.completion.take() {
            completion(status);
        }
    }

    pub(crate) fn take_completion(&mut self) -> Option<OpCompletion> {
        self.completion.take()
    }
}

pub trait IotxnQueue: Send + Sync {
    fn info(&self) -> DeviceInfo;
    fn queue(&self, txn: Iotxn);
}

/// The per-device lower driver handle.
#[derive(Clone)]
pub enum Lower {
    Modern(Arc<dyn BlockQueue>),
    Legacy(Arc<dyn IotxnQueue>),
}

impl Lower {
    pub fn query(&self) -> (DeviceInfo, usize) {
        match self {
            Lower::Modern(dev) => dev.query(),
            Lower::Legacy(dev) => (dev.info(), 0),
        }
    }

    pub fn info(&self) -> DeviceInfo {
        self.query().0
    }

    /// Issue one read or write. Byte-unit arguments are converted to
    /// whichever record shape the device speaks; `length`, `vmo_offset` and
    /// `dev_offset` must already be block-aligned.
    pub(crate) fn queue_rw(
        &self,
        command: BlockCommand,
        flags: IoFlags,
        vmo: &Arc<Vmo>,
        length: u64,
        vmo_offset: u64,
        dev_offset: u64,
        block_size: u32,
        completion: OpCompletion,
    ) {
        debug_assert!(command != BlockCommand::Flush);
        match self {
            Lower::Modern(dev) => {
                let bsize = u64::from(block_size);
                let op = BlockOp::rw(
                    command,
                    (length / bsize - 1) as u16,
                    dev_offset / bsize,
                    vmo_offset / bsize,
                    flags,
                    Arc::clone(vmo),
                    completion,
                );
                dev.queue(op);
            }
            Lower::Legacy(dev) => {
                let txn = Iotxn::new(
                    command,
                    flags,
                    length,
                    dev_offset,
                    vmo_offset,
                    Some(Arc::clone(vmo)),
                    completion,
                );
                dev.queue(txn);
            }
        }
    }

    /// Flush exists only on the modern shape.
    pub(crate) fn queue_flush(&self, completion: OpCompletion) -> Result<(), Status> {
        match self {
            Lower::Modern(dev) => {
                dev.queue(BlockOp::flush(completion));
                Ok(())
            }
            Lower::Legacy(_) => Err(Status::NotSupported),
        }
    }
}
