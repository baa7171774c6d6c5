//! The serving worker: batch-reads requests, validates them against the
//! registry, table and device geometry, splits oversize transfers, and issues
//! sub-operations to the lower driver.

use std::sync::{Arc, Mutex};

use interface::{
    BlockFifoRequest, DeviceInfo, Opcode, RegionId, RequestFlags, Status, TxnId, FIFO_MAX_DEPTH,
};

use super::registry::{IoBuffer, VmoRegistry};
use super::txn::{respond, BlockMsg, TxnSlot, TxnTable};
use super::{ClientFifo, Error, ServerFifo};
use crate::driver::{BlockCommand, Lower, OpCompletion};
use crate::vmo::Vmo;

/// Largest single request, in blocks. The modern operation record encodes the
/// block count in a 16-bit `n - 1` field.
const MAX_REQUEST_BLOCKS: u64 = 65536;

pub struct BlockServer {
    fifo: Arc<ServerFifo>,
    lower: Lower,
    /// Geometry snapshot taken at session open.
    info: DeviceInfo,
    block_op_size: usize,
    /// The server lock: registry plus slot occupancy.
    inner: Mutex<Inner>,
}

struct Inner {
    registry: VmoRegistry,
    txns: TxnTable,
}

impl BlockServer {
    /// Open a session: returns the client end of a fresh fifo pair and the
    /// server half that will serve it.
    pub fn create(lower: Lower) -> (ClientFifo, Arc<BlockServer>) {
        let (client, server_end) = fifo::channel(FIFO_MAX_DEPTH);
        let (info, block_op_size) = lower.query();
        let server = Arc::new(BlockServer {
            fifo: Arc::new(server_end),
            lower,
            info,
            block_op_size,
            inner: Mutex::new(Inner {
                registry: VmoRegistry::new(),
                txns: TxnTable::new(),
            }),
        });
        (client, server)
    }

    pub fn info(&self) -> DeviceInfo {
        self.info
    }

    pub fn block_op_size(&self) -> usize {
        self.block_op_size
    }

    pub fn attach_vmo(&self, vmo: Arc<Vmo>) -> Result<RegionId, Error> {
        self.inner.lock().unwrap().registry.attach(vmo)
    }

    pub fn allocate_txn(&self) -> Result<TxnId, Error> {
        let responses = Arc::clone(&self.fifo);
        self.inner.lock().unwrap().txns.allocate(&responses)
    }

    pub fn free_txn(&self, txn_id: TxnId) {
        self.inner.lock().unwrap().txns.free(txn_id);
    }

    /// Idempotent. The serving worker observes the signal on its next wait
    /// and returns; in-flight lower operations drain through their shared
    /// slot references.
    pub fn shutdown(&self) {
        self.fifo.signal_terminate();
    }

    /// Run the pipeline until the peer closes or the terminate signal fires.
    pub fn serve(&self) -> Status {
        let mut requests = [BlockFifoRequest::default(); FIFO_MAX_DEPTH];
        loop {
            let count = match self.fifo.read_batch(&mut requests) {
                Ok(count) => count,
                Err(fifo::Error::PeerClosed) => return Status::PeerClosed,
                Err(fifo::Error::ShouldWait) => unreachable!("read_batch blocks when empty"),
            };
            for request in &requests[..count] {
                self.process_request(request);
            }
        }
    }

    fn process_request(&self, request: &BlockFifoRequest) {
        let wants_reply = request.flags().contains(RequestFlags::TXN_END);
        let txn_id = request.txn_id;

        let mut inner = self.inner.lock().unwrap();

        let iobuf = match inner.registry.find(request.region_id) {
            Some(iobuf) => iobuf,
            None => {
                drop(inner);
                trace!("request names unattached region {}", request.region_id);
                if wants_reply {
                    respond(&self.fifo, Status::InvalidArgs, txn_id);
                }
                return;
            }
        };
        let slot = match inner.txns.get(txn_id) {
            Some(slot) => slot,
            None => {
                drop(inner);
                trace!("request names unallocated txn {}", txn_id);
                if wants_reply {
                    respond(&self.fifo, Status::InvalidArgs, txn_id);
                }
                return;
            }
        };

        match request.opcode() {
            Ok(opcode @ (Opcode::Read | Opcode::Write)) => {
                self.queue_rw(request, opcode, iobuf, &slot, wants_reply);
            }
            Ok(Opcode::CloseVmo) => {
                inner.registry.detach(request.region_id);
                drop(inner);
                if wants_reply {
                    respond(&self.fifo, Status::Ok, txn_id);
                }
            }
            Ok(Opcode::Sync) => {
                drop(inner);
                warn!("block server: SYNC is not supported");
                if wants_reply {
                    respond(&self.fifo, Status::NotSupported, txn_id);
                }
            }
            Err(e) => {
                drop(inner);
                warn!("unrecognized block server operation: {}", e);
            }
        }
    }

    fn reject(&self, wants_reply: bool, txn_id: TxnId, status: Status) {
        if wants_reply {
            respond(&self.fifo, status, txn_id);
        }
    }

    /// Validation is all-or-nothing: nothing reaches the lower driver unless
    /// the whole request checks out.
    fn queue_rw(
        &self,
        request: &BlockFifoRequest,
        opcode: Opcode,
        iobuf: Arc<IoBuffer>,
        slot: &Arc<TxnSlot>,
        wants_reply: bool,
    ) {
        let txn_id = request.txn_id;

        if request.length > u64::from(u32::MAX) {
            self.reject(wants_reply, txn_id, Status::InvalidArgs);
            return;
        }

        // byte values must be block multiples, and the transfer must fit the
        // 16-bit blocks-minus-one field of the lower operation record
        let bsize = u64::from(self.info.block_size);
        let bmask = bsize - 1;
        let blocks = request.length / bsize;
        if request.length & bmask != 0
            || request.dev_offset & bmask != 0
            || request.vmo_offset & bmask != 0
            || blocks < 1
            || blocks > MAX_REQUEST_BLOCKS
        {
            self.reject(wants_reply, txn_id, Status::InvalidArgs);
            return;
        }

        let msg = match slot.enqueue(wants_reply, Arc::clone(&iobuf), opcode) {
            Ok(msg) => msg,
            // enqueue already emitted the out-of-band error if one was due
            Err(_) => return,
        };

        if let Err(status) = iobuf.validate(request.length, request.vmo_offset) {
            BlockMsg::complete(msg, status);
            return;
        }

        let command = match msg.opcode() {
            Opcode::Read => BlockCommand::Read,
            _ => BlockCommand::Write,
        };

        let max_xfer = u64::from(self.info.max_transfer_size);
        if max_xfer != 0 && max_xfer < request.length {
            let sub_txns = (request.length + max_xfer - 1) / max_xfer;
            msg.set_sub_txns(sub_txns as u32);
            let mut len_remaining = request.length;
            let mut vmo_offset = request.vmo_offset;
            let mut dev_offset = request.dev_offset;
            for i in 0..sub_txns {
                let length = len_remaining.min(max_xfer);
                len_remaining -= length;

                let mut flags = msg.flags();
                // only the first issued operation keeps SYNC_BEFORE, only the
                // last keeps SYNC_AFTER
                if i != 0 {
                    flags.remove(interface::IoFlags::SYNC_BEFORE);
                }
                if i != sub_txns - 1 {
                    flags.remove(interface::IoFlags::SYNC_AFTER);
                }

                self.lower.queue_rw(
                    command,
                    flags,
                    msg.iobuf().vmo(),
                    length,
                    vmo_offset,
                    dev_offset,
                    self.info.block_size,
                    completion_for(&msg),
                );
                vmo_offset += length;
                dev_offset += length;
            }
            debug_assert_eq!(len_remaining, 0);
        } else {
            self.lower.queue_rw(
                command,
                msg.flags(),
                msg.iobuf().vmo(),
                request.length,
                request.vmo_offset,
                request.dev_offset,
                self.info.block_size,
                completion_for(&msg),
            );
        }
    }
}

fn completion_for(msg: &Arc<BlockMsg>) -> OpCompletion {
    let msg = Arc::clone(msg);
    Box::new(move |status| BlockMsg::complete(msg, status))
}
