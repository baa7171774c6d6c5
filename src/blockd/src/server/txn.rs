//! Transaction slots: per-slot sub-message accounting and response emission.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use interface::{
    BlockFifoResponse, IoFlags, Opcode, Status, TxnId, MAX_TXN_COUNT, MAX_TXN_MESSAGES,
};

use super::registry::IoBuffer;
use super::{Error, ServerFifo};

/// One physical I/O belonging to a transaction. It holds the slot and region
/// alive until every lower-layer completion for it has fired, which makes
/// `FREE_TXN` and `CLOSE_VMO` safe to race against in-flight work.
pub(crate) struct BlockMsg {
    slot: Arc<TxnSlot>,
    iobuf: Arc<IoBuffer>,
    opcode: Opcode,
    flags: IoFlags,
    /// Remaining lower-layer completions; above one only when the request was
    /// split by the device's max transfer size. Only touched under the slot
    /// lock.
    sub_txns: AtomicU32,
}

impl BlockMsg {
    pub(crate) fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub(crate) fn flags(&self) -> IoFlags {
        self.flags
    }

    pub(crate) fn iobuf(&self) -> &Arc<IoBuffer> {
        &self.iobuf
    }

    pub(crate) fn set_sub_txns(&self, count: u32) {
        self.sub_txns.store(count, Ordering::Relaxed);
    }

    /// Route one lower completion into the owning slot. Dropping the `Arc`
    /// afterwards releases the sub-message's slot and region references.
    pub(crate) fn complete(msg: Arc<BlockMsg>, status: Status) {
        let slot = Arc::clone(&msg.slot);
        slot.complete(&msg, status);
    }
}

struct SlotState {
    /// Sticky first-error status for the pending response.
    status: Status,
    /// Sub-messages whose completions have arrived.
    count: u32,
    /// Sub-messages enqueued so far.
    ctr: u32,
    respond_requested: bool,
}

pub(crate) struct TxnSlot {
    txn_id: TxnId,
    responses: Arc<ServerFifo>,
    state: Mutex<SlotState>,
}

impl TxnSlot {
    fn new(txn_id: TxnId, responses: Arc<ServerFifo>) -> TxnSlot {
        TxnSlot {
            txn_id,
            responses,
            state: Mutex::new(SlotState {
                status: Status::Ok,
                count: 0,
                ctr: 0,
                respond_requested: false,
            }),
        }
    }

    /// Add a sub-message to the slot. The first sub-message of a round gets
    /// `SYNC_BEFORE`; the one that requests the response gets `SYNC_AFTER`.
    /// Once a response has been requested, further enqueues fail, emitting an
    /// out-of-band error if the rejected request itself asked to respond.
    pub(crate) fn enqueue(
        self: &Arc<TxnSlot>,
        do_respond: bool,
        iobuf: Arc<IoBuffer>,
        opcode: Opcode,
    ) -> Result<Arc<BlockMsg>, Error> {
        let mut do_respond = do_respond;
        let mut state = self.state.lock().unwrap();
        if state.respond_requested {
            // can't get more than one response per transaction round
            drop(state);
            if do_respond {
                respond(&self.responses, Status::Io, self.txn_id);
            }
            return Err(Error::AlreadyFlagged);
        }
        if state.ctr == MAX_TXN_MESSAGES - 1 {
            // the slot is about to fill; append the response request whether
            // or not the client provided one, so the round can ever close
            do_respond = true;
        }
        debug_assert!(state.ctr < MAX_TXN_MESSAGES);
        let mut flags = IoFlags::empty();
        if state.ctr == 0 {
            flags |= IoFlags::SYNC_BEFORE;
        }
        if do_respond {
            flags |= IoFlags::SYNC_AFTER;
        }
        state.ctr += 1;
        if do_respond {
            state.respond_requested = true;
        }
        Ok(Arc::new(BlockMsg {
            slot: Arc::clone(self),
            iobuf,
            opcode,
            flags,
            sub_txns: AtomicU32::new(1),
        }))
    }

    fn complete(&self, msg: &BlockMsg, status: Status) {
        let mut state = self.state.lock().unwrap();
        if !status.is_ok() && state.status.is_ok() {
            state.status = status;
        }

        debug_assert!(msg.sub_txns.load(Ordering::Relaxed) > 0);
        if msg.sub_txns.fetch_sub(1, Ordering::AcqRel) > 1 {
            // more pending sub-txns before this sub-message is done
            return;
        }

        state.count += 1;
        debug_assert!(state.ctr != 0);
        debug_assert!(state.count <= state.ctr);

        if state.respond_requested && state.count == state.ctr {
            let response = BlockFifoResponse {
                txn_id: self.txn_id,
                reserved: [0; 3],
                status: state.status.into(),
                count: state.count,
            };
            if let Err(e) = self.responses.write(&response) {
                warn!("block server: could not write response: {}", e);
            }
            state.count = 0;
            state.status = Status::Ok;
            state.ctr = 0;
            state.respond_requested = false;
        }
    }
}

/// Emit an out-of-band response record (`count == 0`).
pub(crate) fn respond(fifo: &ServerFifo, status: Status, txn_id: TxnId) {
    let response = BlockFifoResponse {
        txn_id,
        reserved: [0; 3],
        status: status.into(),
        count: 0,
    };
    if let Err(e) = fifo.write(&response) {
        warn!("block server: could not write response: {}", e);
    }
}

/// Fixed-index slot table. `allocate`/`free` run under the server lock;
/// slot internals are guarded by each slot's own lock.
pub(crate) struct TxnTable {
    slots: Vec<Option<Arc<TxnSlot>>>,
}

impl TxnTable {
    pub(crate) fn new() -> TxnTable {
        TxnTable {
            slots: vec![None; MAX_TXN_COUNT],
        }
    }

    pub(crate) fn allocate(&mut self, responses: &Arc<ServerFifo>) -> Result<TxnId, Error> {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                let txn_id = index as TxnId;
                *slot = Some(Arc::new(TxnSlot::new(txn_id, Arc::clone(responses))));
                return Ok(txn_id);
            }
        }
        Err(Error::NoTxnSlots)
    }

    /// Idempotent; outstanding sub-messages keep the slot object itself alive
    /// until their completions drop it.
    pub(crate) fn free(&mut self, txn_id: TxnId) {
        if let Some(slot) = self.slots.get_mut(usize::from(txn_id)) {
            *slot = None;
        }
    }

    pub(crate) fn get(&self, txn_id: TxnId) -> Option<Arc<TxnSlot>> {
        self.slots.get(usize::from(txn_id)).and_then(|s| s.clone())
    }
}
