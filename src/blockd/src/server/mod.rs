//! The block server: session state, transaction accounting, and the serving
//! worker.

use interface::{BlockFifoRequest, BlockFifoResponse, Status};
use thiserror::Error;

mod engine;
mod registry;
mod txn;

pub use engine::BlockServer;

/// Fifo ends specialized to the block wire records.
pub type ClientFifo = fifo::ClientEnd<BlockFifoRequest, BlockFifoResponse>;
pub(crate) type ServerFifo = fifo::ServerEnd<BlockFifoRequest, BlockFifoResponse>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("region ids exhausted")]
    NoRegionIds,
    #[error("transaction slots exhausted")]
    NoTxnSlots,
    #[error("transaction is already flagged for a response")]
    AlreadyFlagged,
}

impl Error {
    pub fn status(&self) -> Status {
        match self {
            Error::NoRegionIds | Error::NoTxnSlots => Status::NoResources,
            Error::AlreadyFlagged => Status::Io,
        }
    }
}
