//! Types that cross the block-server wire: fifo records, opcodes, status
//! codes, and device geometry. Everything here is fixed-size and `Copy` so it
//! can travel through the fixed-record fifo unchanged.

use std::convert::TryFrom;
use std::mem;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use thiserror::Error;

/// Depth of the request/response fifo, in records.
pub const FIFO_MAX_DEPTH: usize = 256;

/// Number of transaction slots a session exposes. Txn ids are dense in
/// `[0, MAX_TXN_COUNT)`.
pub const MAX_TXN_COUNT: usize = 16;

/// Number of sub-messages a single transaction accumulates before a response
/// is forced.
pub const MAX_TXN_MESSAGES: u32 = 16;

/// Byte length of a partition GUID.
pub const GUID_LEN: usize = 16;

/// Byte length of the raw UTF-16LE partition name field.
pub const NAME_LEN: usize = 72;

pub type TxnId = u8;
pub type RegionId = u16;

/// `0` never names an attached region.
pub const REGION_ID_INVALID: RegionId = 0;

#[derive(Debug, Error, Serialize, Deserialize)]
pub enum Error {
    #[error("unrecognized opcode in op field {0:#x}")]
    InvalidOpcode(u32),
    #[error("unknown status code {0}")]
    InvalidStatus(i32),
}

/// Status codes carried in response records and surfaced by the device
/// request surface.
#[repr(i32)]
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[error("ok")]
    Ok = 0,
    #[error("internal error")]
    Internal = -1,
    #[error("not supported")]
    NotSupported = -2,
    #[error("no memory")]
    NoMemory = -4,
    #[error("no resources")]
    NoResources = -5,
    #[error("invalid args")]
    InvalidArgs = -10,
    #[error("out of range")]
    OutOfRange = -12,
    #[error("bad state")]
    BadState = -20,
    #[error("should wait")]
    ShouldWait = -21,
    #[error("canceled")]
    Canceled = -23,
    #[error("peer closed")]
    PeerClosed = -24,
    #[error("already bound")]
    AlreadyBound = -26,
    #[error("i/o error")]
    Io = -40,
}

impl Status {
    #[inline]
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    pub fn from_raw(raw: i32) -> Result<Status, Error> {
        let status = match raw {
            0 => Status::Ok,
            -1 => Status::Internal,
            -2 => Status::NotSupported,
            -4 => Status::NoMemory,
            -5 => Status::NoResources,
            -10 => Status::InvalidArgs,
            -12 => Status::OutOfRange,
            -20 => Status::BadState,
            -21 => Status::ShouldWait,
            -23 => Status::Canceled,
            -24 => Status::PeerClosed,
            -26 => Status::AlreadyBound,
            -40 => Status::Io,
            other => return Err(Error::InvalidStatus(other)),
        };
        Ok(status)
    }
}

impl From<Status> for i32 {
    fn from(status: Status) -> i32 {
        status as i32
    }
}

/// Low bits of the request `op` field carry the opcode.
pub const OP_MASK: u32 = 0x0000_00ff;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opcode {
    Read = 0x01,
    Write = 0x02,
    Sync = 0x03,
    CloseVmo = 0x04,
}

impl TryFrom<u32> for Opcode {
    type Error = Error;

    fn try_from(raw: u32) -> Result<Opcode, Error> {
        match raw & OP_MASK {
            0x01 => Ok(Opcode::Read),
            0x02 => Ok(Opcode::Write),
            0x03 => Ok(Opcode::Sync),
            0x04 => Ok(Opcode::CloseVmo),
            _ => Err(Error::InvalidOpcode(raw)),
        }
    }
}

bitflags! {
    /// High bits of the request `op` field.
    #[derive(Serialize, Deserialize)]
    #[derive(Default)]
    pub struct RequestFlags: u32 {
        /// Ask the server to emit a response once this request and all of its
        /// predecessors in the same transaction have completed.
        const TXN_END = 1 << 31;
    }
}

bitflags! {
    /// Ordering hints forwarded to the lower driver.
    #[derive(Serialize, Deserialize)]
    #[derive(Default)]
    pub struct IoFlags: u32 {
        const SYNC_BEFORE = 1 << 0;
        const SYNC_AFTER = 1 << 1;
    }
}

bitflags! {
    #[derive(Serialize, Deserialize)]
    #[derive(Default)]
    pub struct DeviceFlags: u32 {
        const READONLY = 1 << 0;
        const REMOVABLE = 1 << 1;
    }
}

/// Compose the `op` field of a request record.
#[inline]
pub fn encode_op(opcode: Opcode, flags: RequestFlags) -> u32 {
    opcode as u32 | flags.bits()
}

/// One enqueued client request. The record layout is fixed; the fifo slot
/// size is set from it at channel creation.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BlockFifoRequest {
    pub txn_id: TxnId,
    pub reserved: u8,
    pub region_id: RegionId,
    pub op: u32,
    /// Transfer length in bytes.
    pub length: u64,
    pub vmo_offset: u64,
    pub dev_offset: u64,
}

const_assert_eq!(mem::size_of::<BlockFifoRequest>(), 32);

impl BlockFifoRequest {
    #[inline]
    pub fn opcode(&self) -> Result<Opcode, Error> {
        Opcode::try_from(self.op)
    }

    #[inline]
    pub fn flags(&self) -> RequestFlags {
        RequestFlags::from_bits_truncate(self.op)
    }
}

/// One server response. At most one is emitted per transaction round.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BlockFifoResponse {
    pub txn_id: TxnId,
    pub reserved: [u8; 3],
    /// Raw `Status` code.
    pub status: i32,
    /// Number of sub-messages acknowledged by this response.
    pub count: u32,
}

const_assert_eq!(mem::size_of::<BlockFifoResponse>(), 12);

impl BlockFifoResponse {
    #[inline]
    pub fn status(&self) -> Result<Status, Error> {
        Status::from_raw(self.status)
    }
}

/// Device geometry reported by the lower driver.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub block_size: u32,
    pub block_count: u64,
    /// Largest single transfer the lower driver accepts, in bytes.
    /// `0` means unlimited.
    pub max_transfer_size: u32,
    pub flags: DeviceFlags,
}

/// A validated partition table entry consumed by the partition remapper.
/// Both LBA bounds are inclusive.
#[derive(Debug, Clone)]
pub struct PartitionMeta {
    pub type_guid: [u8; GUID_LEN],
    pub instance_guid: [u8; GUID_LEN],
    /// Raw UTF-16LE name, NUL-padded.
    pub name: [u8; NAME_LEN],
    pub first_lba: u64,
    pub last_lba: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_roundtrip() {
        let op = encode_op(Opcode::Write, RequestFlags::TXN_END);
        let req = BlockFifoRequest {
            op,
            ..Default::default()
        };
        assert_eq!(req.opcode().unwrap(), Opcode::Write);
        assert!(req.flags().contains(RequestFlags::TXN_END));
    }

    #[test]
    fn unknown_opcode_rejected() {
        let req = BlockFifoRequest {
            op: 0x7f,
            ..Default::default()
        };
        assert!(req.opcode().is_err());
    }

    #[test]
    fn status_raw_roundtrip() {
        for status in [
            Status::Ok,
            Status::NotSupported,
            Status::InvalidArgs,
            Status::OutOfRange,
            Status::PeerClosed,
            Status::Io,
        ] {
            assert_eq!(Status::from_raw(status.into()).unwrap(), status);
        }
        assert!(Status::from_raw(12345).is_err());
    }
}
