//! The hosting block device: session lifecycle plus the request surface that
//! clients use to wire a session up. Requests arrive as a tagged enum and are
//! marshalled once at this boundary.

use std::io;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use thiserror::Error;

use interface::{DeviceInfo, PartitionMeta, RegionId, Status, TxnId, GUID_LEN};

use crate::driver::{BlockOp, Iotxn, Lower};
use crate::partition::utf16_name_to_string;
use crate::server::{self, BlockServer, ClientFifo};
use crate::vmo::Vmo;

#[derive(Debug, Error)]
pub enum Error {
    #[error("a session is already bound")]
    AlreadyBound,
    #[error("no session is open")]
    BadState,
    #[error("not supported by this device")]
    NotSupported,
    #[error("could not spawn the serving worker: {0}")]
    Spawn(io::Error),
    #[error("lower device error: {0}")]
    Lower(Status),
    #[error(transparent)]
    Server(#[from] server::Error),
}

impl Error {
    pub fn status(&self) -> Status {
        match self {
            Error::AlreadyBound => Status::AlreadyBound,
            Error::BadState => Status::BadState,
            Error::NotSupported => Status::NotSupported,
            Error::Spawn(_) => Status::NoMemory,
            Error::Lower(status) => *status,
            Error::Server(e) => e.status(),
        }
    }
}

pub enum DeviceRequest {
    /// Open a session; answered with the client end of a fresh fifo.
    GetFifos,
    AttachVmo(Arc<Vmo>),
    AllocTxn,
    FreeTxn(TxnId),
    FifoClose,
    GetInfo,
    GetTypeGuid,
    GetPartitionGuid,
    GetName,
    RereadPartitionTable,
    /// Flush the lower device and wait for its acknowledgement.
    Sync,
}

pub enum DeviceResponse {
    Fifo(ClientFifo),
    RegionId(RegionId),
    TxnId(TxnId),
    Info(DeviceInfo),
    Guid([u8; GUID_LEN]),
    Name(String),
    None,
}

struct DeviceState {
    server: Option<Arc<BlockServer>>,
    /// Live serving workers; zero or one.
    thread_count: u32,
    /// Release has been called; refuse new sessions.
    dead: bool,
}

pub struct Device {
    lower: Lower,
    partition: Option<PartitionMeta>,
    state: Mutex<DeviceState>,
}

impl Device {
    pub fn new(lower: Lower) -> Arc<Device> {
        Device::with_partition(lower, None)
    }

    pub fn with_partition(lower: Lower, partition: Option<PartitionMeta>) -> Arc<Device> {
        Arc::new(Device {
            lower,
            partition,
            state: Mutex::new(DeviceState {
                server: None,
                thread_count: 0,
                dead: false,
            }),
        })
    }

    pub fn ioctl(self: &Arc<Device>, request: DeviceRequest) -> Result<DeviceResponse, Error> {
        match request {
            DeviceRequest::GetFifos => self.get_fifos(),
            DeviceRequest::AttachVmo(vmo) => {
                let state = self.state.lock().unwrap();
                let server = state.server.as_ref().ok_or(Error::BadState)?;
                let id = server.attach_vmo(vmo)?;
                Ok(DeviceResponse::RegionId(id))
            }
            DeviceRequest::AllocTxn => {
                let state = self.state.lock().unwrap();
                let server = state.server.as_ref().ok_or(Error::BadState)?;
                let txn_id = server.allocate_txn()?;
                Ok(DeviceResponse::TxnId(txn_id))
            }
            DeviceRequest::FreeTxn(txn_id) => {
                let state = self.state.lock().unwrap();
                let server = state.server.as_ref().ok_or(Error::BadState)?;
                server.free_txn(txn_id);
                Ok(DeviceResponse::None)
            }
            DeviceRequest::FifoClose => {
                let mut state = self.state.lock().unwrap();
                if let Some(server) = state.server.take() {
                    server.shutdown();
                }
                Ok(DeviceResponse::None)
            }
            DeviceRequest::GetInfo => Ok(DeviceResponse::Info(self.lower.info())),
            DeviceRequest::GetTypeGuid => {
                let meta = self.partition.as_ref().ok_or(Error::NotSupported)?;
                Ok(DeviceResponse::Guid(meta.type_guid))
            }
            DeviceRequest::GetPartitionGuid => {
                let meta = self.partition.as_ref().ok_or(Error::NotSupported)?;
                Ok(DeviceResponse::Guid(meta.instance_guid))
            }
            DeviceRequest::GetName => {
                let meta = self.partition.as_ref().ok_or(Error::NotSupported)?;
                Ok(DeviceResponse::Name(utf16_name_to_string(&meta.name)))
            }
            DeviceRequest::RereadPartitionTable => {
                // a re-read means a rebind by the hosting stack, which this
                // device cannot perform on its own
                debug!("partition table re-read requested; rebind not available");
                Err(Error::NotSupported)
            }
            DeviceRequest::Sync => self.sync(),
        }
    }

    fn get_fifos(self: &Arc<Device>) -> Result<DeviceResponse, Error> {
        let mut state = self.state.lock().unwrap();
        if state.dead {
            return Err(Error::BadState);
        }
        if state.server.is_some() {
            return Err(Error::AlreadyBound);
        }

        let (client, server) = BlockServer::create(self.lower.clone());
        state.server = Some(Arc::clone(&server));
        state.thread_count += 1;
        drop(state);

        let device = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("blockd-serve".into())
            .spawn(move || device.serve_session(server));
        if let Err(e) = spawned {
            let mut state = self.state.lock().unwrap();
            state.server = None;
            state.thread_count -= 1;
            return Err(Error::Spawn(e));
        }

        Ok(DeviceResponse::Fifo(client))
    }

    fn serve_session(&self, server: Arc<BlockServer>) {
        let status = server.serve();
        debug!("serving worker exited: {}", status);

        let mut state = self.state.lock().unwrap();
        if let Some(current) = &state.server {
            // only clear the session if nobody has replaced it yet
            if Arc::ptr_eq(current, &server) {
                state.server = None;
            }
        }
        state.thread_count -= 1;
        if state.dead && state.thread_count == 0 {
            debug!("last serving worker left a dead device");
        }
    }

    fn sync(&self) -> Result<DeviceResponse, Error> {
        let (tx, rx) = mpsc::channel();
        self.lower
            .queue_flush(Box::new(move |status| {
                let _ = tx.send(status);
            }))
            .map_err(Error::Lower)?;
        // a dropped-without-completion op surfaces as an internal error
        let status = rx.recv().unwrap_or(Status::Internal);
        if status.is_ok() {
            Ok(DeviceResponse::None)
        } else {
            Err(Error::Lower(status))
        }
    }

    /// Translate a legacy byte-oriented txn onto whatever shape the lower
    /// device speaks. Zero-length txns complete immediately.
    pub fn queue_txn(&self, txn: Iotxn) {
        let modern = match &self.lower {
            Lower::Legacy(dev) => {
                dev.queue(txn);
                return;
            }
            Lower::Modern(dev) => dev,
        };

        if txn.length == 0 {
            txn.complete(Status::Ok);
            return;
        }

        let info = self.lower.info();
        let bsize = u64::from(info.block_size);
        let bmask = bsize - 1;
        let blocks = txn.length / bsize;
        if txn.offset & bmask != 0
            || txn.length & bmask != 0
            || txn.vmo_offset & bmask != 0
            || blocks > 65536
            || txn.vmo.is_none()
        {
            txn.complete(Status::InvalidArgs);
            return;
        }

        let mut txn = txn;
        let vmo = txn.vmo.take().unwrap();
        let completion = match txn.take_completion() {
            Some(completion) => completion,
            None => Box::new(|_| {}),
        };
        let op = BlockOp::rw(
            txn.opcode,
            (blocks - 1) as u16,
            txn.offset / bsize,
            txn.vmo_offset / bsize,
            txn.flags,
            vmo,
            completion,
        );
        modern.queue(op);
    }

    /// Mark the device dead: tear down a live session and refuse new ones.
    /// Storage is reclaimed when the last holder (caller or serving worker)
    /// drops its handle.
    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(server) = state.server.take() {
            server.shutdown();
        }
        state.dead = true;
    }

    /// True while a serving worker is attached.
    pub fn has_session(&self) -> bool {
        self.state.lock().unwrap().server.is_some()
    }
}
