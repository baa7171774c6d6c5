//! An in-memory lower block driver speaking the modern operation shape.
//! Operations are executed by a dedicated worker thread, so completions reach
//! the server from outside its serving thread, like a real driver's would.

use std::io;
use std::mem;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use memmap2::MmapMut;

use interface::{DeviceFlags, DeviceInfo, Status};

use crate::driver::{BlockCommand, BlockOp, BlockQueue};

pub struct Ramdisk {
    info: DeviceInfo,
    ops: Option<Sender<BlockOp>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Ramdisk {
    pub fn new(block_size: u32, block_count: u64, max_transfer_size: u32) -> io::Result<Ramdisk> {
        let len = block_count
            .checked_mul(u64::from(block_size))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "geometry overflow"))?;
        let store = MmapMut::map_anon(len as usize)?;
        let info = DeviceInfo {
            block_size,
            block_count,
            max_transfer_size,
            flags: DeviceFlags::empty(),
        };
        let (tx, rx) = channel::unbounded();
        let worker = thread::Builder::new()
            .name("ramdisk-io".into())
            .spawn(move || worker_loop(info, store, rx))?;
        Ok(Ramdisk {
            info,
            ops: Some(tx),
            worker: Mutex::new(Some(worker)),
        })
    }
}

impl BlockQueue for Ramdisk {
    fn query(&self) -> (DeviceInfo, usize) {
        (self.info, mem::size_of::<BlockOp>())
    }

    fn queue(&self, op: BlockOp) {
        match &self.ops {
            Some(tx) => {
                if let Err(rejected) = tx.send(op) {
                    rejected.0.complete(Status::BadState);
                }
            }
            None => op.complete(Status::BadState),
        }
    }
}

impl Drop for Ramdisk {
    fn drop(&mut self) {
        // disconnect the channel; the worker drains what is queued and exits
        self.ops.take();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(info: DeviceInfo, mut store: MmapMut, ops: Receiver<BlockOp>) {
    for op in ops.iter() {
        execute(&info, &mut store, op);
    }
}

fn execute(info: &DeviceInfo, store: &mut MmapMut, op: BlockOp) {
    let bsize = u64::from(info.block_size);
    match op.command {
        BlockCommand::Flush => op.complete(Status::Ok),
        BlockCommand::Read | BlockCommand::Write => {
            let blocks = op.blocks();
            if op.offset_dev >= info.block_count || info.block_count - op.offset_dev < blocks {
                op.complete(Status::OutOfRange);
                return;
            }
            let vmo = match &op.vmo {
                Some(vmo) => Arc::clone(vmo),
                None => {
                    op.complete(Status::InvalidArgs);
                    return;
                }
            };
            let dev_off = (op.offset_dev * bsize) as usize;
            let len = (blocks * bsize) as usize;
            let vmo_off = op.offset_vmo * bsize;
            let result = match op.command {
                BlockCommand::Read => vmo.write_at(&store[dev_off..dev_off + len], vmo_off),
                BlockCommand::Write => vmo.read_at(&mut store[dev_off..dev_off + len], vmo_off),
                BlockCommand::Flush => unreachable!(),
            };
            match result {
                Ok(()) => op.complete(Status::Ok),
                Err(e) => {
                    warn!("ramdisk i/o failed: {}", e);
                    op.complete(Status::Io);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmo::Vmo;
    use interface::IoFlags;
    use std::sync::mpsc;

    fn waiter() -> (crate::driver::OpCompletion, mpsc::Receiver<Status>) {
        let (tx, rx) = mpsc::channel();
        (
            Box::new(move |status| {
                let _ = tx.send(status);
            }),
            rx,
        )
    }

    #[test]
    fn write_then_read() {
        let disk = Ramdisk::new(512, 64, 0).unwrap();
        let vmo = Arc::new(Vmo::create(1024).unwrap());
        vmo.write_at(&[0xab; 1024], 0).unwrap();

        let (done, rx) = waiter();
        disk.queue(BlockOp::rw(
            BlockCommand::Write,
            1,
            4,
            0,
            IoFlags::empty(),
            Arc::clone(&vmo),
            done,
        ));
        assert_eq!(rx.recv().unwrap(), Status::Ok);

        let readback = Arc::new(Vmo::create(1024).unwrap());
        let (done, rx) = waiter();
        disk.queue(BlockOp::rw(
            BlockCommand::Read,
            1,
            4,
            0,
            IoFlags::empty(),
            Arc::clone(&readback),
            done,
        ));
        assert_eq!(rx.recv().unwrap(), Status::Ok);

        let mut buf = [0u8; 1024];
        readback.read_at(&mut buf, 0).unwrap();
        assert_eq!(buf, [0xab; 1024]);
    }

    #[test]
    fn rejects_out_of_range() {
        let disk = Ramdisk::new(512, 8, 0).unwrap();
        let vmo = Arc::new(Vmo::create(4096).unwrap());
        let (done, rx) = waiter();
        disk.queue(BlockOp::rw(
            BlockCommand::Read,
            7,
            4,
            0,
            IoFlags::empty(),
            vmo,
            done,
        ));
        assert_eq!(rx.recv().unwrap(), Status::OutOfRange);
    }

    #[test]
    fn flush_completes_ok() {
        let disk = Ramdisk::new(512, 8, 0).unwrap();
        let (done, rx) = waiter();
        disk.queue(BlockOp::flush(done));
        assert_eq!(rx.recv().unwrap(), Status::Ok);
    }
}
