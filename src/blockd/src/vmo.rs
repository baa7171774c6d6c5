//! memfd-backed shared memory regions used as I/O buffers.

use std::io;
use std::os::unix::fs::FileExt;

use memfd::{Memfd, MemfdOptions};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot create memfd region: {0}")]
    Memfd(#[from] memfd::Error),
    #[error("region i/o: {0}")]
    Io(#[from] io::Error),
}

/// A client-shared memory region. The registry holds one owner; sub-messages
/// keep their own `Arc` so the backing file outlives a detach that races a
/// completion.
#[derive(Debug)]
pub struct Vmo {
    memfd: Memfd,
}

impl Vmo {
    pub fn create(size: u64) -> Result<Vmo, Error> {
        let memfd = MemfdOptions::default()
            .close_on_exec(true)
            .create("blockd-vmo")?;
        memfd.as_file().set_len(size)?;
        Ok(Vmo { memfd })
    }

    /// Current size. The owner may grow the region after attach, so callers
    /// re-query this at validation time rather than caching it.
    pub fn size(&self) -> io::Result<u64> {
        Ok(self.memfd.as_file().metadata()?.len())
    }

    pub fn set_size(&self, size: u64) -> io::Result<()> {
        self.memfd.as_file().set_len(size)
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.memfd.as_file().read_exact_at(buf, offset)
    }

    pub fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.memfd.as_file().write_all_at(buf, offset)
    }
}
