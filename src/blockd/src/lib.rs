//! A block-device I/O server. Clients share memory regions with the server,
//! enqueue multi-stage read/write transactions over a fixed-record fifo, and
//! receive one response per transaction once every sub-operation has been
//! acknowledged by the lower driver.

#[macro_use]
extern crate log;

pub mod config;
pub mod device;
pub mod driver;
pub mod partition;
pub mod ramdisk;
pub mod server;
pub mod vmo;
