//! A bounded, bidirectional channel of fixed-size records, one ring per
//! direction, with a side-band terminate signal shared by both ends.
//!
//! Reads block on the composite condition *readable OR peer-closed OR
//! terminate-signaled*; writes never block. Either end may raise the
//! terminate signal, and dropping an end wakes a peer blocked in
//! [`read_batch`](ClientEnd::read_batch).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use thiserror::Error;

mod ring;

use ring::Ring;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The destination ring is full; retry after draining.
    #[error("no space in the fifo")]
    ShouldWait,
    /// The peer end was dropped or the terminate signal was raised.
    #[error("fifo peer closed")]
    PeerClosed,
}

struct Direction<T> {
    ring: Mutex<Ring<T>>,
    readable: Condvar,
}

impl<T: Copy + Default> Direction<T> {
    fn new(depth: usize) -> Self {
        Direction {
            ring: Mutex::new(Ring::new(depth)),
            readable: Condvar::new(),
        }
    }
}

impl<T> Direction<T> {
    /// Wake every blocked reader. The ring mutex is taken (and dropped)
    /// first so a reader between its flag check and its wait cannot miss the
    /// notification.
    fn wake_all(&self) {
        drop(self.ring.lock().unwrap());
        self.readable.notify_all();
    }
}

struct Shared<Req, Resp> {
    to_server: Direction<Req>,
    to_client: Direction<Resp>,
    terminate: AtomicBool,
    client_alive: AtomicBool,
    server_alive: AtomicBool,
}

impl<Req: Copy + Default, Resp: Copy + Default> Shared<Req, Resp> {
    fn signal_terminate(&self) {
        self.terminate.store(true, Ordering::SeqCst);
        self.to_server.wake_all();
        self.to_client.wake_all();
    }

    /// Drain up to `out.len()` records; block while the ring is empty and the
    /// peer is still there. Records already in the ring are delivered even
    /// after the terminate signal is raised, matching the wait-on-empty shape
    /// of the read loop this mirrors.
    fn read_batch<T: Copy + Default>(
        &self,
        dir: &Direction<T>,
        peer_alive: &AtomicBool,
        out: &mut [T],
    ) -> Result<usize, Error> {
        let mut ring = dir.ring.lock().unwrap();
        loop {
            let count = ring.pop_into(out);
            if count > 0 {
                return Ok(count);
            }
            if self.terminate.load(Ordering::SeqCst) || !peer_alive.load(Ordering::SeqCst) {
                return Err(Error::PeerClosed);
            }
            ring = dir.readable.wait(ring).unwrap();
        }
    }

    fn write<T: Copy + Default>(
        &self,
        dir: &Direction<T>,
        peer_alive: &AtomicBool,
        record: &T,
    ) -> Result<(), Error> {
        let mut ring = dir.ring.lock().unwrap();
        if !peer_alive.load(Ordering::SeqCst) {
            return Err(Error::PeerClosed);
        }
        if !ring.push(*record) {
            return Err(Error::ShouldWait);
        }
        drop(ring);
        dir.readable.notify_one();
        Ok(())
    }
}

/// The end handed to the client: writes requests, reads responses.
pub struct ClientEnd<Req, Resp> {
    shared: Arc<Shared<Req, Resp>>,
}

/// The end retained by the server: reads requests, writes responses.
pub struct ServerEnd<Req, Resp> {
    shared: Arc<Shared<Req, Resp>>,
}

/// Create a connected pair with `depth` usable slots per direction.
pub fn channel<Req, Resp>(depth: usize) -> (ClientEnd<Req, Resp>, ServerEnd<Req, Resp>)
where
    Req: Copy + Default,
    Resp: Copy + Default,
{
    let shared = Arc::new(Shared {
        to_server: Direction::new(depth),
        to_client: Direction::new(depth),
        terminate: AtomicBool::new(false),
        client_alive: AtomicBool::new(true),
        server_alive: AtomicBool::new(true),
    });
    (
        ClientEnd {
            shared: Arc::clone(&shared),
        },
        ServerEnd { shared },
    )
}

impl<Req: Copy + Default, Resp: Copy + Default> ClientEnd<Req, Resp> {
    pub fn write(&self, record: &Req) -> Result<(), Error> {
        self.shared
            .write(&self.shared.to_server, &self.shared.server_alive, record)
    }

    pub fn read_batch(&self, out: &mut [Resp]) -> Result<usize, Error> {
        self.shared
            .read_batch(&self.shared.to_client, &self.shared.server_alive, out)
    }

    /// Read exactly one record, blocking.
    pub fn read_one(&self) -> Result<Resp, Error> {
        let mut out = [Resp::default()];
        self.read_batch(&mut out)?;
        Ok(out[0])
    }

    /// The client may also ask the server to terminate.
    pub fn signal_terminate(&self) {
        self.shared.signal_terminate();
    }
}

impl<Req: Copy + Default, Resp: Copy + Default> ServerEnd<Req, Resp> {
    pub fn read_batch(&self, out: &mut [Req]) -> Result<usize, Error> {
        self.shared
            .read_batch(&self.shared.to_server, &self.shared.client_alive, out)
    }

    pub fn write(&self, record: &Resp) -> Result<(), Error> {
        self.shared
            .write(&self.shared.to_client, &self.shared.client_alive, record)
    }

    /// Idempotent; wakes a reader blocked on either end.
    pub fn signal_terminate(&self) {
        self.shared.signal_terminate();
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.terminate.load(Ordering::SeqCst)
    }
}

impl<Req, Resp> Drop for ClientEnd<Req, Resp> {
    fn drop(&mut self) {
        self.shared.client_alive.store(false, Ordering::SeqCst);
        self.shared.to_server.wake_all();
        self.shared.to_client.wake_all();
    }
}

impl<Req, Resp> Drop for ServerEnd<Req, Resp> {
    fn drop(&mut self) {
        self.shared.server_alive.store(false, Ordering::SeqCst);
        self.shared.to_server.wake_all();
        self.shared.to_client.wake_all();
    }
}
