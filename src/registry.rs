//! Bookkeeping for every connection the server currently has open.
//!
//! The registry never owns a socket. It records the raw descriptor of each live
//! connection so that shutdown can interrupt it; the connection's own thread
//! holds the `TcpStream` and is the only place that closes it.

use std::collections::HashMap;
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use nix::errno::Errno;
use nix::sys::socket::{shutdown, Shutdown};

/// Opaque identifier of an accepted connection. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, RawFd>>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, RawFd>> {
        // A panicking connection thread must not wedge shutdown.
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, id: ConnectionId, handle: RawFd) {
        self.lock().insert(id, handle);
    }

    pub fn remove(&self, id: ConnectionId) {
        self.lock().remove(&id);
    }

    /// Record `stream` under `id` and return a guard that removes it again on drop.
    pub fn register(self: &Arc<Self>, id: ConnectionId, stream: &TcpStream) -> Registration {
        self.insert(id, stream.as_raw_fd());
        Registration {
            id,
            registry: Arc::clone(self),
        }
    }

    /// Shut down every registered connection and forget about all of them.
    ///
    /// Shutting the socket down (rather than closing it) makes the owning thread's
    /// pending read or write fail, and that thread then closes the descriptor.
    pub fn cancel_all(&self) -> usize {
        let mut connections = self.lock();
        for (id, fd) in connections.iter() {
            match shutdown(*fd, Shutdown::Both) {
                Ok(()) | Err(Errno::ENOTCONN) => {}
                Err(e) => log::warn!("failed to cancel connection {}: {}", id, e),
            }
        }
        let cancelled = connections.len();
        connections.clear();
        cancelled
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }
}

/// Keeps a connection listed in its registry for as long as it is alive.
///
/// Must be dropped before the socket it describes is closed.
#[derive(Debug)]
pub struct Registration {
    id: ConnectionId,
    registry: Arc<ConnectionRegistry>,
}

impl Registration {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
