use crate::server::Server;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, warn};

/// How long `acquire` keeps looking for a free server before giving up.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);

/// Fatal server pool conditions. Both stop the worker that hits them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("No target servers are configured; register at least one server before fuzzing")]
    NoServersConfigured,

    #[error(
        "Could not find a free server after {waited:?} ({servers} registered). If there are at \
         least as many servers as workers, servers are not being released or restarted properly"
    )]
    PoolExhausted { waited: Duration, servers: usize },
}

/// Occupancy of one registered server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupancy {
    Free,
    Reserved,
    /// Released after its process terminated; the next holder must start it again.
    Exited,
}

struct Slot {
    server: Arc<dyn Server>,
    state: Occupancy,
}

struct PoolState {
    slots: Vec<Slot>,
    /// Where the next scan starts, so reservations rotate through the pool.
    cursor: usize,
    /// Bumped by `clear` so leases from before the reset are ignored.
    generation: u64,
}

/// A bounded set of reusable target servers shared by all workers.
///
/// Built once at startup and handed to every worker behind an `Arc`. The
/// occupancy table sits behind one mutex; `acquire` sleeps on a condition
/// variable between scans instead of spinning.
pub struct ServerPool {
    state: Mutex<PoolState>,
    released: Condvar,
    acquire_timeout: Duration,
}

impl ServerPool {
    pub fn new() -> Self {
        Self::with_acquire_timeout(DEFAULT_ACQUIRE_TIMEOUT)
    }

    pub fn with_acquire_timeout(acquire_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(PoolState {
                slots: Vec::new(),
                cursor: 0,
                generation: 0,
            }),
            released: Condvar::new(),
            acquire_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Adds a server to the pool in the `Free` state.
    pub fn register(&self, server: Arc<dyn Server>) {
        debug!(server = server.id(), endpoint = server.endpoint(), "registered server");
        self.lock().slots.push(Slot {
            server,
            state: Occupancy::Free,
        });
        self.released.notify_one();
    }

    /// Removes every server. Outstanding leases become no-ops on release.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.slots.clear();
        state.cursor = 0;
        state.generation += 1;
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every server's id and occupancy, in registration order.
    pub fn occupancy(&self) -> Vec<(u32, Occupancy)> {
        self.lock()
            .slots
            .iter()
            .map(|slot| (slot.server.id(), slot.state))
            .collect()
    }

    /// Reserves a server that is not held by anyone else.
    ///
    /// Scans round-robin from a rotating cursor and waits for releases until
    /// the acquire timeout runs out.
    pub fn acquire(&self) -> Result<Lease<'_>, PoolError> {
        let started = Instant::now();
        let mut state = self.lock();
        if state.slots.is_empty() {
            return Err(PoolError::NoServersConfigured);
        }

        loop {
            let count = state.slots.len();
            if count == 0 {
                return Err(PoolError::NoServersConfigured);
            }
            let cursor = state.cursor;
            let found = (0..count)
                .map(|offset| (cursor + offset) % count)
                .find(|&index| state.slots[index].state != Occupancy::Reserved);

            if let Some(index) = found {
                let slot = &mut state.slots[index];
                if slot.state == Occupancy::Exited {
                    debug!(server = slot.server.id(), "reserving server that needs a restart");
                }
                slot.state = Occupancy::Reserved;
                let server = Arc::clone(&slot.server);
                state.cursor = (index + 1) % count;
                return Ok(Lease {
                    pool: self,
                    slot: index,
                    generation: state.generation,
                    server,
                    released: false,
                });
            }

            let waited = started.elapsed();
            if waited >= self.acquire_timeout {
                error!(servers = count, ?waited, "server pool exhausted");
                return Err(PoolError::PoolExhausted {
                    waited,
                    servers: count,
                });
            }
            state = self
                .released
                .wait_timeout(state, self.acquire_timeout - waited)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|p| p.into_inner().0);
        }
    }

    /// Returns a reserved server to the pool.
    pub fn release(&self, lease: Lease<'_>) {
        lease.release();
    }

    fn release_slot(&self, slot: usize, generation: u64, server: &Arc<dyn Server>) {
        let next = if server.exited() {
            Occupancy::Exited
        } else {
            Occupancy::Free
        };
        let mut state = self.lock();
        if state.generation != generation {
            debug!(server = server.id(), "ignoring release into a cleared pool");
            return;
        }
        match state.slots.get_mut(slot) {
            Some(entry) if entry.state == Occupancy::Reserved => entry.state = next,
            Some(entry) => {
                warn!(server = entry.server.id(), state = ?entry.state, "released a server that was not reserved");
                return;
            }
            None => return,
        }
        drop(state);
        self.released.notify_one();
    }
}

impl Default for ServerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ServerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerPool")
            .field("occupancy", &self.occupancy())
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

/// A reservation on one server.
///
/// Releasing happens exactly once: explicitly through [`Lease::release`] or
/// [`ServerPool::release`], or implicitly when the lease is dropped.
pub struct Lease<'a> {
    pool: &'a ServerPool,
    slot: usize,
    generation: u64,
    server: Arc<dyn Server>,
    released: bool,
}

impl Lease<'_> {
    pub fn server(&self) -> &Arc<dyn Server> {
        &self.server
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.pool
                .release_slot(self.slot, self.generation, &self.server);
        }
    }
}

impl fmt::Debug for Lease<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("server", &self.server.id())
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.release_once();
    }
}
