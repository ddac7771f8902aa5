//! Tracks pending acknowledgements and advances the confirmed-flush
//! frontier over out-of-order completions.
//!
//! `register` is called from the replication reader (single producer);
//! `complete` is called from publisher workers (potentially concurrently).
//! Both go through the same short critical section, preferring
//! `parking_lot::Mutex` over `std::sync::Mutex` on these hot, short-held
//! shared-state paths.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tokio::sync::watch;

pub type AckId = u64;

struct Inner {
    frontier_lsn: u64,
    last_registered_lsn: u64,
    pending: BTreeMap<AckId, u64>,
    next_id: AckId,
}

/// Shared handle; cheap to clone, all mutation goes through the mutex.
#[derive(Clone)]
pub struct AckTracker {
    inner: std::sync::Arc<Mutex<Inner>>,
    frontier_tx: watch::Sender<u64>,
}

impl AckTracker {
    /// `initial_lsn` seeds both the frontier and the "last registered"
    /// watermark: on a fresh process this is the slot's resolved start LSN.
    pub fn new(initial_lsn: u64) -> Self {
        let (frontier_tx, _rx) = watch::channel(initial_lsn);
        Self {
            inner: std::sync::Arc::new(Mutex::new(Inner {
                frontier_lsn: initial_lsn,
                last_registered_lsn: initial_lsn,
                pending: BTreeMap::new(),
                next_id: 1,
            })),
            frontier_tx,
        }
    }

    /// Subscribe to frontier advancement. The replication reader uses this
    /// to drive its feedback loop without polling.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.frontier_tx.subscribe()
    }

    pub fn frontier(&self) -> u64 {
        *self.frontier_tx.borrow()
    }

    pub fn last_registered_lsn(&self) -> u64 {
        self.inner.lock().last_registered_lsn
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Assign a dense, strictly increasing `ack_id` for this `lsn`. Does not
    /// require `lsn` to be >= any previously registered value: upstream
    /// frames are not guaranteed monotonic across reconnects.
    pub fn register(&self, lsn: u64) -> AckId {
        let mut inner = self.inner.lock();
        let ack_id = inner.next_id;
        inner.next_id += 1;
        inner.pending.insert(ack_id, lsn);
        inner.last_registered_lsn = inner.last_registered_lsn.max(lsn);
        ack_id
    }

    /// Mark `ack_id` done. Returns the new frontier if it advanced.
    ///
    /// Frontier rule: let `L` be the minimum pending LSN, or
    /// `last_registered_lsn` if nothing is pending; the frontier becomes
    /// `max(frontier, L)`.
    pub fn complete(&self, ack_id: AckId) -> Option<u64> {
        let new_frontier = {
            let mut inner = self.inner.lock();
            inner.pending.remove(&ack_id);

            let floor = inner
                .pending
                .values()
                .next()
                .copied()
                .unwrap_or(inner.last_registered_lsn);

            let candidate = inner.frontier_lsn.max(floor);
            if candidate > inner.frontier_lsn {
                inner.frontier_lsn = candidate;
                Some(candidate)
            } else {
                None
            }
        };

        if let Some(frontier) = new_frontier {
            // A send error just means no one is subscribed yet; the reader
            // will still observe the latest value via `frontier()`.
            let _ = self.frontier_tx.send(frontier);
        }
        new_frontier
    }
}
