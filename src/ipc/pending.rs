//! Bookkeeping for requests that have been written but not yet answered.
//!
//! The table is shared between the callers issuing requests and the reader
//! task routing responses. Every entry leaves the table exactly once: by
//! [`PendingTable::resolve`], by [`PendingTable::remove`] (timeout or a
//! dropped caller), or by [`PendingTable::close_all`]. Whichever of these
//! takes the entry out first owns its outcome; the others become no-ops.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::ipc::error::IpcError;

/// Result delivered to the caller waiting on a request.
pub type Outcome = Result<Value, IpcError>;

/// One outstanding request.
#[derive(Debug)]
struct PendingRequest {
    method: String,
    deadline: Instant,
    slot: oneshot::Sender<Outcome>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<u64, PendingRequest>,
    /// Set once the connection is gone; refuses further registrations.
    closed: bool,
}

/// Pending requests of one connection, keyed by request id.
#[derive(Debug, Default)]
pub struct PendingTable {
    inner: Mutex<Inner>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a request and hand back the receiving end of its slot.
    ///
    /// # Errors
    ///
    /// Returns `IpcError::ConnectionClosed` once the table has been closed,
    /// and `IpcError::Protocol` if `id` is already outstanding.
    pub fn register(
        &self,
        id: u64,
        method: &str,
        deadline: Instant,
    ) -> Result<oneshot::Receiver<Outcome>, IpcError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(IpcError::ConnectionClosed);
        }
        if inner.entries.contains_key(&id) {
            return Err(IpcError::Protocol(format!("Request id {} already in use", id)));
        }

        let (tx, rx) = oneshot::channel();
        inner.entries.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                deadline,
                slot: tx,
            },
        );
        Ok(rx)
    }

    /// Deliver an outcome to the request with this id.
    ///
    /// Returns `false` if no such request is outstanding (already answered,
    /// timed out, or never issued).
    pub fn resolve(&self, id: u64, outcome: Outcome) -> bool {
        let Some(request) = self.lock().entries.remove(&id) else {
            return false;
        };

        if Instant::now() > request.deadline {
            tracing::debug!(
                id,
                method = %request.method,
                "Response arrived after deadline but before the caller gave up"
            );
        }

        // The caller may have stopped listening; that is not our concern.
        let _ = request.slot.send(outcome);
        true
    }

    /// Drop the request with this id without delivering anything.
    ///
    /// Returns `true` if the entry was still outstanding.
    pub fn remove(&self, id: u64) -> bool {
        self.lock().entries.remove(&id).is_some()
    }

    /// Close the table and fail every outstanding request.
    ///
    /// Returns how many requests were failed. Later calls return 0.
    pub fn close_all(&self) -> usize {
        let drained: Vec<(u64, PendingRequest)> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.entries.drain().collect()
        };

        let count = drained.len();
        for (id, request) in drained {
            tracing::debug!(
                id,
                method = %request.method,
                "Failing pending request: connection closed"
            );
            let _ = request.slot.send(Err(IpcError::ConnectionClosed));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Ids of outstanding requests, sorted.
    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.lock().entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// Removes its request from the table when dropped.
///
/// Held by the caller for as long as it waits, so a caller that is
/// cancelled mid-wait does not leave its entry behind.
pub struct PendingGuard<'a> {
    table: &'a PendingTable,
    id: u64,
}

impl<'a> PendingGuard<'a> {
    pub fn new(table: &'a PendingTable, id: u64) -> Self {
        Self { table, id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the entry now. Returns `true` if it was still outstanding.
    pub fn cancel(&self) -> bool {
        self.table.remove(self.id)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}
