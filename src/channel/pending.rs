//! Pending-call bookkeeping for a single channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::{Result, RpcError};
use crate::protocol::CallId;

/// Completion slot for one outstanding call.
type CallSlot = oneshot::Sender<Result<Bytes>>;

/// Helper function to lock a mutex and ignore poisoning.
///
/// If another thread panicked while holding the lock, we still want the
/// data. The maps guarded here hold completion slots and channel handles;
/// continuing with them after a panic elsewhere is safe, losing them would
/// strand callers forever.
pub(crate) fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

enum TableState {
    Open(HashMap<CallId, CallSlot>),
    Closed,
}

/// Call-correlation table, one per channel.
///
/// Entries are inserted and removed under the lock exactly once; completion
/// slots are fired only after the lock is released. A closed table refuses
/// new registrations, so a call racing against teardown either lands in the
/// map before the drain and is failed by it, or observes `Closed` and never
/// becomes pending at all.
pub(crate) struct CallTable {
    next_id: AtomicU64,
    state: Mutex<TableState>,
}

impl CallTable {
    pub(crate) fn new() -> Self {
        // ---
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(TableState::Open(HashMap::new())),
        }
    }

    /// Allocate a fresh call id and register its completion slot.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::ChannelClosed`] once the table has been closed.
    pub(crate) fn register(&self) -> Result<(CallId, oneshot::Receiver<Result<Bytes>>)> {
        // ---
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        match *lock_ignore_poison(&self.state) {
            TableState::Open(ref mut calls) => {
                calls.insert(id, tx);
                Ok((id, rx))
            }
            TableState::Closed => Err(RpcError::ChannelClosed),
        }
    }

    /// Complete the call `id` with `result`.
    ///
    /// Returns `false` when no such call is pending, which covers dangling
    /// responses as well as duplicate completions for the same id.
    pub(crate) fn complete(&self, id: CallId, result: Result<Bytes>) -> bool {
        // ---
        let slot = match *lock_ignore_poison(&self.state) {
            TableState::Open(ref mut calls) => calls.remove(&id),
            TableState::Closed => None,
        };
        match slot {
            Some(tx) => {
                // The receiver may have given up already (timeout); that is
                // not this table's concern.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Drop a registered call without firing its slot.
    pub(crate) fn discard(&self, id: CallId) -> bool {
        // ---
        match *lock_ignore_poison(&self.state) {
            TableState::Open(ref mut calls) => calls.remove(&id).is_some(),
            TableState::Closed => false,
        }
    }

    /// Close the table and fail every outstanding call with
    /// [`RpcError::ChannelClosed`]. Returns how many calls were drained.
    pub(crate) fn close(&self) -> usize {
        // ---
        let drained = {
            let mut state = lock_ignore_poison(&self.state);
            match std::mem::replace(&mut *state, TableState::Closed) {
                TableState::Open(calls) => calls,
                TableState::Closed => HashMap::new(),
            }
        };

        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(RpcError::ChannelClosed));
        }
        count
    }

    /// Number of calls currently awaiting a response.
    pub(crate) fn len(&self) -> usize {
        // ---
        match *lock_ignore_poison(&self.state) {
            TableState::Open(ref calls) => calls.len(),
            TableState::Closed => 0,
        }
    }
}
