//! Bookkeeping of in-flight method calls.
//!
//! Every outbound `method` envelope gets a [`CallId`] from the registry and a
//! one-shot completion. The read loop completes it when the matching
//! `result` arrives; connection loss drains the whole table.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_channel::oneshot;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::trace;

use crate::error::MethodCallError;

/// Client-generated correlation id of a method call.
pub type CallId = String;

/// What a pending call eventually receives.
pub type CallOutcome = Result<Value, MethodCallError>;

/// Table of pending one-shot calls.
///
/// Cloning the registry yields another handle to the same table.
#[derive(Clone, Default)]
pub struct CallRegistry {
    next_id: Arc<AtomicU64>,
    pending: Arc<RwLock<HashMap<CallId, oneshot::Sender<CallOutcome>>>>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh id.
    ///
    /// Ids come from a monotonic counter, so an id is never handed out twice
    /// while it could still be pending.
    pub fn reserve(&self) -> CallId {
        (self.next_id.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    /// Registers a pending call and returns a receiver for its outcome.
    ///
    /// `id` must come from [`reserve`](Self::reserve) and not be registered yet.
    pub async fn register(&self, id: CallId) -> oneshot::Receiver<CallOutcome> {
        let (tx, rx) = oneshot::channel();
        let previous = self.pending.write().await.insert(id, tx);
        debug_assert!(previous.is_none(), "call id registered twice");
        rx
    }

    /// Completes a pending call with a result.
    ///
    /// Returns `false` if the id is not pending, e.g. for a duplicate reply
    /// or a reply to a call that already timed out.
    pub async fn resolve(&self, id: &str, value: Value) -> bool {
        self.complete(id, Ok(value)).await
    }

    /// Completes a pending call with an error. Same no-op rule as
    /// [`resolve`](Self::resolve).
    pub async fn reject(&self, id: &str, error: MethodCallError) -> bool {
        self.complete(id, Err(error)).await
    }

    async fn complete(&self, id: &str, outcome: CallOutcome) -> bool {
        // Remove under the lock, send outside it.
        let pending = self.pending.write().await.remove(id);
        match pending {
            Some(tx) => {
                // The caller may have gone away; nothing to do then.
                let _ = tx.send(outcome);
                true
            }
            None => {
                trace!("no pending call with id {}", id);
                false
            }
        }
    }

    /// Rejects every pending call with `error` and clears the table.
    ///
    /// Returns how many calls were rejected.
    pub async fn drain_all(&self, error: MethodCallError) -> usize {
        let drained: Vec<_> = self.pending.write().await.drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(error.clone()));
        }
        count
    }

    /// Drops a pending entry without completing it.
    pub async fn forget(&self, id: &str) -> bool {
        self.pending.write().await.remove(id).is_some()
    }

    /// Synchronous variant of [`forget`](Self::forget) for use in `Drop`.
    ///
    /// Removes the entry right away if the table is not locked, otherwise
    /// schedules the removal on the current runtime.
    pub(crate) fn forget_soon(&self, id: CallId) {
        if let Ok(mut pending) = self.pending.try_write() {
            pending.remove(&id);
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let registry = self.clone();
            handle.spawn(async move {
                registry.forget(&id).await;
            });
        }
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.pending.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.pending.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.read().await.is_empty()
    }
}

/// Removes a call from the registry if its caller gives up before the call
/// completes.
pub(crate) struct CallGuard {
    registry: CallRegistry,
    id: Option<CallId>,
}

impl CallGuard {
    pub(crate) fn new(registry: CallRegistry, id: CallId) -> Self {
        Self {
            registry,
            id: Some(id),
        }
    }

    /// The call completed through the registry; nothing left to clean up.
    pub(crate) fn disarm(mut self) {
        self.id = None;
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.registry.forget_soon(id);
        }
    }
}
