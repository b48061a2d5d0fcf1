//! Bookkeeping of live data subscriptions.
//!
//! Structurally the same as the call registry, but completions are
//! multi-shot: each subscription owns an open stream that receives `Ready`
//! once and then any number of document events until it ends.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures_channel::mpsc;
use futures_util::{Stream, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, trace};

use super::Outbound;
use crate::{error::MethodCallError, protocol::Envelope};

/// Client-generated id of a subscription.
pub type SubscriptionId = String;

/// One delivery on a subscription stream.
pub type SubscriptionItem = Result<SubscriptionEvent, MethodCallError>;

/// Events delivered to a [`Subscription`].
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// The server has sent the initial data set.
    Ready,
    Added {
        collection: String,
        id: String,
        fields: Map<String, Value>,
    },
    Changed {
        collection: String,
        id: String,
        fields: Map<String, Value>,
        cleared: Vec<String>,
    },
    Removed {
        collection: String,
        id: String,
    },
}

struct Entry {
    name: String,
    ready: bool,
    events: mpsc::UnboundedSender<SubscriptionItem>,
}

/// Table of open subscriptions.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    next_id: Arc<AtomicU64>,
    entries: Arc<RwLock<HashMap<SubscriptionId, Entry>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&self) -> SubscriptionId {
        (self.next_id.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    /// Registers a requested subscription and returns the receiving end of
    /// its stream.
    pub async fn register(
        &self,
        id: SubscriptionId,
        name: String,
    ) -> mpsc::UnboundedReceiver<SubscriptionItem> {
        let (tx, rx) = mpsc::unbounded();
        let previous = self.entries.write().await.insert(
            id,
            Entry {
                name,
                ready: false,
                events: tx,
            },
        );
        debug_assert!(previous.is_none(), "subscription id registered twice");
        rx
    }

    /// Moves a subscription from "requested" to "active".
    ///
    /// The `Ready` event is delivered once; repeated `ready` messages for the
    /// same id are ignored. Returns `false` for unknown ids.
    pub async fn ready(&self, id: &str) -> bool {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(id) else {
            trace!("ready for unknown subscription {}", id);
            return false;
        };
        if !entry.ready {
            entry.ready = true;
            debug!("subscription {} ({}) is ready", id, entry.name);
            let _ = entry.events.unbounded_send(Ok(SubscriptionEvent::Ready));
        }
        true
    }

    pub async fn dispatch_added(&self, collection: String, id: String, fields: Map<String, Value>) {
        self.fan_out(SubscriptionEvent::Added {
            collection,
            id,
            fields,
        })
        .await;
    }

    pub async fn dispatch_changed(
        &self,
        collection: String,
        id: String,
        fields: Map<String, Value>,
        cleared: Vec<String>,
    ) {
        self.fan_out(SubscriptionEvent::Changed {
            collection,
            id,
            fields,
            cleared,
        })
        .await;
    }

    pub async fn dispatch_removed(&self, collection: String, id: String) {
        self.fan_out(SubscriptionEvent::Removed { collection, id })
            .await;
    }

    /// DDP document messages name a collection, not a subscription, so every
    /// open subscription sees them. Entries whose stream was dropped are
    /// pruned on the way.
    async fn fan_out(&self, event: SubscriptionEvent) {
        self.entries
            .write()
            .await
            .retain(|_, entry| entry.events.unbounded_send(Ok(event.clone())).is_ok());
    }

    /// Ends a subscription after a `nosub` from the server.
    ///
    /// With an error the stream yields it once before ending.
    pub async fn nosub(&self, id: &str, error: Option<MethodCallError>) -> bool {
        let Some(entry) = self.entries.write().await.remove(id) else {
            return false;
        };
        if let Some(error) = error {
            let _ = entry.events.unbounded_send(Err(error));
        }
        true
    }

    /// Removes a subscription locally, ending its stream.
    pub async fn remove(&self, id: &str) -> bool {
        self.entries.write().await.remove(id).is_some()
    }

    /// Removes an abandoned subscription from a synchronous context and asks
    /// the server to stop publishing it.
    ///
    /// Nothing is sent if the subscription had already ended.
    pub(crate) fn release(&self, id: SubscriptionId, outbound: Outbound) {
        let removed = match self.entries.try_write() {
            Ok(mut entries) => entries.remove(&id).is_some(),
            Err(_) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let registry = self.clone();
                    handle.spawn(async move {
                        if registry.remove(&id).await {
                            send_unsub(&outbound, id);
                        }
                    });
                }
                return;
            }
        };
        if removed {
            send_unsub(&outbound, id);
        }
    }

    /// Closes every open stream with `error` and clears the table.
    pub async fn drain_all(&self, error: MethodCallError) -> usize {
        let drained: Vec<_> = self.entries.write().await.drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.events.unbounded_send(Err(error.clone()));
        }
        count
    }

    /// `Some(true)` once the subscription is ready, `None` if it is not open.
    pub async fn is_ready(&self, id: &str) -> Option<bool> {
        self.entries.read().await.get(id).map(|entry| entry.ready)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

fn send_unsub(outbound: &Outbound, id: SubscriptionId) {
    debug!("subscription {} dropped, unsubscribing", id);
    // A closed write path means the connection is gone and was drained.
    let _ = outbound.send(Envelope::Unsub { id });
}

/// Unsubscribes when a [`Subscription`] is dropped while still open.
pub(crate) struct SubscriptionGuard {
    registry: SubscriptionRegistry,
    outbound: Outbound,
    id: SubscriptionId,
}

impl SubscriptionGuard {
    pub(crate) fn new(registry: SubscriptionRegistry, outbound: Outbound, id: SubscriptionId) -> Self {
        Self {
            registry,
            outbound,
            id,
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.registry
            .release(std::mem::take(&mut self.id), self.outbound.clone());
    }
}

/// A live subscription.
///
/// Yields [`SubscriptionEvent`]s until the server ends it, the caller
/// unsubscribes, or the connection drops (in which case the last item is a
/// [`MethodCallError::ConnectionLost`]). Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriptionId,
    name: String,
    events: mpsc::UnboundedReceiver<SubscriptionItem>,
    _guard: SubscriptionGuard,
}

impl Subscription {
    pub(crate) fn new(
        name: String,
        events: mpsc::UnboundedReceiver<SubscriptionItem>,
        guard: SubscriptionGuard,
    ) -> Self {
        Self {
            id: guard.id.clone(),
            name,
            events,
            _guard: guard,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Stream for Subscription {
    type Item = SubscriptionItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_next_unpin(cx)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
