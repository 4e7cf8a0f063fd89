//! Cache change notifications.
//!
//! Every state change of an entry gets a monotonically increasing epoch and is
//! broadcast to subscribers, so views can re-read the keys they render.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;
use tracing::trace;

use super::keys::QueryKey;

const EVENT_BUFFER: usize = 256;

/// Position in the cache's change history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Epoch(u64);

impl Epoch {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    FetchStarted,
    Fetched,
    Failed,
    /// Out-of-band write (optimistic patch, rollback, authoritative response).
    Written,
    Invalidated,
    Removed,
    /// Dropped by the capacity bound.
    Evicted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEvent {
    pub epoch: Epoch,
    pub kind: EventKind,
    pub key: QueryKey,
}

pub(crate) struct EventBus {
    counter: AtomicU64,
    sender: broadcast::Sender<CacheEvent>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            counter: AtomicU64::new(1),
            sender,
        }
    }

    pub(crate) fn next_epoch(&self) -> Epoch {
        Epoch(self.counter.fetch_add(1, Ordering::SeqCst))
    }

    /// Stamp and broadcast a change. Having no subscribers is fine.
    pub(crate) fn publish(&self, kind: EventKind, key: &QueryKey) -> Epoch {
        let epoch = self.next_epoch();
        trace!(key = %key, epoch = epoch.value(), kind = ?kind, "Cache event");
        let _ = self.sender.send(CacheEvent {
            epoch,
            kind,
            key: key.clone(),
        });
        epoch
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.sender.subscribe()
    }
}
