//! Change notifications for cache observers.

use deckhand_core::QueryKey;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

/// Default capacity of the store's event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEventKind {
    /// Value replaced (set, update, fetch completion or restore).
    Updated,
    /// Entry marked stale; the next observation refetches.
    Invalidated,
    /// Entry dropped from the store.
    Removed,
    /// A fetch failed; cached data is untouched.
    FetchFailed,
}

/// One change to one cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEvent {
    pub key: QueryKey,
    /// Entry version after the change.
    pub version: u64,
    pub kind: CacheEventKind,
}

/// Live subscription to cache events.
///
/// Dropping the handle unsubscribes. A subscriber that falls behind the
/// channel capacity skips the missed events; it should re-read the store
/// rather than rely on seeing every intermediate version.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<CacheEvent>,
    prefix: Option<QueryKey>,
}

impl Subscription {
    pub(crate) fn new(rx: broadcast::Receiver<CacheEvent>, prefix: Option<QueryKey>) -> Self {
        Self { rx, prefix }
    }

    /// Wait for the next matching event. `None` once the store is gone.
    pub async fn recv(&mut self) -> Option<CacheEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Cache subscription lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<CacheEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Cache subscription lagged");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    fn matches(&self, event: &CacheEvent) -> bool {
        match &self.prefix {
            Some(prefix) => event.key.starts_with(prefix),
            None => true,
        }
    }
}
