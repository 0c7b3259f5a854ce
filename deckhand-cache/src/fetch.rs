//! Fetchers and fetch tickets.

use async_trait::async_trait;
use deckhand_core::{GatewayResult, QueryKey, Remote};

/// Source of data for a cache key on miss or invalidation.
///
/// This abstracts over the remote call a query is backed by, so the store's
/// read-through observation works with any call.
#[async_trait]
pub trait QueryFetcher<T>: Send + Sync {
    /// Fetch the value for `key`.
    async fn fetch(&self, key: &QueryKey) -> GatewayResult<Remote<T>>;
}

/// Token identifying one background fetch for a key.
///
/// A ticket captures the key's fetch generation when the fetch began.
/// [`crate::CacheStore::cancel_fetches`] bumps the generation, after which the
/// ticket can no longer write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    pub(crate) key: QueryKey,
    pub(crate) generation: u64,
}

impl FetchTicket {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}
