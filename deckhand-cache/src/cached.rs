//! Cached values and freshness contracts for cache reads.
//!
//! A cache entry distinguishes "never fetched" from "fetched, but the backend
//! is not present" from "fetched data". Reads return [`CacheRead<T>`], which
//! carries the version and age of what the caller is looking at.

use chrono::Utc;
use deckhand_core::Timestamp;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Value held for one query key.
pub enum Cached<T> {
    /// Never fetched.
    Missing,
    /// Fetch attempted, backend reported itself unavailable.
    Unavailable,
    /// Fetched data. Values are immutable; writers replace the whole `Arc`.
    Ready(Arc<T>),
}

impl<T> Cached<T> {
    pub fn ready(value: T) -> Self {
        Cached::Ready(Arc::new(value))
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Cached::Missing)
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Cached::Unavailable)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Cached::Ready(_))
    }

    /// Borrow the data, if any.
    pub fn value(&self) -> Option<&T> {
        match self {
            Cached::Ready(value) => Some(value),
            _ => None,
        }
    }

    /// Shared handle to the data, if any.
    pub fn shared(&self) -> Option<Arc<T>> {
        match self {
            Cached::Ready(value) => Some(Arc::clone(value)),
            _ => None,
        }
    }
}

impl<T> Clone for Cached<T> {
    fn clone(&self) -> Self {
        match self {
            Cached::Missing => Cached::Missing,
            Cached::Unavailable => Cached::Unavailable,
            Cached::Ready(value) => Cached::Ready(Arc::clone(value)),
        }
    }
}

impl<T: PartialEq> PartialEq for Cached<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Cached::Missing, Cached::Missing) => true,
            (Cached::Unavailable, Cached::Unavailable) => true,
            (Cached::Ready(a), Cached::Ready(b)) => a == b,
            _ => false,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Cached<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cached::Missing => write!(f, "Missing"),
            Cached::Unavailable => write!(f, "Unavailable"),
            Cached::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
        }
    }
}

/// Staleness tolerance for an observation.
///
/// Invalidated entries are always refetched; `MaxAge` additionally refetches
/// entries older than the given age, and `Refetch` always goes to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Freshness {
    #[default]
    UntilInvalidated,
    MaxAge(Duration),
    Refetch,
}

impl Freshness {
    /// Whether data written at `updated_at` may be served without refetching.
    pub fn accepts(&self, updated_at: Option<Timestamp>) -> bool {
        match self {
            Freshness::UntilInvalidated => true,
            Freshness::Refetch => false,
            Freshness::MaxAge(max_age) => match updated_at {
                Some(at) => age_of(at) <= *max_age,
                None => false,
            },
        }
    }
}

/// Result of a cache observation, carrying version and staleness metadata.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    value: Cached<T>,
    version: u64,
    cached_at: Option<Timestamp>,
    was_cache_hit: bool,
}

impl<T> CacheRead<T> {
    /// Served from the cache without a fetch.
    pub fn from_cache(value: Cached<T>, version: u64, cached_at: Option<Timestamp>) -> Self {
        Self {
            value,
            version,
            cached_at,
            was_cache_hit: true,
        }
    }

    /// Produced by a fetch that was just written to the cache.
    pub fn from_fetch(value: Cached<T>, version: u64) -> Self {
        Self {
            value,
            version,
            cached_at: Some(Utc::now()),
            was_cache_hit: false,
        }
    }

    pub fn into_value(self) -> Cached<T> {
        self.value
    }

    pub fn value(&self) -> &Cached<T> {
        &self.value
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn cached_at(&self) -> Option<Timestamp> {
        self.cached_at
    }

    /// Time since the value was written, zero if it never was.
    pub fn staleness(&self) -> Duration {
        self.cached_at.map(age_of).unwrap_or(Duration::ZERO)
    }

    pub fn was_cache_hit(&self) -> bool {
        self.was_cache_hit
    }

    pub fn was_cache_miss(&self) -> bool {
        !self.was_cache_hit
    }
}

fn age_of(at: Timestamp) -> Duration {
    Utc::now()
        .signed_duration_since(at)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cached_states() {
        let missing: Cached<u32> = Cached::Missing;
        assert!(missing.is_missing());
        assert_eq!(missing.value(), None);

        let ready = Cached::ready(7u32);
        assert!(ready.is_ready());
        assert_eq!(ready.value(), Some(&7));
        assert_eq!(ready.clone(), ready);
        assert_ne!(ready, Cached::Unavailable);
    }

    #[test]
    fn test_freshness_default_trusts_cache() {
        assert!(Freshness::default().accepts(None));
        assert!(!Freshness::Refetch.accepts(Some(Utc::now())));
    }

    #[test]
    fn test_freshness_max_age() {
        let max_age = Freshness::MaxAge(Duration::from_secs(60));
        assert!(max_age.accepts(Some(Utc::now())));
        assert!(!max_age.accepts(Some(Utc::now() - chrono::Duration::seconds(120))));
        assert!(!max_age.accepts(None));
    }

    #[test]
    fn test_cache_read_staleness() {
        let past = Utc::now() - chrono::Duration::seconds(5);
        let read = CacheRead::from_cache(Cached::ready("x"), 3, Some(past));
        assert!(read.was_cache_hit());
        assert_eq!(read.version(), 3);
        let staleness = read.staleness();
        assert!(staleness >= Duration::from_secs(4));
        assert!(staleness <= Duration::from_secs(10));
    }

    #[test]
    fn test_cache_read_from_fetch() {
        let read = CacheRead::from_fetch(Cached::ready(42i32), 1);
        assert!(read.was_cache_miss());
        assert_eq!(read.into_value().value(), Some(&42));
    }
}
