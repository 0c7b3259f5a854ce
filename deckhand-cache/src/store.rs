//! Process-wide keyed, versioned cache store.
//!
//! [`CacheStore`] is a cheap clonable handle over shared state; every
//! component gets its own clone of the same store. Values are immutable
//! `Arc`s stored type-erased and recovered with a typed read. All writes are
//! whole-value replacements or synchronous read-modify-write closures run
//! under the store lock, so no `await` can interleave with an update.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use deckhand_core::{
    CacheError, DeckhandResult, GatewayError, QueryKey, Remote, Timestamp,
};
use tokio::sync::broadcast;

use crate::cached::{CacheRead, Cached, Freshness};
use crate::events::{CacheEvent, CacheEventKind, Subscription, DEFAULT_EVENT_CAPACITY};
use crate::fetch::{FetchTicket, QueryFetcher};
use crate::stats::{CacheStats, Counters};

type CacheResult<T> = Result<T, CacheError>;
type AnyValue = Arc<dyn Any + Send + Sync>;

#[derive(Clone)]
enum Slot {
    Missing,
    Unavailable,
    Ready {
        value: AnyValue,
        type_name: &'static str,
    },
}

impl Slot {
    fn from_cached<T: Send + Sync + 'static>(cached: Cached<T>) -> Self {
        match cached {
            Cached::Missing => Slot::Missing,
            Cached::Unavailable => Slot::Unavailable,
            Cached::Ready(value) => Slot::Ready {
                value: value as AnyValue,
                type_name: type_name::<T>(),
            },
        }
    }

    fn to_cached<T: Send + Sync + 'static>(&self, key: &QueryKey) -> CacheResult<Cached<T>> {
        match self {
            Slot::Missing => Ok(Cached::Missing),
            Slot::Unavailable => Ok(Cached::Unavailable),
            Slot::Ready { value, .. } => Arc::clone(value)
                .downcast::<T>()
                .map(Cached::Ready)
                .map_err(|_| CacheError::TypeMismatch {
                    key: key.clone(),
                    expected: type_name::<T>(),
                }),
        }
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Missing => write!(f, "Missing"),
            Slot::Unavailable => write!(f, "Unavailable"),
            Slot::Ready { type_name, .. } => write!(f, "Ready<{}>", type_name),
        }
    }
}

#[derive(Debug)]
struct Entry {
    slot: Slot,
    version: u64,
    updated_at: Option<Timestamp>,
    stale: bool,
    last_error: Option<GatewayError>,
    fetch_generation: u64,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            slot: Slot::Missing,
            version: 0,
            updated_at: None,
            stale: false,
            last_error: None,
            fetch_generation: 0,
        }
    }
}

impl Entry {
    fn replace(&mut self, slot: Slot) -> u64 {
        self.slot = slot;
        self.version += 1;
        self.updated_at = Some(Utc::now());
        self.version
    }

    fn meta(&self) -> EntryMeta {
        EntryMeta {
            version: self.version,
            updated_at: self.updated_at,
            stale: self.stale,
            last_error: self.last_error.clone(),
            fetch_generation: self.fetch_generation,
        }
    }
}

/// Observable metadata of one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
    /// Bumped on every value write.
    pub version: u64,
    pub updated_at: Option<Timestamp>,
    /// Set by invalidation; cleared by the next successful fetch or set.
    pub stale: bool,
    /// Error from the most recent failed fetch. Cached data is kept.
    pub last_error: Option<GatewayError>,
    pub fetch_generation: u64,
}

/// Copy of one entry's value taken before a speculative write.
///
/// Restoring a snapshot puts back the exact prior handle and state tag.
#[derive(Clone)]
pub struct EntrySnapshot {
    key: QueryKey,
    slot: Slot,
    version: u64,
}

impl EntrySnapshot {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Entry version when the snapshot was taken.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn was_missing(&self) -> bool {
        matches!(self.slot, Slot::Missing)
    }

    /// Typed view of the captured value.
    pub fn value<T: Send + Sync + 'static>(&self) -> CacheResult<Cached<T>> {
        self.slot.to_cached(&self.key)
    }
}

impl fmt::Debug for EntrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntrySnapshot")
            .field("key", &self.key)
            .field("slot", &self.slot)
            .field("version", &self.version)
            .finish()
    }
}

struct Inner {
    entries: RwLock<HashMap<QueryKey, Entry>>,
    events: broadcast::Sender<CacheEvent>,
    counters: Counters,
}

/// Shared handle to the process-wide cache.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<Inner>,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

impl CacheStore {
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Create a store whose event channel buffers `capacity` events per
    /// subscriber before lagging.
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(HashMap::new()),
                events,
                counters: Counters::default(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Typed read of the current value. Absent keys read as `Missing`.
    pub fn get<T: Send + Sync + 'static>(&self, key: &QueryKey) -> CacheResult<Cached<T>> {
        let entries = self.read()?;
        let cached = match entries.get(key) {
            Some(entry) => entry.slot.to_cached(key)?,
            None => Cached::Missing,
        };
        drop(entries);

        if cached.is_missing() {
            Counters::bump(&self.inner.counters.misses);
        } else {
            Counters::bump(&self.inner.counters.hits);
        }
        Ok(cached)
    }

    /// Metadata for `key`, if the store has an entry for it.
    pub fn meta(&self, key: &QueryKey) -> CacheResult<Option<EntryMeta>> {
        Ok(self.read()?.get(key).map(Entry::meta))
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.read()
            .map(|entries| entries.contains_key(key))
            .unwrap_or(false)
    }

    /// All keys starting with `prefix`.
    pub fn keys_with_prefix(&self, prefix: &QueryKey) -> CacheResult<Vec<QueryKey>> {
        let entries = self.read()?;
        let mut keys: Vec<QueryKey> = entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    pub fn len(&self) -> usize {
        self.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.counters.snapshot(self.len() as u64)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Replace the value for `key` with fetched data.
    pub fn set<T: Send + Sync + 'static>(&self, key: &QueryKey, value: T) -> CacheResult<u64> {
        self.set_cached(key, Cached::ready(value))
    }

    /// Record that the backend reported itself unavailable for `key`.
    pub fn set_unavailable(&self, key: &QueryKey) -> CacheResult<u64> {
        self.write_fresh(key, Slot::Unavailable)
    }

    /// Replace the value for `key` with any cached state.
    pub fn set_cached<T: Send + Sync + 'static>(
        &self,
        key: &QueryKey,
        value: Cached<T>,
    ) -> CacheResult<u64> {
        self.write_fresh(key, Slot::from_cached(value))
    }

    /// Read-modify-write of a ready value.
    ///
    /// `f` runs under the store lock. Returns the new version, or `None` when
    /// the entry holds no data (missing or unavailable) and nothing was
    /// written.
    pub fn update<T, F>(&self, key: &QueryKey, f: F) -> CacheResult<Option<u64>>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&T) -> T,
    {
        let version = {
            let mut entries = self.write()?;
            let Some(entry) = entries.get_mut(key) else {
                return Ok(None);
            };
            let Cached::Ready(current) = entry.slot.to_cached::<T>(key)? else {
                return Ok(None);
            };
            let next = f(&current);
            entry.replace(Slot::from_cached(Cached::ready(next)))
        };

        Counters::bump(&self.inner.counters.writes);
        self.emit(key, version, CacheEventKind::Updated);
        Ok(Some(version))
    }

    /// Read-modify-write over any cached state, including `Missing`.
    pub fn modify<T, F>(&self, key: &QueryKey, f: F) -> CacheResult<u64>
    where
        T: Send + Sync + 'static,
        F: FnOnce(Cached<T>) -> Cached<T>,
    {
        let version = {
            let mut entries = self.write()?;
            let entry = entries.entry(key.clone()).or_default();
            let current = entry.slot.to_cached::<T>(key)?;
            entry.replace(Slot::from_cached(f(current)))
        };

        Counters::bump(&self.inner.counters.writes);
        self.emit(key, version, CacheEventKind::Updated);
        Ok(version)
    }

    /// Mark `key` stale so the next observation refetches. Data is kept.
    ///
    /// Returns `false` when the store has no entry for `key`.
    pub fn invalidate(&self, key: &QueryKey) -> CacheResult<bool> {
        let version = {
            let mut entries = self.write()?;
            match entries.get_mut(key) {
                Some(entry) => {
                    entry.stale = true;
                    entry.version
                }
                None => return Ok(false),
            }
        };

        Counters::bump(&self.inner.counters.invalidations);
        self.emit(key, version, CacheEventKind::Invalidated);
        Ok(true)
    }

    /// Mark every key under `prefix` stale. Returns how many were marked.
    pub fn invalidate_prefix(&self, prefix: &QueryKey) -> CacheResult<usize> {
        let marked: Vec<(QueryKey, u64)> = {
            let mut entries = self.write()?;
            entries
                .iter_mut()
                .filter(|(key, _)| key.starts_with(prefix))
                .map(|(key, entry)| {
                    entry.stale = true;
                    (key.clone(), entry.version)
                })
                .collect()
        };

        Counters::add(&self.inner.counters.invalidations, marked.len() as u64);
        for (key, version) in &marked {
            self.emit(key, *version, CacheEventKind::Invalidated);
        }
        Ok(marked.len())
    }

    /// Drop the entry for `key`.
    pub fn remove(&self, key: &QueryKey) -> CacheResult<bool> {
        let removed = self.write()?.remove(key);
        match removed {
            Some(entry) => {
                self.emit(key, entry.version, CacheEventKind::Removed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop every entry whose key `keep` rejects. Returns how many were dropped.
    pub fn retain_observed<F>(&self, mut keep: F) -> CacheResult<usize>
    where
        F: FnMut(&QueryKey) -> bool,
    {
        let removed: Vec<(QueryKey, u64)> = {
            let mut entries = self.write()?;
            let doomed: Vec<QueryKey> = entries.keys().filter(|&key| !keep(key)).cloned().collect();
            doomed
                .into_iter()
                .filter_map(|key| entries.remove(&key).map(|entry| (key, entry.version)))
                .collect()
        };

        for (key, version) in &removed {
            self.emit(key, *version, CacheEventKind::Removed);
        }
        Ok(removed.len())
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Capture the current value of `key`.
    pub fn snapshot(&self, key: &QueryKey) -> CacheResult<EntrySnapshot> {
        let entries = self.read()?;
        let (slot, version) = match entries.get(key) {
            Some(entry) => (entry.slot.clone(), entry.version),
            None => (Slot::Missing, 0),
        };
        Ok(EntrySnapshot {
            key: key.clone(),
            slot,
            version,
        })
    }

    /// Put a snapshot's value back. Stale and error state are left as they are.
    ///
    /// A snapshot of a missing value drops the entry instead, and returns
    /// `None`.
    pub fn restore(&self, snapshot: EntrySnapshot) -> CacheResult<Option<u64>> {
        let EntrySnapshot { key, slot, .. } = snapshot;
        if matches!(slot, Slot::Missing) {
            self.remove(&key)?;
            return Ok(None);
        }
        let version = {
            let mut entries = self.write()?;
            entries.entry(key.clone()).or_default().replace(slot)
        };

        Counters::bump(&self.inner.counters.writes);
        self.emit(&key, version, CacheEventKind::Updated);
        Ok(Some(version))
    }

    // ------------------------------------------------------------------
    // Fetch tickets
    // ------------------------------------------------------------------

    /// Start a background fetch for `key`. Creates the entry if needed.
    pub fn begin_fetch(&self, key: &QueryKey) -> CacheResult<FetchTicket> {
        let mut entries = self.write()?;
        let entry = entries.entry(key.clone()).or_default();
        Ok(FetchTicket {
            key: key.clone(),
            generation: entry.fetch_generation,
        })
    }

    /// Invalidate every outstanding ticket for `key`.
    pub fn cancel_fetches(&self, key: &QueryKey) -> CacheResult<()> {
        let mut entries = self.write()?;
        if let Some(entry) = entries.get_mut(key) {
            entry.fetch_generation += 1;
            tracing::debug!(key = %key, generation = entry.fetch_generation, "Cancelled in-flight fetches");
        }
        Ok(())
    }

    /// Whether `ticket` may still write.
    pub fn is_current(&self, ticket: &FetchTicket) -> CacheResult<bool> {
        Ok(self
            .read()?
            .get(&ticket.key)
            .is_some_and(|entry| entry.fetch_generation == ticket.generation))
    }

    /// Write a fetch result if `ticket` is still current.
    pub fn complete_fetch<T: Send + Sync + 'static>(
        &self,
        ticket: &FetchTicket,
        value: Cached<T>,
    ) -> CacheResult<Option<u64>> {
        self.complete_fetch_with(ticket, move |_: Cached<T>| value)
    }

    /// Compute and write a fetch result from the current value if `ticket` is
    /// still current. Returns `None` when the ticket was cancelled.
    pub fn complete_fetch_with<T, F>(
        &self,
        ticket: &FetchTicket,
        f: F,
    ) -> CacheResult<Option<u64>>
    where
        T: Send + Sync + 'static,
        F: FnOnce(Cached<T>) -> Cached<T>,
    {
        let key = &ticket.key;
        let version = {
            let mut entries = self.write()?;
            let entry = match entries.get_mut(key) {
                Some(entry) if entry.fetch_generation == ticket.generation => entry,
                _ => {
                    Counters::bump(&self.inner.counters.discarded_fetches);
                    tracing::debug!(key = %key, "Discarded result of cancelled fetch");
                    return Ok(None);
                }
            };
            let current = entry.slot.to_cached::<T>(key)?;
            let version = entry.replace(Slot::from_cached(f(current)));
            entry.stale = false;
            entry.last_error = None;
            version
        };

        Counters::bump(&self.inner.counters.writes);
        self.emit(key, version, CacheEventKind::Updated);
        Ok(Some(version))
    }

    /// Record a fetch failure without touching cached data.
    pub fn fail_fetch(&self, ticket: &FetchTicket, error: GatewayError) -> CacheResult<bool> {
        let key = &ticket.key;
        let version = {
            let mut entries = self.write()?;
            match entries.get_mut(key) {
                Some(entry) if entry.fetch_generation == ticket.generation => {
                    entry.last_error = Some(error);
                    entry.version
                }
                _ => return Ok(false),
            }
        };

        self.emit(key, version, CacheEventKind::FetchFailed);
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    /// Read-through observation.
    ///
    /// Serves the cached value when present, not invalidated, and acceptable
    /// under `freshness`; otherwise fetches through `fetcher`, writes the
    /// result (`Unavailable` for the backend-absent sentinel) and returns it.
    /// A failed fetch is recorded on the entry and returned; cached data is
    /// kept.
    pub async fn observe<T, F>(
        &self,
        key: &QueryKey,
        freshness: Freshness,
        fetcher: &F,
    ) -> DeckhandResult<CacheRead<T>>
    where
        T: Send + Sync + 'static,
        F: QueryFetcher<T> + ?Sized,
    {
        let (cached, meta) = {
            let entries = self.read()?;
            match entries.get(key) {
                Some(entry) => (entry.slot.to_cached::<T>(key)?, Some(entry.meta())),
                None => (Cached::Missing, None),
            }
        };

        if let Some(meta) = &meta {
            if !cached.is_missing() && !meta.stale && freshness.accepts(meta.updated_at) {
                Counters::bump(&self.inner.counters.hits);
                return Ok(CacheRead::from_cache(cached, meta.version, meta.updated_at));
            }
        }
        Counters::bump(&self.inner.counters.misses);

        let ticket = self.begin_fetch(key)?;
        match fetcher.fetch(key).await {
            Ok(remote) => {
                let fetched = match remote {
                    Remote::Available(value) => Cached::ready(value),
                    Remote::Unavailable => Cached::Unavailable,
                };
                match self.complete_fetch(&ticket, fetched.clone())? {
                    Some(version) => Ok(CacheRead::from_fetch(fetched, version)),
                    None => {
                        // Someone wrote after we began; theirs is newer.
                        let meta = self.meta(key)?.unwrap_or_else(|| Entry::default().meta());
                        Ok(CacheRead::from_cache(
                            self.get(key)?,
                            meta.version,
                            meta.updated_at,
                        ))
                    }
                }
            }
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "Cache fetch failed");
                self.fail_fetch(&ticket, err.clone())?;
                Err(err.into())
            }
        }
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Receive every change to every entry.
    pub fn subscribe(&self) -> Subscription {
        Subscription::new(self.inner.events.subscribe(), None)
    }

    /// Receive changes to entries whose key starts with `prefix`.
    pub fn subscribe_prefix(&self, prefix: QueryKey) -> Subscription {
        Subscription::new(self.inner.events.subscribe(), Some(prefix))
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn write_fresh(&self, key: &QueryKey, slot: Slot) -> CacheResult<u64> {
        let version = {
            let mut entries = self.write()?;
            let entry = entries.entry(key.clone()).or_default();
            let version = entry.replace(slot);
            entry.stale = false;
            entry.last_error = None;
            version
        };

        Counters::bump(&self.inner.counters.writes);
        self.emit(key, version, CacheEventKind::Updated);
        Ok(version)
    }

    fn emit(&self, key: &QueryKey, version: u64, kind: CacheEventKind) {
        // No receivers is fine.
        let _ = self.inner.events.send(CacheEvent {
            key: key.clone(),
            version,
            kind,
        });
    }

    fn read(&self) -> CacheResult<RwLockReadGuard<'_, HashMap<QueryKey, Entry>>> {
        self.inner
            .entries
            .read()
            .map_err(|_| CacheError::LockPoisoned)
    }

    fn write(&self) -> CacheResult<RwLockWriteGuard<'_, HashMap<QueryKey, Entry>>> {
        self.inner
            .entries
            .write()
            .map_err(|_| CacheError::LockPoisoned)
    }
}
