//! Incremental Log Synchronizer
//!
//! Keeps one bounded, newest-first list of log records per `(list, limit)`
//! key. The primary query ([`LogSynchronizer::load`]) populates the list with
//! a full fetch; after that, [`LogSynchronizer::sync`] only asks the backend
//! for records above the cursor (the highest id already cached) and merges
//! them in.
//!
//! Polling and manual refresh run the same `sync`, so results are identical
//! whichever triggers them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deckhand_cache::{CacheRead, CacheStore, Cached, FetchTicket, Freshness, QueryFetcher};
use deckhand_core::{
    max_record_id, newest_first, ConfigError, DeckhandConfig, DeckhandResult, GatewayClient,
    GatewayResult, LogRecord, QueryKey, Remote,
};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::task::{shutdown_requested, TaskHandle};

// ============================================================================
// MERGE
// ============================================================================

/// Merge `incoming` into `previous`: remote wins on id collisions, the result
/// is sorted newest first and truncated to `limit`.
///
/// Applying the same batch twice yields the same list.
pub fn merge_records(previous: &[LogRecord], incoming: &[LogRecord], limit: usize) -> Vec<LogRecord> {
    let mut by_id: HashMap<i64, LogRecord> = HashMap::with_capacity(previous.len() + incoming.len());
    for record in incoming {
        by_id.insert(record.id, record.clone());
    }
    for record in previous {
        by_id.entry(record.id).or_insert_with(|| record.clone());
    }

    let mut merged: Vec<LogRecord> = by_id.into_values().collect();
    merged.sort_by(newest_first);
    merged.truncate(limit);
    merged
}

/// Highest cached id, or 0 when nothing is loaded.
pub fn sync_cursor(cached: &Cached<Vec<LogRecord>>) -> i64 {
    cached.value().map_or(0, |records| max_record_id(records))
}

// ============================================================================
// OUTCOMES & METRICS
// ============================================================================

/// Result of one sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The list has never been loaded; nothing was fetched.
    NotLoaded,
    /// Incremental fetch returned nothing new; cache untouched.
    Unchanged,
    /// Records fetched and written.
    Fetched(usize),
    /// Backend reported itself absent; the list is now `Unavailable`.
    Unavailable,
    /// Fetch finished after a newer write cancelled it; result dropped.
    Superseded,
}

impl SyncOutcome {
    /// Number of records written (0 for every no-op outcome).
    pub fn count(&self) -> usize {
        match self {
            SyncOutcome::Fetched(n) => *n,
            _ => 0,
        }
    }
}

/// Counters for log sync activity.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    pub syncs: AtomicU64,
    pub records_fetched: AtomicU64,
    pub full_loads: AtomicU64,
    pub incremental_loads: AtomicU64,
    pub not_loaded: AtomicU64,
    pub unavailable: AtomicU64,
    pub failures: AtomicU64,
    pub skipped_ticks: AtomicU64,
}

impl SyncMetrics {
    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        SyncMetricsSnapshot {
            syncs: self.syncs.load(Ordering::Relaxed),
            records_fetched: self.records_fetched.load(Ordering::Relaxed),
            full_loads: self.full_loads.load(Ordering::Relaxed),
            incremental_loads: self.incremental_loads.load(Ordering::Relaxed),
            not_loaded: self.not_loaded.load(Ordering::Relaxed),
            unavailable: self.unavailable.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            skipped_ticks: self.skipped_ticks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncMetricsSnapshot {
    pub syncs: u64,
    pub records_fetched: u64,
    pub full_loads: u64,
    pub incremental_loads: u64,
    pub not_loaded: u64,
    pub unavailable: u64,
    pub failures: u64,
    pub skipped_ticks: u64,
}

// ============================================================================
// FETCHER
// ============================================================================

/// Full fetch of the newest `limit` records, sorted for caching.
#[derive(Debug, Clone)]
pub struct LatestLogsFetcher {
    client: GatewayClient,
    limit: usize,
}

impl LatestLogsFetcher {
    pub fn new(client: GatewayClient, limit: usize) -> Self {
        Self { client, limit }
    }
}

#[async_trait]
impl QueryFetcher<Vec<LogRecord>> for LatestLogsFetcher {
    async fn fetch(&self, _key: &QueryKey) -> GatewayResult<Remote<Vec<LogRecord>>> {
        let fetched = self.client.fetch_logs_latest(self.limit).await?;
        Ok(fetched.map(|records| merge_records(&[], &records, self.limit)))
    }
}

// ============================================================================
// SYNCHRONIZER
// ============================================================================

#[derive(Debug, Clone)]
pub struct LogSynchronizer {
    store: CacheStore,
    client: GatewayClient,
    list: String,
    metrics: Arc<SyncMetrics>,
}

impl LogSynchronizer {
    pub fn new(store: CacheStore, client: GatewayClient, list: impl Into<String>) -> Self {
        Self {
            store,
            client,
            list: list.into(),
            metrics: Arc::new(SyncMetrics::default()),
        }
    }

    pub fn from_config(store: CacheStore, client: GatewayClient, config: &DeckhandConfig) -> Self {
        Self::new(store, client, config.log_list.clone())
    }

    /// Cache key of the list bounded by `limit`.
    pub fn key(&self, limit: usize) -> QueryKey {
        QueryKey::new(self.list.as_str()).with(limit)
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }

    /// Current cached list.
    pub fn records(&self, limit: usize) -> DeckhandResult<Cached<Vec<LogRecord>>> {
        Ok(self.store.get(&self.key(limit))?)
    }

    /// Primary query: serve the cached list, or full-fetch it when missing
    /// or invalidated.
    pub async fn load(&self, limit: usize) -> DeckhandResult<CacheRead<Vec<LogRecord>>> {
        let fetcher = LatestLogsFetcher::new(self.client.clone(), limit);
        let read = self
            .store
            .observe(&self.key(limit), Freshness::UntilInvalidated, &fetcher)
            .await;
        match &read {
            Ok(read) if read.was_cache_miss() => {
                self.metrics.full_loads.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.metrics.failures.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        read
    }

    /// Bring the cached list up to date.
    ///
    /// Never fetches for a list that has not been loaded. With an empty or
    /// unavailable list, does a full fetch; otherwise fetches only records
    /// above the cursor. Failures are recorded on the cache entry and
    /// returned; the cached list is left as it was.
    pub async fn sync(&self, limit: usize) -> DeckhandResult<SyncOutcome> {
        let key = self.key(limit);
        self.metrics.syncs.fetch_add(1, Ordering::Relaxed);

        let current: Cached<Vec<LogRecord>> = self.store.get(&key)?;
        if current.is_missing() {
            self.metrics.not_loaded.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(key = %key, "Log list not loaded, skipping sync");
            return Ok(SyncOutcome::NotLoaded);
        }

        let cursor = sync_cursor(&current);
        let ticket = self.store.begin_fetch(&key)?;
        let outcome = if cursor == 0 {
            self.full_sync(&ticket, limit).await
        } else {
            self.incremental_sync(&ticket, cursor, limit).await
        };

        match &outcome {
            Ok(SyncOutcome::Fetched(n)) => {
                self.metrics
                    .records_fetched
                    .fetch_add(*n as u64, Ordering::Relaxed);
                tracing::debug!(key = %key, cursor, fetched = n, "Log sync applied");
            }
            Ok(SyncOutcome::Unavailable) => {
                self.metrics.unavailable.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, "Log backend unavailable");
            }
            Ok(other) => {
                tracing::trace!(key = %key, cursor, outcome = ?other, "Log sync finished");
            }
            Err(_) => {
                self.metrics.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        outcome
    }

    /// Manual refresh; same semantics as a polling cycle.
    pub async fn refresh(&self, limit: usize) -> DeckhandResult<SyncOutcome> {
        tracing::debug!(list = %self.list, limit, "Manual log refresh");
        self.sync(limit).await
    }

    async fn full_sync(&self, ticket: &FetchTicket, limit: usize) -> DeckhandResult<SyncOutcome> {
        self.metrics.full_loads.fetch_add(1, Ordering::Relaxed);
        let fetched = match self.client.fetch_logs_latest(limit).await {
            Ok(fetched) => fetched,
            Err(err) => {
                tracing::error!(key = %ticket.key(), error = %err, "Full log fetch failed");
                self.store.fail_fetch(ticket, err.clone())?;
                return Err(err.into());
            }
        };

        match fetched {
            Remote::Available(records) => {
                let sorted = merge_records(&[], &records, limit);
                let count = sorted.len();
                match self.store.complete_fetch(ticket, Cached::ready(sorted))? {
                    Some(_) => Ok(SyncOutcome::Fetched(count)),
                    None => Ok(SyncOutcome::Superseded),
                }
            }
            Remote::Unavailable => self.write_unavailable(ticket),
        }
    }

    async fn incremental_sync(
        &self,
        ticket: &FetchTicket,
        cursor: i64,
        limit: usize,
    ) -> DeckhandResult<SyncOutcome> {
        self.metrics.incremental_loads.fetch_add(1, Ordering::Relaxed);
        let fetched = match self.client.fetch_logs_after(cursor, limit).await {
            Ok(fetched) => fetched,
            Err(err) => {
                tracing::warn!(key = %ticket.key(), cursor, error = %err, "Incremental log fetch failed");
                self.store.fail_fetch(ticket, err.clone())?;
                return Err(err.into());
            }
        };

        match fetched {
            Remote::Available(records) if records.is_empty() => Ok(SyncOutcome::Unchanged),
            Remote::Available(records) => {
                let count = records.len();
                let written = self.store.complete_fetch_with(
                    ticket,
                    |previous: Cached<Vec<LogRecord>>| {
                        let previous = previous.value().map_or(&[][..], Vec::as_slice);
                        Cached::ready(merge_records(previous, &records, limit))
                    },
                )?;
                match written {
                    Some(_) => Ok(SyncOutcome::Fetched(count)),
                    None => Ok(SyncOutcome::Superseded),
                }
            }
            Remote::Unavailable => self.write_unavailable(ticket),
        }
    }

    fn write_unavailable(&self, ticket: &FetchTicket) -> DeckhandResult<SyncOutcome> {
        match self
            .store
            .complete_fetch::<Vec<LogRecord>>(ticket, Cached::Unavailable)?
        {
            Some(_) => Ok(SyncOutcome::Unavailable),
            None => Ok(SyncOutcome::Superseded),
        }
    }

    // ------------------------------------------------------------------
    // Polling
    // ------------------------------------------------------------------

    /// Sync every `period` while `active` reads `true`.
    ///
    /// Each sync runs as a detached task: shutting the poller down stops
    /// future ticks but lets a sync already in flight finish and write.
    /// A tick that finds the previous sync still running is skipped.
    pub fn spawn_polling(
        &self,
        limit: usize,
        period: Duration,
        active: watch::Receiver<bool>,
    ) -> DeckhandResult<TaskHandle<SyncMetrics>> {
        if period.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "poll_interval_ms",
                reason: "must be > 0".to_string(),
            }
            .into());
        }
        let sync = self.clone();
        Ok(TaskHandle::spawn("log_sync", Arc::clone(&self.metrics), move |shutdown| {
            sync.poll_loop(limit, period, active, shutdown)
        }))
    }

    async fn poll_loop(
        self,
        limit: usize,
        period: Duration,
        active: watch::Receiver<bool>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let in_flight = Arc::new(AtomicBool::new(false));

        tracing::info!(
            list = %self.list,
            limit,
            interval_ms = period.as_millis() as u64,
            "Log sync polling started"
        );

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if shutdown_requested(changed, &shutdown_rx) {
                        tracing::info!(list = %self.list, "Log sync polling shutting down");
                        break;
                    }
                }

                _ = ticker.tick() => {
                    if !*active.borrow() {
                        self.metrics.skipped_ticks.fetch_add(1, Ordering::Relaxed);
                        tracing::trace!(list = %self.list, "Consumer inactive, skipping poll");
                        continue;
                    }
                    if in_flight.swap(true, Ordering::AcqRel) {
                        self.metrics.skipped_ticks.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(list = %self.list, "Previous sync still running, skipping poll");
                        continue;
                    }

                    let sync = self.clone();
                    let busy = InFlightSync(Arc::clone(&in_flight));
                    tokio::spawn(async move {
                        let _busy = busy;
                        if let Err(e) = sync.sync(limit).await {
                            tracing::warn!(list = %sync.list, error = %e, "Background log sync failed");
                        }
                    });
                }
            }
        }

        let snapshot = self.metrics.snapshot();
        tracing::info!(
            syncs = snapshot.syncs,
            records_fetched = snapshot.records_fetched,
            failures = snapshot.failures,
            skipped_ticks = snapshot.skipped_ticks,
            "Log sync polling stopped"
        );
    }
}

/// Clears the poller's busy flag when the sync task ends, panics included.
struct InFlightSync(Arc<AtomicBool>);

impl Drop for InFlightSync {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
