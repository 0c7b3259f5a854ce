//! Expiry-Driven Refresh Scheduler
//!
//! Rows such as provider circuit-breaker health carry `open_until` /
//! `cooldown_until` deadlines after which their meaning changes. Instead of
//! polling on a fixed period, the scheduler keeps a single pending timer for
//! the nearest future deadline across all watched partitions (plus a small
//! epsilon). When it fires, the partitions are invalidated and refetched and
//! the next deadline is computed from the fresh rows. With no future
//! deadline it falls back to a fixed period so externally cleared rows are
//! still picked up.
//!
//! Any write to a watched partition, by anyone, replaces the pending timer.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deckhand_cache::{CacheEventKind, CacheRead, CacheStore, Freshness, QueryFetcher};
use deckhand_core::{
    Clock, DeckhandResult, ExpiryConfig, ExpiryRow, GatewayClient, GatewayResult, ProviderHealth,
    QueryKey, Remote,
};
use tokio::sync::watch;
use tokio::time::Sleep;

use crate::task::{shutdown_requested, TaskHandle};

/// Cache namespace of expiring-row partitions.
pub const EXPIRY_NAMESPACE: &str = "expiring-rows";

// ============================================================================
// PLANNING
// ============================================================================

/// When to refresh next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPlan {
    /// Nearest future deadline (Unix seconds); `None` means fallback period.
    pub deadline_secs: Option<i64>,
    /// Wait before refreshing.
    pub delay: Duration,
}

impl RefreshPlan {
    pub fn is_fallback(&self) -> bool {
        self.deadline_secs.is_none()
    }
}

/// Plan the next refresh from every row of every partition.
///
/// Takes the earliest deadline still in the future at `now_ms`. The delay is
/// the time until it plus `config.epsilon_ms`; without one, the fallback.
pub fn plan_refresh<'a, R, I>(partitions: I, now_ms: i64, config: &ExpiryConfig) -> RefreshPlan
where
    R: ExpiryRow + 'a,
    I: IntoIterator<Item = &'a [R]>,
{
    let deadline_secs = partitions
        .into_iter()
        .flatten()
        .filter_map(|row| row.next_expiry(now_ms))
        .min();

    match deadline_secs {
        Some(secs) => {
            let wait_ms = secs.saturating_mul(1000).saturating_sub(now_ms).max(0) as u64;
            RefreshPlan {
                deadline_secs: Some(secs),
                delay: Duration::from_millis(wait_ms) + config.epsilon(),
            }
        }
        None => RefreshPlan {
            deadline_secs: None,
            delay: config.fallback(),
        },
    }
}

/// The pending refresh, as observed from outside the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledRefresh {
    pub plan: RefreshPlan,
    /// Unix ms when the timer was armed.
    pub scheduled_at_ms: i64,
    /// Unix ms when it will fire.
    pub fire_at_ms: i64,
}

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
pub struct ExpiryMetrics {
    /// Timers that fired
    pub fires: AtomicU64,
    /// Timers armed
    pub reschedules: AtomicU64,
    /// Pending timers cancelled by a newer plan
    pub superseded: AtomicU64,
    /// Partition refetches that failed
    pub refresh_failures: AtomicU64,
}

impl ExpiryMetrics {
    pub fn snapshot(&self) -> ExpiryMetricsSnapshot {
        ExpiryMetricsSnapshot {
            fires: self.fires.load(Ordering::Relaxed),
            reschedules: self.reschedules.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpiryMetricsSnapshot {
    pub fires: u64,
    pub reschedules: u64,
    pub superseded: u64,
    pub refresh_failures: u64,
}

// ============================================================================
// FETCHER
// ============================================================================

/// Fetches the expiring rows of one partition.
#[derive(Debug, Clone)]
pub struct ExpiringRowsFetcher {
    client: GatewayClient,
    subject: String,
}

impl ExpiringRowsFetcher {
    pub fn new(client: GatewayClient, subject: impl Into<String>) -> Self {
        Self {
            client,
            subject: subject.into(),
        }
    }
}

#[async_trait]
impl QueryFetcher<Vec<ProviderHealth>> for ExpiringRowsFetcher {
    async fn fetch(&self, _key: &QueryKey) -> GatewayResult<Remote<Vec<ProviderHealth>>> {
        self.client.fetch_expiring_rows(&self.subject).await
    }
}

// ============================================================================
// SCHEDULER
// ============================================================================

struct PendingTimer {
    refresh: ScheduledRefresh,
    sleep: Pin<Box<Sleep>>,
}

pub struct ExpiryScheduler {
    store: CacheStore,
    client: GatewayClient,
    clock: Arc<dyn Clock>,
    config: ExpiryConfig,
    partitions: Vec<String>,
    metrics: Arc<ExpiryMetrics>,
    scheduled_tx: watch::Sender<Option<ScheduledRefresh>>,
}

impl std::fmt::Debug for ExpiryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiryScheduler")
            .field("partitions", &self.partitions)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ExpiryScheduler {
    pub fn new(
        store: CacheStore,
        client: GatewayClient,
        clock: Arc<dyn Clock>,
        config: ExpiryConfig,
        partitions: Vec<String>,
    ) -> Self {
        let (scheduled_tx, _) = watch::channel(None);
        Self {
            store,
            client,
            clock,
            config,
            partitions,
            metrics: Arc::new(ExpiryMetrics::default()),
            scheduled_tx,
        }
    }

    /// Cache key of one partition's rows.
    pub fn partition_key(subject: &str) -> QueryKey {
        QueryKey::new(EXPIRY_NAMESPACE).with(subject)
    }

    pub fn metrics(&self) -> &Arc<ExpiryMetrics> {
        &self.metrics
    }

    /// Watch the pending refresh. Holds `None` while nothing is scheduled.
    pub fn scheduled(&self) -> watch::Receiver<Option<ScheduledRefresh>> {
        self.scheduled_tx.subscribe()
    }

    /// Plan from the rows currently cached. Partitions without data
    /// contribute nothing.
    pub fn plan(&self) -> DeckhandResult<RefreshPlan> {
        let mut cached = Vec::with_capacity(self.partitions.len());
        for subject in &self.partitions {
            let rows = self
                .store
                .get::<Vec<ProviderHealth>>(&Self::partition_key(subject))?;
            if let Some(rows) = rows.shared() {
                cached.push(rows);
            }
        }
        Ok(plan_refresh(
            cached.iter().map(|rows| rows.as_slice()),
            self.clock.now_unix_ms(),
            &self.config,
        ))
    }

    /// Read-through load of one partition.
    pub async fn load_partition(
        &self,
        subject: &str,
    ) -> DeckhandResult<CacheRead<Vec<ProviderHealth>>> {
        let fetcher = ExpiringRowsFetcher::new(self.client.clone(), subject);
        self.store
            .observe(
                &Self::partition_key(subject),
                Freshness::UntilInvalidated,
                &fetcher,
            )
            .await
    }

    /// Invalidate and refetch every partition. Returns how many failed;
    /// failures are logged, never raised.
    pub async fn refresh_all(&self) -> usize {
        let mut failures = 0;
        for subject in &self.partitions {
            let key = Self::partition_key(subject);
            if let Err(e) = self.store.invalidate(&key) {
                tracing::warn!(key = %key, error = %e, "Failed to invalidate expiring rows");
            }
            if let Err(e) = self.load_partition(subject).await {
                failures += 1;
                self.metrics.refresh_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, error = %e, "Expiring rows refresh failed");
            }
        }
        failures
    }

    /// Run the scheduler on a background task.
    pub fn spawn(self) -> TaskHandle<ExpiryMetrics> {
        let metrics = Arc::clone(&self.metrics);
        TaskHandle::spawn("expiry_scheduler", metrics, move |shutdown| self.run(shutdown))
    }

    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut events = self.store.subscribe_prefix(QueryKey::new(EXPIRY_NAMESPACE));

        tracing::info!(
            partitions = ?self.partitions,
            epsilon_ms = self.config.epsilon_ms,
            fallback_secs = self.config.fallback_secs,
            "Expiry scheduler started"
        );

        for subject in &self.partitions {
            if let Err(e) = self.load_partition(subject).await {
                self.metrics.refresh_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(subject = %subject, error = %e, "Initial expiring rows load failed");
            }
        }

        let mut timer: Option<PendingTimer> = None;
        self.reschedule(&mut timer);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if shutdown_requested(changed, &shutdown_rx) {
                        tracing::info!("Expiry scheduler shutting down");
                        break;
                    }
                }

                Some(event) = events.recv() => {
                    if event.kind == CacheEventKind::Updated {
                        self.reschedule(&mut timer);
                    }
                }

                _ = timer_fired(&mut timer) => {
                    if let Some(fired) = timer.take() {
                        self.metrics.fires.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(
                            deadline_secs = ?fired.refresh.plan.deadline_secs,
                            "Expiry timer fired, refreshing"
                        );
                    }
                    if self.refresh_all().await > 0 {
                        self.arm(&mut timer, self.fallback_plan());
                    } else {
                        self.reschedule(&mut timer);
                    }
                }
            }
        }

        drop(timer);
        self.scheduled_tx.send_replace(None);

        let snapshot = self.metrics.snapshot();
        tracing::info!(
            fires = snapshot.fires,
            reschedules = snapshot.reschedules,
            superseded = snapshot.superseded,
            refresh_failures = snapshot.refresh_failures,
            "Expiry scheduler stopped"
        );
    }

    /// Replace the pending timer with one for the current plan.
    ///
    /// A pending timer for the same deadline is kept as is.
    fn reschedule(&self, slot: &mut Option<PendingTimer>) {
        let plan = match self.plan() {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to plan expiry refresh, using fallback");
                self.fallback_plan()
            }
        };
        self.arm(slot, plan);
    }

    fn fallback_plan(&self) -> RefreshPlan {
        RefreshPlan {
            deadline_secs: None,
            delay: self.config.fallback(),
        }
    }

    /// Arm a timer for `plan`, cancelling the pending one unless it targets
    /// the same deadline.
    fn arm(&self, slot: &mut Option<PendingTimer>, plan: RefreshPlan) {
        if let Some(pending) = slot {
            if pending.refresh.plan.deadline_secs == plan.deadline_secs {
                tracing::trace!("Expiry plan unchanged");
                return;
            }
        }
        if slot.take().is_some() {
            self.metrics.superseded.fetch_add(1, Ordering::Relaxed);
        }

        let now_ms = self.clock.now_unix_ms();
        let refresh = ScheduledRefresh {
            plan,
            scheduled_at_ms: now_ms,
            fire_at_ms: now_ms.saturating_add(plan.delay.as_millis() as i64),
        };
        self.metrics.reschedules.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            deadline_secs = ?plan.deadline_secs,
            delay_ms = plan.delay.as_millis() as u64,
            fallback = plan.is_fallback(),
            "Expiry refresh scheduled"
        );

        self.scheduled_tx.send_replace(Some(refresh));
        *slot = Some(PendingTimer {
            refresh,
            sleep: Box::pin(tokio::time::sleep(plan.delay)),
        });
    }
}

async fn timer_fired(slot: &mut Option<PendingTimer>) {
    match slot {
        Some(pending) => pending.sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
