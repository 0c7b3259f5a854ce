//! Optimistic Mutation Executor
//!
//! Protocol for one mutation of one cache key:
//!
//! 1. **Speculate**: cancel background fetches for the key, snapshot the
//!    current value, write the speculative value. All synchronous.
//! 2. **Remote call**:
//!    - confirmed: replace the affected part of the value with the
//!      authoritative result;
//!    - unavailable: keep or roll back per [`UnavailablePolicy`];
//!    - failed: revert this mutation's part of the value to the snapshot,
//!      then return the error.
//! 3. **Settle**: invalidate the key, always, after step 2.
//!
//! Steps 2 and 3 run on a spawned task, so they complete even if the caller
//! stops waiting. At most one mutation per subject is in flight; a second
//! request for a busy subject is rejected without a remote call.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use deckhand_cache::{CacheStore, Cached, EntrySnapshot};
use deckhand_core::{
    new_mutation_id, CacheError, DeckhandError, DeckhandResult, GatewayResult, MutationId,
    QueryKey, Remote, UnavailablePolicy,
};
use tokio::task::JoinHandle;
use tracing::Instrument;

// ============================================================================
// MUTATION CONTRACT
// ============================================================================

/// One optimistic change to one cached value.
#[async_trait]
pub trait OptimisticMutation: Send + Sync + 'static {
    /// Cached value type at [`Self::key`].
    type Value: Send + Sync + 'static;
    /// Authoritative result returned by the backend.
    type Confirmed: Clone + Send + Sync + 'static;

    /// Concurrency guard subject (e.g. provider id, app name).
    fn subject(&self) -> &str;

    fn key(&self) -> QueryKey;

    /// True when the cached value already reflects this mutation. Such a
    /// request returns [`MutationOutcome::AlreadyApplied`] without writing or
    /// calling the backend.
    fn already_applied(&self, _current: &Cached<Self::Value>) -> bool {
        false
    }

    /// Speculative value computed from the current one.
    fn speculate(&self, current: &Self::Value) -> Self::Value;

    async fn call(&self) -> GatewayResult<Remote<Self::Confirmed>>;

    /// Fold the authoritative result into the current value.
    fn reconcile(&self, current: &Self::Value, confirmed: &Self::Confirmed) -> Self::Value;

    /// Undo this mutation's speculative write, given the value captured just
    /// before it.
    ///
    /// Mutations sharing a key with other subjects must only put back their
    /// own part of `prior`, since `current` may hold another subject's
    /// speculative write made after the snapshot was taken.
    fn revert(
        &self,
        _current: &Cached<Self::Value>,
        prior: &Cached<Self::Value>,
    ) -> Cached<Self::Value> {
        prior.clone()
    }
}

/// Caller-visible result of a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome<C> {
    /// Backend confirmed; the cache holds the reconciled value.
    Confirmed(C),
    /// Backend absent; cache handled per the unavailable policy.
    Unavailable,
    /// Another mutation for the same subject is in flight.
    Rejected,
    /// Cache already reflects the requested state.
    AlreadyApplied,
}

impl<C> MutationOutcome<C> {
    pub fn confirmed(&self) -> Option<&C> {
        match self {
            MutationOutcome::Confirmed(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, MutationOutcome::Rejected)
    }
}

// ============================================================================
// IN-FLIGHT GUARD
// ============================================================================

/// Subjects with a mutation in flight.
#[derive(Debug, Clone, Default)]
pub struct InFlightRegistry {
    subjects: Arc<Mutex<HashSet<String>>>,
}

impl InFlightRegistry {
    /// Mark `subject` busy, or `None` if it already is.
    pub fn try_acquire(&self, subject: &str) -> Result<Option<InFlightGuard>, CacheError> {
        let mut subjects = self.subjects.lock().map_err(|_| CacheError::LockPoisoned)?;
        if !subjects.insert(subject.to_string()) {
            return Ok(None);
        }
        Ok(Some(InFlightGuard {
            registry: self.clone(),
            subject: subject.to_string(),
        }))
    }

    pub fn is_in_flight(&self, subject: &str) -> bool {
        self.subjects
            .lock()
            .map(|subjects| subjects.contains(subject))
            .unwrap_or(false)
    }
}

/// Releases its subject when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    registry: InFlightRegistry,
    subject: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut subjects) = self.registry.subjects.lock() {
            subjects.remove(&self.subject);
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
pub struct MutationMetrics {
    pub started: AtomicU64,
    pub confirmed: AtomicU64,
    pub unavailable: AtomicU64,
    pub rolled_back: AtomicU64,
    pub rejected: AtomicU64,
    pub already_applied: AtomicU64,
}

impl MutationMetrics {
    pub fn snapshot(&self) -> MutationMetricsSnapshot {
        MutationMetricsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            confirmed: self.confirmed.load(Ordering::Relaxed),
            unavailable: self.unavailable.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            already_applied: self.already_applied.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationMetricsSnapshot {
    pub started: u64,
    pub confirmed: u64,
    pub unavailable: u64,
    pub rolled_back: u64,
    pub rejected: u64,
    pub already_applied: u64,
}

// ============================================================================
// EXECUTOR
// ============================================================================

/// A mutation past its speculative write, settling on a spawned task.
#[derive(Debug)]
pub struct PendingMutation<C> {
    id: MutationId,
    handle: JoinHandle<DeckhandResult<MutationOutcome<C>>>,
}

impl<C> PendingMutation<C> {
    pub fn id(&self) -> MutationId {
        self.id
    }

    /// Wait for commit or rollback and settle.
    pub async fn outcome(self) -> DeckhandResult<MutationOutcome<C>> {
        self.handle
            .await
            .map_err(|e| DeckhandError::Task(format!("mutation {}: {}", self.id, e)))?
    }
}

/// Result of starting a mutation.
#[derive(Debug)]
pub enum Started<C> {
    Pending(PendingMutation<C>),
    /// Finished without a remote call.
    Done(MutationOutcome<C>),
}

impl<C> Started<C> {
    pub async fn outcome(self) -> DeckhandResult<MutationOutcome<C>> {
        match self {
            Started::Pending(pending) => pending.outcome().await,
            Started::Done(outcome) => Ok(outcome),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OptimisticExecutor {
    store: CacheStore,
    in_flight: InFlightRegistry,
    policy: UnavailablePolicy,
    metrics: Arc<MutationMetrics>,
}

impl OptimisticExecutor {
    pub fn new(store: CacheStore, policy: UnavailablePolicy) -> Self {
        Self {
            store,
            in_flight: InFlightRegistry::default(),
            policy,
            metrics: Arc::new(MutationMetrics::default()),
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn policy(&self) -> UnavailablePolicy {
        self.policy
    }

    pub fn metrics(&self) -> &Arc<MutationMetrics> {
        &self.metrics
    }

    pub fn is_in_flight(&self, subject: &str) -> bool {
        self.in_flight.is_in_flight(subject)
    }

    /// Run `mutation` to completion.
    pub async fn execute<M: OptimisticMutation>(
        &self,
        mutation: M,
    ) -> DeckhandResult<MutationOutcome<M::Confirmed>> {
        self.start(mutation)?.outcome().await
    }

    /// Apply the speculative write now and hand the rest to a spawned task.
    ///
    /// When this returns `Started::Pending`, the speculative value is
    /// already in the cache.
    pub fn start<M: OptimisticMutation>(&self, mutation: M) -> DeckhandResult<Started<M::Confirmed>> {
        let key = mutation.key();
        let Some(guard) = self.in_flight.try_acquire(mutation.subject())? else {
            self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(subject = mutation.subject(), key = %key, "Mutation already in flight, rejecting");
            return Ok(Started::Done(MutationOutcome::Rejected));
        };

        let current: Cached<M::Value> = self.store.get(&key)?;
        if mutation.already_applied(&current) {
            self.metrics.already_applied.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(subject = mutation.subject(), key = %key, "Mutation already applied");
            return Ok(Started::Done(MutationOutcome::AlreadyApplied));
        }

        let id = new_mutation_id();
        let span = tracing::info_span!(
            "optimistic_mutation",
            mutation_id = %id,
            key = %key,
            subject = mutation.subject()
        );

        let snapshot = span.in_scope(|| self.speculate(&mutation, &key))?;
        self.metrics.started.fetch_add(1, Ordering::Relaxed);

        let store = self.store.clone();
        let policy = self.policy;
        let metrics = Arc::clone(&self.metrics);
        let handle = tokio::spawn(
            async move {
                let outcome = settle(&store, policy, &metrics, &mutation, &key, snapshot).await;
                drop(guard);
                outcome
            }
            .instrument(span),
        );

        Ok(Started::Pending(PendingMutation { id, handle }))
    }

    fn speculate<M: OptimisticMutation>(
        &self,
        mutation: &M,
        key: &QueryKey,
    ) -> Result<EntrySnapshot, CacheError> {
        self.store.cancel_fetches(key)?;
        let snapshot = self.store.snapshot(key)?;
        let version = self
            .store
            .update(key, |current: &M::Value| mutation.speculate(current))?;
        match version {
            Some(version) => tracing::debug!(version, "Applied speculative value"),
            None => tracing::debug!("No cached value to speculate on"),
        }
        Ok(snapshot)
    }
}

/// Remote call, then commit or roll back, then invalidate.
async fn settle<M: OptimisticMutation>(
    store: &CacheStore,
    policy: UnavailablePolicy,
    metrics: &MutationMetrics,
    mutation: &M,
    key: &QueryKey,
    snapshot: EntrySnapshot,
) -> DeckhandResult<MutationOutcome<M::Confirmed>> {
    let outcome = commit_or_rollback(store, policy, metrics, mutation, key, snapshot).await;

    match store.invalidate(key) {
        Ok(_) => tracing::debug!("Mutation settled"),
        Err(e) => tracing::error!(error = %e, "Failed to invalidate after mutation"),
    }
    outcome
}

async fn commit_or_rollback<M: OptimisticMutation>(
    store: &CacheStore,
    policy: UnavailablePolicy,
    metrics: &MutationMetrics,
    mutation: &M,
    key: &QueryKey,
    snapshot: EntrySnapshot,
) -> DeckhandResult<MutationOutcome<M::Confirmed>> {
    match mutation.call().await {
        Ok(Remote::Available(confirmed)) => {
            store.update(key, |current: &M::Value| {
                mutation.reconcile(current, &confirmed)
            })?;
            metrics.confirmed.fetch_add(1, Ordering::Relaxed);
            tracing::info!("Mutation confirmed");
            Ok(MutationOutcome::Confirmed(confirmed))
        }
        Ok(Remote::Unavailable) => {
            metrics.unavailable.fetch_add(1, Ordering::Relaxed);
            match policy {
                UnavailablePolicy::KeepSpeculative => {
                    tracing::warn!("Backend unavailable, keeping speculative value");
                }
                UnavailablePolicy::Rollback => {
                    rollback(store, mutation, key, &snapshot)?;
                    metrics.rolled_back.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Backend unavailable, rolled back");
                }
            }
            Ok(MutationOutcome::Unavailable)
        }
        Err(err) => {
            rollback(store, mutation, key, &snapshot)?;
            metrics.rolled_back.fetch_add(1, Ordering::Relaxed);
            tracing::error!(error = %err, "Mutation rejected, rolled back");
            Err(err.into())
        }
    }
}

/// Apply [`OptimisticMutation::revert`] against the pre-speculation snapshot.
fn rollback<M: OptimisticMutation>(
    store: &CacheStore,
    mutation: &M,
    key: &QueryKey,
    snapshot: &EntrySnapshot,
) -> Result<(), CacheError> {
    let prior: Cached<M::Value> = snapshot.value()?;
    if !prior.is_ready() {
        // Speculation only writes over ready values.
        tracing::debug!("Nothing speculated, nothing to roll back");
        return Ok(());
    }
    let version = store.modify(key, |current: Cached<M::Value>| {
        mutation.revert(&current, &prior)
    })?;
    tracing::debug!(version, "Reverted speculative value");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use deckhand_core::GatewayError;

    /// Adds `delta` to a cached counter; the backend answers with `reply`.
    struct AddMutation {
        subject: String,
        delta: i64,
        reply: GatewayResult<Remote<i64>>,
    }

    impl AddMutation {
        fn new(delta: i64, reply: GatewayResult<Remote<i64>>) -> Self {
            Self {
                subject: "counter".to_string(),
                delta,
                reply,
            }
        }
    }

    #[async_trait]
    impl OptimisticMutation for AddMutation {
        type Value = i64;
        type Confirmed = i64;

        fn subject(&self) -> &str {
            &self.subject
        }

        fn key(&self) -> QueryKey {
            QueryKey::new("counter")
        }

        fn already_applied(&self, _current: &Cached<i64>) -> bool {
            self.delta == 0
        }

        fn speculate(&self, current: &i64) -> i64 {
            current + self.delta
        }

        async fn call(&self) -> GatewayResult<Remote<i64>> {
            self.reply.clone()
        }

        fn reconcile(&self, _current: &i64, confirmed: &i64) -> i64 {
            *confirmed
        }
    }

    fn rejected() -> GatewayError {
        GatewayError::Backend {
            call: "add".to_string(),
            message: "nope".to_string(),
        }
    }

    fn seeded(policy: UnavailablePolicy) -> OptimisticExecutor {
        let store = CacheStore::new();
        store.set(&QueryKey::new("counter"), 10i64).unwrap();
        OptimisticExecutor::new(store, policy)
    }

    fn counter(executor: &OptimisticExecutor) -> i64 {
        *executor
            .store()
            .get::<i64>(&QueryKey::new("counter"))
            .unwrap()
            .value()
            .unwrap()
    }

    #[tokio::test]
    async fn test_confirmed_reconciles_and_invalidates() {
        let executor = seeded(UnavailablePolicy::default());
        let outcome = executor
            .execute(AddMutation::new(5, Ok(Remote::Available(16))))
            .await
            .unwrap();
        assert_eq!(outcome, MutationOutcome::Confirmed(16));
        assert_eq!(counter(&executor), 16);
        let meta = executor.store().meta(&QueryKey::new("counter")).unwrap().unwrap();
        assert!(meta.stale);
        assert!(!executor.is_in_flight("counter"));
    }

    #[tokio::test]
    async fn test_failure_restores_snapshot() {
        let executor = seeded(UnavailablePolicy::default());
        let err = executor
            .execute(AddMutation::new(5, Err(rejected())))
            .await
            .unwrap_err();
        assert_eq!(err.as_gateway(), Some(&rejected()));
        assert_eq!(counter(&executor), 10);
        assert_eq!(executor.metrics().snapshot().rolled_back, 1);
    }

    #[tokio::test]
    async fn test_failure_on_absent_key_writes_nothing() {
        let executor = OptimisticExecutor::new(CacheStore::new(), UnavailablePolicy::default());

        assert!(executor
            .execute(AddMutation::new(5, Err(rejected())))
            .await
            .is_err());

        assert!(executor.store().is_empty());
        assert_eq!(executor.metrics().snapshot().rolled_back, 1);
    }

    #[tokio::test]
    async fn test_unavailable_keeps_speculative_by_default() {
        let executor = seeded(UnavailablePolicy::KeepSpeculative);
        let outcome = executor
            .execute(AddMutation::new(5, Ok(Remote::Unavailable)))
            .await
            .unwrap();
        assert_eq!(outcome, MutationOutcome::Unavailable);
        assert_eq!(counter(&executor), 15);
    }

    #[tokio::test]
    async fn test_unavailable_rollback_policy() {
        let executor = seeded(UnavailablePolicy::Rollback);
        executor
            .execute(AddMutation::new(5, Ok(Remote::Unavailable)))
            .await
            .unwrap();
        assert_eq!(counter(&executor), 10);
    }

    #[tokio::test]
    async fn test_already_applied_skips_everything() {
        let executor = seeded(UnavailablePolicy::default());
        let outcome = executor
            .execute(AddMutation::new(0, Err(rejected())))
            .await
            .unwrap();
        assert_eq!(outcome, MutationOutcome::AlreadyApplied);
        assert_eq!(counter(&executor), 10);
        assert_eq!(executor.metrics().snapshot().started, 0);
    }

    #[tokio::test]
    async fn test_speculation_cancels_background_fetch() {
        let executor = seeded(UnavailablePolicy::default());
        let key = QueryKey::new("counter");
        let ticket = executor.store().begin_fetch(&key).unwrap();

        executor
            .execute(AddMutation::new(1, Ok(Remote::Available(11))))
            .await
            .unwrap();

        let late = executor
            .store()
            .complete_fetch(&ticket, Cached::ready(999i64))
            .unwrap();
        assert_eq!(late, None);
        assert_eq!(counter(&executor), 11);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let registry = InFlightRegistry::default();
        let guard = registry.try_acquire("claude").unwrap().unwrap();
        assert!(registry.try_acquire("claude").unwrap().is_none());
        assert!(registry.try_acquire("codex").unwrap().is_some());
        drop(guard);
        assert!(registry.try_acquire("claude").unwrap().is_some());
    }
}
