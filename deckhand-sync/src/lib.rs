//! Deckhand Sync - Cache Synchronization and Optimistic Mutations
//!
//! Background and user-driven processes that keep the shared [`CacheStore`]
//! consistent with the privileged backend:
//!
//! - [`log_sync`]: cursor-based incremental sync of bounded log lists
//! - [`optimistic`]: speculate → commit/rollback → settle, one in-flight
//!   mutation per subject
//! - [`mutations`]: feature toggle and active mode call sites
//! - [`expiry`]: one pending refresh timer for the nearest row deadline
//!
//! [`SyncLayer`] wires all of them from a [`DeckhandConfig`].

pub mod expiry;
pub mod log_sync;
pub mod mutations;
pub mod optimistic;
pub mod task;
pub mod telemetry;

pub use expiry::{
    plan_refresh, ExpiryMetrics, ExpiryMetricsSnapshot, ExpiryScheduler, ExpiringRowsFetcher,
    RefreshPlan, ScheduledRefresh, EXPIRY_NAMESPACE,
};
pub use log_sync::{
    merge_records, sync_cursor, LatestLogsFetcher, LogSynchronizer, SyncMetrics,
    SyncMetricsSnapshot, SyncOutcome,
};
pub use mutations::{FeatureToggles, ModeSwitcher, SetFeatureEnabled, SwitchActiveMode};
pub use optimistic::{
    InFlightGuard, InFlightRegistry, MutationMetrics, MutationMetricsSnapshot, MutationOutcome,
    OptimisticExecutor, OptimisticMutation, PendingMutation, Started,
};
pub use task::TaskHandle;
pub use telemetry::{init_tracing, TelemetryConfig};

use std::sync::Arc;

use deckhand_cache::CacheStore;
use deckhand_core::{Clock, DeckhandConfig, DeckhandResult, GatewayClient, RemoteGateway};
use tokio::sync::watch;

/// Every sync component sharing one store and one gateway.
#[derive(Debug, Clone)]
pub struct SyncLayer {
    pub config: DeckhandConfig,
    pub store: CacheStore,
    pub client: GatewayClient,
    pub logs: LogSynchronizer,
    pub toggles: FeatureToggles,
    pub modes: ModeSwitcher,
}

impl SyncLayer {
    /// Wire every component. Fails if `config` does not validate.
    pub fn new(gateway: Arc<dyn RemoteGateway>, config: DeckhandConfig) -> DeckhandResult<Self> {
        config.validate()?;
        let store = CacheStore::new();
        let client = GatewayClient::new(gateway);
        let policy = config.mutation.unavailable_policy;
        Ok(Self {
            logs: LogSynchronizer::from_config(store.clone(), client.clone(), &config),
            toggles: FeatureToggles::new(store.clone(), client.clone(), policy),
            modes: ModeSwitcher::new(store.clone(), client.clone(), policy),
            store,
            client,
            config,
        })
    }

    /// Poll the configured log list while `active` reads `true`.
    pub fn spawn_log_polling(
        &self,
        active: watch::Receiver<bool>,
    ) -> DeckhandResult<TaskHandle<SyncMetrics>> {
        self.logs
            .spawn_polling(self.config.log_limit, self.config.poll_interval(), active)
    }

    /// Expiry scheduler over `partitions`, not yet started.
    pub fn expiry_scheduler(
        &self,
        clock: Arc<dyn Clock>,
        partitions: Vec<String>,
    ) -> ExpiryScheduler {
        ExpiryScheduler::new(
            self.store.clone(),
            self.client.clone(),
            clock,
            self.config.expiry.clone(),
            partitions,
        )
    }
}
