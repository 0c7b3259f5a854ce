//! Optimistic call sites: per-subject feature enablement and per-app active
//! mode switching.

use async_trait::async_trait;
use deckhand_cache::{CacheStore, Cached};
use deckhand_core::{
    ActiveModeState, ConfirmedState, DeckhandResult, GatewayClient, GatewayResult, QueryKey,
    Remote, UnavailablePolicy,
};

use crate::optimistic::{MutationOutcome, OptimisticExecutor, OptimisticMutation, Started};

/// Cache namespace of the feature state list.
pub const FEATURE_STATES: &str = "feature-states";
/// Cache namespace of per-app active modes.
pub const ACTIVE_MODE: &str = "active-mode";

// ============================================================================
// FEATURE TOGGLES
// ============================================================================

/// Enables or disables a feature for one subject (e.g. routing one CLI tool
/// through the local gateway).
#[derive(Debug, Clone)]
pub struct SetFeatureEnabled {
    client: GatewayClient,
    subject: String,
    enabled: bool,
}

#[async_trait]
impl OptimisticMutation for SetFeatureEnabled {
    type Value = Vec<ConfirmedState>;
    type Confirmed = ConfirmedState;

    fn subject(&self) -> &str {
        &self.subject
    }

    fn key(&self) -> QueryKey {
        FeatureToggles::key()
    }

    fn already_applied(&self, current: &Cached<Vec<ConfirmedState>>) -> bool {
        current.value().is_some_and(|states| {
            states
                .iter()
                .any(|s| s.subject == self.subject && s.enabled == self.enabled)
        })
    }

    fn speculate(&self, current: &Vec<ConfirmedState>) -> Vec<ConfirmedState> {
        current
            .iter()
            .map(|state| {
                if state.subject == self.subject {
                    ConfirmedState {
                        enabled: self.enabled,
                        ..state.clone()
                    }
                } else {
                    state.clone()
                }
            })
            .collect()
    }

    async fn call(&self) -> GatewayResult<Remote<ConfirmedState>> {
        self.client
            .set_feature_enabled(&self.subject, self.enabled)
            .await
    }

    fn reconcile(
        &self,
        current: &Vec<ConfirmedState>,
        confirmed: &ConfirmedState,
    ) -> Vec<ConfirmedState> {
        let mut next = current.clone();
        match next.iter_mut().find(|s| s.subject == confirmed.subject) {
            Some(slot) => *slot = confirmed.clone(),
            None => next.push(confirmed.clone()),
        }
        next
    }

    /// Puts back only this subject's entry. Other subjects may have
    /// speculative writes of their own in flight on the same list.
    fn revert(
        &self,
        current: &Cached<Vec<ConfirmedState>>,
        prior: &Cached<Vec<ConfirmedState>>,
    ) -> Cached<Vec<ConfirmedState>> {
        let Some(states) = current.value() else {
            return current.clone();
        };
        let before = prior
            .value()
            .and_then(|prior| prior.iter().find(|s| s.subject == self.subject));

        // Speculation only flips existing entries, so a subject absent from
        // either side was not touched by this mutation.
        let mut next = states.clone();
        if let (Some(slot), Some(before)) =
            (next.iter_mut().find(|s| s.subject == self.subject), before)
        {
            *slot = before.clone();
        }
        Cached::ready(next)
    }
}

/// Feature enablement over the cached `Vec<ConfirmedState>` list.
#[derive(Debug, Clone)]
pub struct FeatureToggles {
    client: GatewayClient,
    executor: OptimisticExecutor,
}

impl FeatureToggles {
    pub fn new(store: CacheStore, client: GatewayClient, policy: UnavailablePolicy) -> Self {
        Self {
            client,
            executor: OptimisticExecutor::new(store, policy),
        }
    }

    pub fn key() -> QueryKey {
        QueryKey::new(FEATURE_STATES)
    }

    pub fn executor(&self) -> &OptimisticExecutor {
        &self.executor
    }

    pub fn states(&self) -> DeckhandResult<Cached<Vec<ConfirmedState>>> {
        Ok(self.executor.store().get(&Self::key())?)
    }

    /// Speculatively flip `subject`, then confirm with the backend.
    pub async fn set_enabled(
        &self,
        subject: &str,
        enabled: bool,
    ) -> DeckhandResult<MutationOutcome<ConfirmedState>> {
        self.start_set_enabled(subject, enabled)?.outcome().await
    }

    /// Like [`Self::set_enabled`], returning once the speculative value is
    /// written.
    pub fn start_set_enabled(
        &self,
        subject: &str,
        enabled: bool,
    ) -> DeckhandResult<Started<ConfirmedState>> {
        self.executor.start(SetFeatureEnabled {
            client: self.client.clone(),
            subject: subject.to_string(),
            enabled,
        })
    }
}

// ============================================================================
// ACTIVE MODE
// ============================================================================

/// Switches the active mode (e.g. provider profile) of one CLI application.
#[derive(Debug, Clone)]
pub struct SwitchActiveMode {
    client: GatewayClient,
    app: String,
    mode: String,
}

#[async_trait]
impl OptimisticMutation for SwitchActiveMode {
    type Value = ActiveModeState;
    type Confirmed = ActiveModeState;

    fn subject(&self) -> &str {
        &self.app
    }

    fn key(&self) -> QueryKey {
        ModeSwitcher::key(&self.app)
    }

    fn already_applied(&self, current: &Cached<ActiveModeState>) -> bool {
        current.value().is_some_and(|state| state.mode == self.mode)
    }

    fn speculate(&self, current: &ActiveModeState) -> ActiveModeState {
        ActiveModeState {
            mode: self.mode.clone(),
            ..current.clone()
        }
    }

    async fn call(&self) -> GatewayResult<Remote<ActiveModeState>> {
        self.client.switch_active_mode(&self.app, &self.mode).await
    }

    fn reconcile(&self, _current: &ActiveModeState, confirmed: &ActiveModeState) -> ActiveModeState {
        confirmed.clone()
    }
}

/// Active mode switching over the cached `ActiveModeState` of each app.
#[derive(Debug, Clone)]
pub struct ModeSwitcher {
    client: GatewayClient,
    executor: OptimisticExecutor,
}

impl ModeSwitcher {
    pub fn new(store: CacheStore, client: GatewayClient, policy: UnavailablePolicy) -> Self {
        Self {
            client,
            executor: OptimisticExecutor::new(store, policy),
        }
    }

    pub fn key(app: &str) -> QueryKey {
        QueryKey::new(ACTIVE_MODE).with(app)
    }

    pub fn executor(&self) -> &OptimisticExecutor {
        &self.executor
    }

    pub fn active(&self, app: &str) -> DeckhandResult<Cached<ActiveModeState>> {
        Ok(self.executor.store().get(&Self::key(app))?)
    }

    pub async fn switch(
        &self,
        app: &str,
        mode: &str,
    ) -> DeckhandResult<MutationOutcome<ActiveModeState>> {
        self.executor
            .execute(SwitchActiveMode {
                client: self.client.clone(),
                app: app.to_string(),
                mode: mode.to_string(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deckhand_test_utils::fixtures::{active_mode, confirmed_state};
    use deckhand_test_utils::{calls, MockGateway, MockReply};

    fn states(toggles: &FeatureToggles) -> Vec<ConfirmedState> {
        toggles.states().unwrap().value().cloned().unwrap()
    }

    fn toggle(subject: &str, enabled: bool) -> SetFeatureEnabled {
        SetFeatureEnabled {
            client: MockGateway::new().client(),
            subject: subject.to_string(),
            enabled,
        }
    }

    #[test]
    fn test_revert_leaves_other_subjects_alone() {
        // codex flipped speculatively after claude's snapshot was taken.
        let prior = Cached::ready(vec![
            confirmed_state("claude", false).with_field("port", 15721),
            confirmed_state("codex", false),
        ]);
        let current = Cached::ready(vec![
            confirmed_state("claude", true).with_field("port", 15721),
            confirmed_state("codex", true),
        ]);

        let reverted = toggle("claude", true).revert(&current, &prior);

        assert_eq!(
            reverted.value().cloned().unwrap(),
            vec![
                confirmed_state("claude", false).with_field("port", 15721),
                confirmed_state("codex", true),
            ]
        );
    }

    #[test]
    fn test_revert_keeps_non_ready_current() {
        let prior = Cached::ready(vec![confirmed_state("claude", false)]);
        let reverted = toggle("claude", true).revert(&Cached::Unavailable, &prior);
        assert!(reverted.is_unavailable());
    }

    #[tokio::test]
    async fn test_toggle_confirmed_replaces_only_subject() {
        let gateway = MockGateway::new();
        let confirmed = confirmed_state("claude", true).with_field("port", 15721);
        gateway.on(calls::SET_FEATURE_ENABLED, MockReply::json(&confirmed));

        let store = CacheStore::new();
        store
            .set(
                &FeatureToggles::key(),
                vec![confirmed_state("claude", false), confirmed_state("codex", true)],
            )
            .unwrap();
        let toggles = FeatureToggles::new(store, gateway.client(), UnavailablePolicy::default());

        let outcome = toggles.set_enabled("claude", true).await.unwrap();
        assert_eq!(outcome.confirmed(), Some(&confirmed));
        assert_eq!(states(&toggles), vec![confirmed, confirmed_state("codex", true)]);
    }

    #[tokio::test]
    async fn test_toggle_same_state_is_noop() {
        let gateway = MockGateway::new();
        let store = CacheStore::new();
        store
            .set(&FeatureToggles::key(), vec![confirmed_state("claude", true)])
            .unwrap();
        let toggles = FeatureToggles::new(store, gateway.client(), UnavailablePolicy::default());

        let outcome = toggles.set_enabled("claude", true).await.unwrap();
        assert_eq!(outcome, MutationOutcome::AlreadyApplied);
        assert_eq!(gateway.call_count(calls::SET_FEATURE_ENABLED), 0);
    }

    #[tokio::test]
    async fn test_mode_switch_rolls_back_on_failure() {
        let gateway = MockGateway::new();
        gateway.on(
            calls::SWITCH_ACTIVE_MODE,
            MockReply::backend_error(calls::SWITCH_ACTIVE_MODE, "profile missing"),
        );
        let store = CacheStore::new();
        store
            .set(&ModeSwitcher::key("codex"), active_mode("codex", "official"))
            .unwrap();
        let switcher = ModeSwitcher::new(store, gateway.client(), UnavailablePolicy::default());

        assert!(switcher.switch("codex", "proxy").await.is_err());
        assert_eq!(
            switcher.active("codex").unwrap().value(),
            Some(&active_mode("codex", "official"))
        );
        let args = &gateway.calls_to(calls::SWITCH_ACTIVE_MODE)[0];
        assert_eq!(args["app"], "codex");
        assert_eq!(args["mode"], "proxy");
    }

    #[tokio::test]
    async fn test_mode_switch_confirmed() {
        let gateway = MockGateway::new();
        gateway.on(
            calls::SWITCH_ACTIVE_MODE,
            MockReply::json(&active_mode("codex", "proxy")),
        );
        let store = CacheStore::new();
        store
            .set(&ModeSwitcher::key("codex"), active_mode("codex", "official"))
            .unwrap();
        let switcher = ModeSwitcher::new(store, gateway.client(), UnavailablePolicy::default());

        let outcome = switcher.switch("codex", "proxy").await.unwrap();
        assert_eq!(outcome.confirmed(), Some(&active_mode("codex", "proxy")));
        assert_eq!(
            switcher.active("codex").unwrap().value().map(|s| s.mode.as_str()),
            Some("proxy")
        );
    }
}
