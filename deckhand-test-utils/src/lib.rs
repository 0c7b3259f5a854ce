//! Deckhand Test Utilities
//!
//! Centralized test infrastructure for the Deckhand workspace:
//! - Scripted mock gateway with call log and gated replies
//! - Clock driven by tokio's virtual time
//! - Proptest generators for records and keys
//! - Test fixtures for common scenarios
//! - Custom assertions for cache invariants

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

pub use deckhand_core::{
    calls, ActiveModeState, CallArgs, Clock, ConfirmedState, DeckhandConfig, ExpiryRow,
    GatewayClient, GatewayError, GatewayResult, LogRecord, ProviderHealth, QueryKey, Remote,
    RemoteGateway,
};

// ============================================================================
// MOCK GATEWAY
// ============================================================================

/// Scripted reply for one call.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Payload returned as-is.
    Json(Value),
    /// The "backend not present" sentinel.
    Unavailable,
    /// Rejected call.
    Fail(GatewayError),
}

impl MockReply {
    /// Serialize `value` into a payload reply.
    pub fn json<T: Serialize>(value: &T) -> Self {
        MockReply::Json(serde_json::to_value(value).expect("mock payload must serialize"))
    }

    /// Backend-reported failure for `call`.
    pub fn backend_error(call: &str, message: &str) -> Self {
        MockReply::Fail(GatewayError::Backend {
            call: call.to_string(),
            message: message.to_string(),
        })
    }

    /// Transport failure for `call`.
    pub fn transport_error(call: &str) -> Self {
        MockReply::Fail(GatewayError::Transport {
            call: call.to_string(),
            reason: "mock transport closed".to_string(),
        })
    }

    fn into_result(self) -> GatewayResult<Option<Value>> {
        match self {
            MockReply::Json(value) => Ok(Some(value)),
            MockReply::Unavailable => Ok(None),
            MockReply::Fail(err) => Err(err),
        }
    }
}

/// One call observed by the mock.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub call: String,
    pub args: CallArgs,
}

/// Holds calls pending until opened. Dropping the gate does not open it.
#[derive(Debug, Clone)]
pub struct Gate {
    tx: Arc<watch::Sender<bool>>,
}

impl Gate {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Release every call waiting on this gate and every later one.
    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // Only fails if the sender is dropped, which the gate itself prevents.
        let _ = rx.wait_for(|open| *open).await;
    }
}

#[derive(Debug, Default)]
struct MockState {
    queued: HashMap<String, VecDeque<MockReply>>,
    defaults: HashMap<String, MockReply>,
    gates: HashMap<String, Gate>,
    calls: Vec<RecordedCall>,
}

/// In-memory [`RemoteGateway`] with scripted replies.
///
/// Replies queued with [`MockGateway::enqueue`] are consumed first, then the
/// call's default from [`MockGateway::on`]. Unscripted calls fail with a
/// backend error. Every call is recorded before its reply is released, so a
/// gated call is visible in the log while it is still pending.
#[derive(Debug, Default)]
pub struct MockGateway {
    state: Mutex<MockState>,
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Typed client over this mock.
    pub fn client(self: &Arc<Self>) -> GatewayClient {
        GatewayClient::new(self.clone())
    }

    /// Reply to every call of `call` with `reply` once the queue is empty.
    pub fn on(&self, call: &str, reply: MockReply) -> &Self {
        self.state().defaults.insert(call.to_string(), reply);
        self
    }

    /// Reply to the next call of `call` with `reply`.
    pub fn enqueue(&self, call: &str, reply: MockReply) -> &Self {
        self.state()
            .queued
            .entry(call.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// Hold every call of `call` until the returned gate is opened.
    pub fn gate(&self, call: &str) -> Gate {
        self.state()
            .gates
            .entry(call.to_string())
            .or_insert_with(Gate::new)
            .clone()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state().calls.clone()
    }

    /// Arguments of every call of `call`, in order.
    pub fn calls_to(&self, call: &str) -> Vec<CallArgs> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.call == call)
            .map(|c| c.args.clone())
            .collect()
    }

    pub fn call_count(&self, call: &str) -> usize {
        self.state().calls.iter().filter(|c| c.call == call).count()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock gateway lock poisoned")
    }
}

#[async_trait]
impl RemoteGateway for MockGateway {
    async fn invoke(&self, call: &str, args: CallArgs) -> GatewayResult<Option<Value>> {
        let (reply, gate) = {
            let mut state = self.state();
            state.calls.push(RecordedCall {
                call: call.to_string(),
                args,
            });
            let reply = state
                .queued
                .get_mut(call)
                .and_then(VecDeque::pop_front)
                .or_else(|| state.defaults.get(call).cloned());
            (reply, state.gates.get(call).cloned())
        };

        if let Some(gate) = gate {
            gate.wait().await;
        }

        match reply {
            Some(reply) => reply.into_result(),
            None => Err(GatewayError::Backend {
                call: call.to_string(),
                message: "no scripted reply".to_string(),
            }),
        }
    }
}

// ============================================================================
// CLOCKS
// ============================================================================

/// Unix clock that follows tokio's (pausable) time.
///
/// With `#[tokio::test(start_paused = true)]`, `tokio::time::advance` and
/// auto-advance move this clock together with every timer.
#[derive(Debug, Clone)]
pub struct PausedClock {
    origin: tokio::time::Instant,
    origin_unix_ms: i64,
}

impl PausedClock {
    /// Clock reading `unix_ms` right now.
    pub fn starting_at(unix_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            origin: tokio::time::Instant::now(),
            origin_unix_ms: unix_ms,
        })
    }
}

impl Clock for PausedClock {
    fn now_unix_ms(&self) -> i64 {
        let elapsed = tokio::time::Instant::now().saturating_duration_since(self.origin);
        self.origin_unix_ms + elapsed.as_millis() as i64
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: Mutex<i64>,
}

impl ManualClock {
    pub fn at(unix_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            now_ms: Mutex::new(unix_ms),
        })
    }

    pub fn set(&self, unix_ms: i64) {
        *self.now_ms.lock().expect("manual clock lock poisoned") = unix_ms;
    }

    pub fn advance_ms(&self, ms: i64) {
        *self.now_ms.lock().expect("manual clock lock poisoned") += ms;
    }
}

impl Clock for ManualClock {
    fn now_unix_ms(&self) -> i64 {
        *self.now_ms.lock().expect("manual clock lock poisoned")
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating Deckhand types.

    use super::*;
    use deckhand_core::KeyPart;
    use proptest::prelude::*;

    /// Seconds in a plausible range (2020 to 2040).
    pub fn arb_unix_secs() -> impl Strategy<Value = i64> {
        1_577_836_800i64..2_208_988_800i64
    }

    /// Log record with a small id space so batches overlap.
    pub fn arb_log_record() -> impl Strategy<Value = LogRecord> {
        (
            1i64..200,
            arb_unix_secs(),
            prop::option::of(0i64..1000),
            prop::option::of("[a-z]{1,8}"),
        )
            .prop_map(|(id, created_at, millis, path)| {
                let mut record = LogRecord::new(id, created_at);
                if let Some(extra) = millis {
                    record = record.with_millis(created_at * 1000 + extra);
                }
                if let Some(path) = path {
                    record = record.with_field("path", path);
                }
                record
            })
    }

    /// Batch of records, unique by id as the backend guarantees.
    pub fn arb_log_batch(max_len: usize) -> impl Strategy<Value = Vec<LogRecord>> {
        prop::collection::vec(arb_log_record(), 0..=max_len).prop_map(|records| {
            let mut seen = std::collections::HashSet::new();
            records.into_iter().filter(|r| seen.insert(r.id)).collect()
        })
    }

    /// Limit in the range lists are configured with.
    pub fn arb_limit() -> impl Strategy<Value = usize> {
        1usize..80
    }

    pub fn arb_key_part() -> impl Strategy<Value = KeyPart> {
        prop_oneof![
            any::<bool>().prop_map(KeyPart::Bool),
            any::<i64>().prop_map(KeyPart::Int),
            "[a-z-]{1,12}".prop_map(KeyPart::Str),
        ]
    }

    pub fn arb_query_key() -> impl Strategy<Value = QueryKey> {
        prop::collection::vec(arb_key_part(), 1..4).prop_map(QueryKey::from_parts)
    }

    /// Provider row with deadlines within an hour either side of `now_secs`.
    pub fn arb_provider_health(now_secs: i64) -> impl Strategy<Value = ProviderHealth> {
        (
            "[a-z]{3,10}",
            prop::option::of(-3600i64..3600),
            prop::option::of(-3600i64..3600),
        )
            .prop_map(move |(id, open, cooldown)| ProviderHealth {
                provider_id: id,
                open_until: open.map(|d| now_secs + d),
                cooldown_until: cooldown.map(|d| now_secs + d),
                fields: Default::default(),
            })
    }

    pub fn arb_confirmed_state() -> impl Strategy<Value = ConfirmedState> {
        ("[a-z]{3,10}", any::<bool>()).prop_map(|(subject, enabled)| {
            ConfirmedState::new(subject, enabled)
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use super::*;

    /// Fixed "now" used across scenario tests: 2025-01-01T00:00:00Z.
    pub const NOW_SECS: i64 = 1_735_689_600;
    pub const NOW_MS: i64 = NOW_SECS * 1000;

    /// Log record created `id` seconds after [`NOW_SECS`], so larger ids are newer.
    pub fn log_record(id: i64) -> LogRecord {
        LogRecord::new(id, NOW_SECS + id).with_field("path", format!("/v1/messages/{}", id))
    }

    pub fn log_records(ids: &[i64]) -> Vec<LogRecord> {
        ids.iter().copied().map(log_record).collect()
    }

    pub fn expiry_row(
        provider: &str,
        open_until: Option<i64>,
        cooldown_until: Option<i64>,
    ) -> ProviderHealth {
        ProviderHealth {
            provider_id: provider.to_string(),
            open_until,
            cooldown_until,
            fields: Default::default(),
        }
    }

    pub fn confirmed_state(subject: &str, enabled: bool) -> ConfirmedState {
        ConfirmedState::new(subject, enabled)
    }

    pub fn active_mode(app: &str, mode: &str) -> ActiveModeState {
        ActiveModeState::new(app, mode)
    }

    /// Config with short intervals for tests.
    pub fn test_config() -> DeckhandConfig {
        DeckhandConfig {
            log_limit: 10,
            poll_interval_ms: 100,
            ..Default::default()
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for cache invariants.

    use super::*;

    /// Assert records are unique by id and ordered newest first.
    pub fn assert_newest_first(records: &[LogRecord]) {
        let mut ids = std::collections::HashSet::new();
        for record in records {
            assert!(ids.insert(record.id), "duplicate id {} in list", record.id);
        }
        for pair in records.windows(2) {
            assert_ne!(
                deckhand_core::newest_first(&pair[0], &pair[1]),
                std::cmp::Ordering::Greater,
                "records out of order: {} before {}",
                pair[0].id,
                pair[1].id
            );
        }
    }

    /// Assert the list holds exactly `ids`, in that order.
    pub fn assert_ids(records: &[LogRecord], ids: &[i64]) {
        let actual: Vec<i64> = records.iter().map(|r| r.id).collect();
        assert_eq!(actual, ids, "unexpected record ids");
    }
}
