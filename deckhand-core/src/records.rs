//! Wire records exchanged with the privileged backend.
//!
//! Every record keeps unknown fields in a flattened map so that values the
//! sync layer does not interpret survive a round trip through the cache.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Opaque fields carried alongside the typed ones.
pub type ExtraFields = Map<String, Value>;

// ============================================================================
// LOG RECORDS
// ============================================================================

/// One entry in a bounded activity log (e.g. gateway request logs).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Assigned by the backend, strictly increasing in creation order.
    pub id: i64,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix milliseconds; authoritative for ordering when positive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at_ms: Option<i64>,
    #[serde(flatten)]
    pub fields: ExtraFields,
}

impl LogRecord {
    pub fn new(id: i64, created_at: i64) -> Self {
        Self {
            id,
            created_at,
            created_at_ms: None,
            fields: ExtraFields::new(),
        }
    }

    /// Attach a millisecond timestamp.
    pub fn with_millis(mut self, created_at_ms: i64) -> Self {
        self.created_at_ms = Some(created_at_ms);
        self
    }

    /// Attach an opaque field.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Timestamp used for ordering, in Unix milliseconds.
    pub fn effective_timestamp_ms(&self) -> i64 {
        match self.created_at_ms {
            Some(ms) if ms > 0 => ms,
            _ => self.created_at.saturating_mul(1000),
        }
    }
}

/// Newest-first ordering: effective timestamp descending, then id descending.
pub fn newest_first(a: &LogRecord, b: &LogRecord) -> Ordering {
    b.effective_timestamp_ms()
        .cmp(&a.effective_timestamp_ms())
        .then_with(|| b.id.cmp(&a.id))
}

/// Highest id present, or 0 for an empty collection.
pub fn max_record_id(records: &[LogRecord]) -> i64 {
    records.iter().map(|r| r.id).max().unwrap_or(0).max(0)
}

// ============================================================================
// EXPIRY ROWS
// ============================================================================

/// A row whose meaning changes once an embedded Unix-seconds deadline passes.
pub trait ExpiryRow {
    fn open_until(&self) -> Option<i64>;

    fn cooldown_until(&self) -> Option<i64>;

    /// Earliest deadline (Unix seconds) that is still in the future at `now_ms`.
    fn next_expiry(&self, now_ms: i64) -> Option<i64> {
        [self.open_until(), self.cooldown_until()]
            .into_iter()
            .flatten()
            .filter(|deadline| deadline.saturating_mul(1000) > now_ms)
            .min()
    }
}

/// Circuit-breaker health of one upstream provider behind the local gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider_id: String,
    #[serde(default)]
    pub open_until: Option<i64>,
    #[serde(default)]
    pub cooldown_until: Option<i64>,
    #[serde(flatten)]
    pub fields: ExtraFields,
}

impl ProviderHealth {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            open_until: None,
            cooldown_until: None,
            fields: ExtraFields::new(),
        }
    }

    pub fn with_open_until(mut self, deadline: i64) -> Self {
        self.open_until = Some(deadline);
        self
    }

    pub fn with_cooldown_until(mut self, deadline: i64) -> Self {
        self.cooldown_until = Some(deadline);
        self
    }
}

impl ExpiryRow for ProviderHealth {
    fn open_until(&self) -> Option<i64> {
        self.open_until
    }

    fn cooldown_until(&self) -> Option<i64> {
        self.cooldown_until
    }
}

// ============================================================================
// MUTATION RESULTS
// ============================================================================

/// Authoritative enablement of one subject (e.g. proxy takeover for a CLI app).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmedState {
    pub subject: String,
    pub enabled: bool,
    #[serde(flatten)]
    pub fields: ExtraFields,
}

impl ConfirmedState {
    pub fn new(subject: impl Into<String>, enabled: bool) -> Self {
        Self {
            subject: subject.into(),
            enabled,
            fields: ExtraFields::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

/// Authoritative active mode of one CLI application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveModeState {
    pub app: String,
    pub mode: String,
    #[serde(flatten)]
    pub fields: ExtraFields,
}

impl ActiveModeState {
    pub fn new(app: impl Into<String>, mode: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            mode: mode.into(),
            fields: ExtraFields::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_effective_timestamp_prefers_positive_millis() {
        let seconds_only = LogRecord::new(1, 100);
        assert_eq!(seconds_only.effective_timestamp_ms(), 100_000);

        let with_millis = LogRecord::new(2, 100).with_millis(100_250);
        assert_eq!(with_millis.effective_timestamp_ms(), 100_250);

        let zero_millis = LogRecord::new(3, 100).with_millis(0);
        assert_eq!(zero_millis.effective_timestamp_ms(), 100_000);
    }

    #[test]
    fn test_newest_first_tie_breaks_on_id() {
        let mut records = vec![
            LogRecord::new(1, 100),
            LogRecord::new(3, 100),
            LogRecord::new(2, 200),
        ];
        records.sort_by(newest_first);
        let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn test_max_record_id() {
        assert_eq!(max_record_id(&[]), 0);
        assert_eq!(
            max_record_id(&[LogRecord::new(4, 1), LogRecord::new(9, 0)]),
            9
        );
    }

    #[test]
    fn test_log_record_keeps_opaque_fields() {
        let raw = json!({
            "id": 7,
            "created_at": 1_700_000_000,
            "model": "claude-sonnet",
            "status_code": 200
        });
        let record: LogRecord = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(record.id, 7);
        assert_eq!(record.created_at_ms, None);
        assert_eq!(record.fields["model"], json!("claude-sonnet"));
        assert_eq!(serde_json::to_value(&record).unwrap(), raw);
    }

    #[test]
    fn test_next_expiry_ignores_past_deadlines() {
        let now_ms = 1_000_000;
        let row = ProviderHealth::new("anthropic")
            .with_open_until(900)
            .with_cooldown_until(1_010);
        assert_eq!(row.next_expiry(now_ms), Some(1_010));

        let both_future = ProviderHealth::new("openai")
            .with_open_until(1_020)
            .with_cooldown_until(1_005);
        assert_eq!(both_future.next_expiry(now_ms), Some(1_005));

        let none = ProviderHealth::new("gemini");
        assert_eq!(none.next_expiry(now_ms), None);

        let exactly_now = ProviderHealth::new("local").with_open_until(1_000);
        assert_eq!(exactly_now.next_expiry(now_ms), None);
    }
}
