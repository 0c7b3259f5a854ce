//! Remote call gateway contract and typed client.
//!
//! The privileged host process is reached through named calls carrying a small
//! JSON argument map. A call either fails ([`GatewayError`]), returns a payload,
//! or returns an explicit `null` meaning "understood, but the backend is not
//! present". The last case is surfaced as [`Remote::Unavailable`] and is never
//! conflated with an error.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::{GatewayError, GatewayResult};
use crate::records::{ActiveModeState, ConfirmedState, LogRecord, ProviderHealth};

/// Argument bundle for one call.
pub type CallArgs = Map<String, Value>;

/// Names of the host calls consumed by the sync layer.
pub mod calls {
    pub const FETCH_LOGS_LATEST: &str = "fetch_logs_latest";
    pub const FETCH_LOGS_AFTER: &str = "fetch_logs_after";
    pub const SET_FEATURE_ENABLED: &str = "set_feature_enabled";
    pub const FETCH_EXPIRING_ROWS: &str = "fetch_expiring_rows";
    pub const SWITCH_ACTIVE_MODE: &str = "switch_active_mode";
}

/// Successful call outcome: a payload, or the "backend not present" sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Remote<T> {
    Available(T),
    Unavailable,
}

impl<T> Remote<T> {
    pub fn is_available(&self) -> bool {
        matches!(self, Remote::Available(_))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Remote::Unavailable)
    }

    pub fn map<U, F>(self, f: F) -> Remote<U>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            Remote::Available(value) => Remote::Available(f(value)),
            Remote::Unavailable => Remote::Unavailable,
        }
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Remote::Available(value) => Some(value),
            Remote::Unavailable => None,
        }
    }

    pub fn as_ref(&self) -> Remote<&T> {
        match self {
            Remote::Available(value) => Remote::Available(value),
            Remote::Unavailable => Remote::Unavailable,
        }
    }
}

/// Raw asynchronous request/response channel to the privileged backend.
///
/// Implementations return `Ok(None)` (or `Ok(Some(Value::Null))`) for the
/// unavailable sentinel and `Err` for transport, validation or backend failures.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn invoke(&self, call: &str, args: CallArgs) -> GatewayResult<Option<Value>>;
}

#[async_trait]
impl<G> RemoteGateway for Arc<G>
where
    G: RemoteGateway + ?Sized,
{
    async fn invoke(&self, call: &str, args: CallArgs) -> GatewayResult<Option<Value>> {
        (**self).invoke(call, args).await
    }
}

/// Typed wrapper naming every call the sync layer depends on.
#[derive(Clone)]
pub struct GatewayClient {
    gateway: Arc<dyn RemoteGateway>,
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient").finish_non_exhaustive()
    }
}

impl GatewayClient {
    pub fn new(gateway: Arc<dyn RemoteGateway>) -> Self {
        Self { gateway }
    }

    /// Up to `limit` most recent log records.
    pub async fn fetch_logs_latest(&self, limit: usize) -> GatewayResult<Remote<Vec<LogRecord>>> {
        ensure_limit(calls::FETCH_LOGS_LATEST, limit)?;
        let mut args = CallArgs::new();
        args.insert("limit".to_string(), Value::from(limit));
        self.call_json(calls::FETCH_LOGS_LATEST, args).await
    }

    /// Up to `limit` log records with id strictly greater than `cursor_id`.
    pub async fn fetch_logs_after(
        &self,
        cursor_id: i64,
        limit: usize,
    ) -> GatewayResult<Remote<Vec<LogRecord>>> {
        ensure_limit(calls::FETCH_LOGS_AFTER, limit)?;
        let mut args = CallArgs::new();
        args.insert("cursor_id".to_string(), Value::from(cursor_id));
        args.insert("limit".to_string(), Value::from(limit));
        self.call_json(calls::FETCH_LOGS_AFTER, args).await
    }

    pub async fn set_feature_enabled(
        &self,
        subject_key: &str,
        enabled: bool,
    ) -> GatewayResult<Remote<ConfirmedState>> {
        let mut args = CallArgs::new();
        args.insert("subject_key".to_string(), Value::from(subject_key));
        args.insert("enabled".to_string(), Value::from(enabled));
        self.call_json(calls::SET_FEATURE_ENABLED, args).await
    }

    pub async fn fetch_expiring_rows(
        &self,
        subject_key: &str,
    ) -> GatewayResult<Remote<Vec<ProviderHealth>>> {
        let mut args = CallArgs::new();
        args.insert("subject_key".to_string(), Value::from(subject_key));
        self.call_json(calls::FETCH_EXPIRING_ROWS, args).await
    }

    pub async fn switch_active_mode(
        &self,
        app: &str,
        mode: &str,
    ) -> GatewayResult<Remote<ActiveModeState>> {
        let mut args = CallArgs::new();
        args.insert("app".to_string(), Value::from(app));
        args.insert("mode".to_string(), Value::from(mode));
        self.call_json(calls::SWITCH_ACTIVE_MODE, args).await
    }

    async fn call_json<T: DeserializeOwned>(
        &self,
        call: &str,
        args: CallArgs,
    ) -> GatewayResult<Remote<T>> {
        match self.gateway.invoke(call, args).await? {
            None | Some(Value::Null) => Ok(Remote::Unavailable),
            Some(payload) => serde_json::from_value(payload)
                .map(Remote::Available)
                .map_err(|e| GatewayError::Decode {
                    call: call.to_string(),
                    reason: e.to_string(),
                }),
        }
    }
}

fn ensure_limit(call: &str, limit: usize) -> GatewayResult<()> {
    if limit == 0 {
        return Err(GatewayError::Validation {
            call: call.to_string(),
            reason: "limit must be > 0".to_string(),
        });
    }
    Ok(())
}
