//! Error types for Deckhand operations

use crate::key::QueryKey;
use thiserror::Error;

/// Failures reported by the remote call gateway.
///
/// These are the thrown/rejected outcomes of a call. The "backend not present"
/// case is NOT an error: it arrives as [`crate::Remote::Unavailable`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Transport failure calling {call}: {reason}")]
    Transport { call: String, reason: String },

    #[error("Backend rejected {call}: {message}")]
    Backend { call: String, message: String },

    #[error("Invalid arguments for {call}: {reason}")]
    Validation { call: String, reason: String },

    #[error("Could not decode {call} response: {reason}")]
    Decode { call: String, reason: String },
}

impl GatewayError {
    /// Name of the call that failed.
    pub fn call(&self) -> &str {
        match self {
            Self::Transport { call, .. }
            | Self::Backend { call, .. }
            | Self::Validation { call, .. }
            | Self::Decode { call, .. } => call,
        }
    }
}

/// Cache store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache lock poisoned")]
    LockPoisoned,

    #[error("Cached value for {key} is not a {expected}")]
    TypeMismatch {
        key: QueryKey,
        expected: &'static str,
    },
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Master error type for all Deckhand errors.
#[derive(Debug, Error)]
pub enum DeckhandError {
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Telemetry error: {0}")]
    Telemetry(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl DeckhandError {
    /// Returns the gateway failure if this error originated from a remote call.
    pub fn as_gateway(&self) -> Option<&GatewayError> {
        match self {
            Self::Gateway(err) => Some(err),
            _ => None,
        }
    }
}

/// Result type alias for Deckhand operations.
pub type DeckhandResult<T> = Result<T, DeckhandError>;

/// Result type alias for raw gateway calls.
pub type GatewayResult<T> = Result<T, GatewayError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_error_display_backend() {
        let err = GatewayError::Backend {
            call: "set_feature_enabled".to_string(),
            message: "proxy not running".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Backend rejected"));
        assert!(msg.contains("set_feature_enabled"));
        assert!(msg.contains("proxy not running"));
        assert_eq!(err.call(), "set_feature_enabled");
    }

    #[test]
    fn test_cache_error_display_type_mismatch() {
        let err = CacheError::TypeMismatch {
            key: QueryKey::new("request-logs").with(50i64),
            expected: "Vec<LogRecord>",
        };
        let msg = format!("{}", err);
        assert!(msg.contains("[\"request-logs\", 50]"));
        assert!(msg.contains("Vec<LogRecord>"));
    }

    #[test]
    fn test_deckhand_error_from_gateway() {
        let err: DeckhandError = GatewayError::Transport {
            call: "fetch_logs_latest".to_string(),
            reason: "channel closed".to_string(),
        }
        .into();
        assert!(err.as_gateway().is_some());
        assert!(format!("{}", err).starts_with("Gateway error"));
    }

    #[test]
    fn test_config_error_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "log_limit",
            reason: "must be > 0".to_string(),
        };
        let wrapped: DeckhandError = err.into();
        assert!(wrapped.as_gateway().is_none());
        assert!(format!("{}", wrapped).contains("log_limit"));
    }
}
