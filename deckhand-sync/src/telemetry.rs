//! Tracing subscriber bootstrap.

use deckhand_core::{DeckhandError, DeckhandResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "deckhand_sync=debug,deckhand_cache=debug,info";

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Fallback filter directives when `RUST_LOG` is not set
    pub filter: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Read `DECKHAND_LOG_FILTER` and `DECKHAND_LOG_FORMAT` (`json` | `pretty`).
    pub fn from_env() -> Self {
        Self {
            filter: std::env::var("DECKHAND_LOG_FILTER")
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string()),
            json: std::env::var("DECKHAND_LOG_FORMAT")
                .map(|s| s.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        }
    }
}

/// Install the global tracing subscriber.
///
/// Call once at startup. A second call fails with `DeckhandError::Telemetry`.
pub fn init_tracing(config: &TelemetryConfig) -> DeckhandResult<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    installed.map_err(|e| DeckhandError::Telemetry(format!("Failed to init subscriber: {}", e)))?;

    tracing::info!(json = config.json, filter = %config.filter, "Tracing initialized");
    Ok(())
}
