//! Configuration for the sync layer.
//!
//! Loaded from a TOML file (`--config <path>` or `DECKHAND_CONFIG`), with
//! individual `DECKHAND_*` environment overrides. Every field has a default so
//! an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Default logical list synchronized by the log synchronizer.
pub const DEFAULT_LOG_LIST: &str = "request-logs";
/// Default number of log records kept per list.
pub const DEFAULT_LOG_LIMIT: usize = 50;
/// Default background poll period.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
/// Slack added after an expiry deadline before refreshing.
pub const DEFAULT_EXPIRY_EPSILON_MS: u64 = 1_000;
/// Refresh period used when no row carries a future deadline.
pub const DEFAULT_EXPIRY_FALLBACK_SECS: u64 = 30;

/// What an optimistic mutation does with its speculative value when the
/// backend answers "unavailable".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailablePolicy {
    /// Keep the speculative value; the following invalidation reconciles it.
    #[default]
    KeepSpeculative,
    /// Restore the snapshot taken before speculating.
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeckhandConfig {
    pub log_list: String,
    pub log_limit: usize,
    pub poll_interval_ms: u64,
    pub expiry: ExpiryConfig,
    pub mutation: MutationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExpiryConfig {
    pub epsilon_ms: u64,
    pub fallback_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MutationConfig {
    pub unavailable_policy: UnavailablePolicy,
}

impl Default for DeckhandConfig {
    fn default() -> Self {
        Self {
            log_list: DEFAULT_LOG_LIST.to_string(),
            log_limit: DEFAULT_LOG_LIMIT,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            expiry: ExpiryConfig::default(),
            mutation: MutationConfig::default(),
        }
    }
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            epsilon_ms: DEFAULT_EXPIRY_EPSILON_MS,
            fallback_secs: DEFAULT_EXPIRY_FALLBACK_SECS,
        }
    }
}

impl ExpiryConfig {
    pub fn epsilon(&self) -> Duration {
        Duration::from_millis(self.epsilon_ms)
    }

    pub fn fallback(&self) -> Duration {
        Duration::from_secs(self.fallback_secs)
    }
}

impl DeckhandConfig {
    /// Load from the file named on the command line or in `DECKHAND_CONFIG`,
    /// falling back to defaults, then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match config_path_from_args().or_else(config_path_from_env) {
            Some(path) => Self::from_path(&path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: DeckhandConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Apply `DECKHAND_*` environment overrides. Unparseable values are ignored.
    ///
    /// - `DECKHAND_LOG_LIST`
    /// - `DECKHAND_LOG_LIMIT`
    /// - `DECKHAND_POLL_INTERVAL_MS`
    /// - `DECKHAND_EXPIRY_EPSILON_MS`
    /// - `DECKHAND_EXPIRY_FALLBACK_SECS`
    /// - `DECKHAND_UNAVAILABLE_POLICY` (`keep_speculative` | `rollback`)
    pub fn apply_env(&mut self) {
        if let Ok(list) = std::env::var("DECKHAND_LOG_LIST") {
            self.log_list = list;
        }
        if let Some(limit) = env_parse("DECKHAND_LOG_LIMIT") {
            self.log_limit = limit;
        }
        if let Some(interval) = env_parse("DECKHAND_POLL_INTERVAL_MS") {
            self.poll_interval_ms = interval;
        }
        if let Some(epsilon) = env_parse("DECKHAND_EXPIRY_EPSILON_MS") {
            self.expiry.epsilon_ms = epsilon;
        }
        if let Some(fallback) = env_parse("DECKHAND_EXPIRY_FALLBACK_SECS") {
            self.expiry.fallback_secs = fallback;
        }
        match std::env::var("DECKHAND_UNAVAILABLE_POLICY").as_deref() {
            Ok("keep_speculative") => {
                self.mutation.unavailable_policy = UnavailablePolicy::KeepSpeculative
            }
            Ok("rollback") => self.mutation.unavailable_policy = UnavailablePolicy::Rollback,
            _ => {}
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_list.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "log_list",
                reason: "must not be empty".to_string(),
            });
        }
        if self.log_limit == 0 {
            return Err(ConfigError::InvalidValue {
                field: "log_limit",
                reason: "must be > 0".to_string(),
            });
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "poll_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.expiry.fallback_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "expiry.fallback_secs",
                reason: "must be > 0".to_string(),
            });
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var("DECKHAND_CONFIG").ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = DeckhandConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.log_limit, DEFAULT_LOG_LIMIT);
        assert_eq!(config.expiry.fallback(), Duration::from_secs(30));
        assert_eq!(
            config.mutation.unavailable_policy,
            UnavailablePolicy::KeepSpeculative
        );
    }

    #[test]
    fn test_from_path_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "log_limit = 100\n\n[expiry]\nepsilon_ms = 250\n\n[mutation]\nunavailable_policy = \"rollback\""
        )
        .unwrap();

        let config = DeckhandConfig::from_path(file.path()).unwrap();
        assert_eq!(config.log_limit, 100);
        assert_eq!(config.log_list, DEFAULT_LOG_LIST);
        assert_eq!(config.expiry.epsilon(), Duration::from_millis(250));
        assert_eq!(config.expiry.fallback_secs, DEFAULT_EXPIRY_FALLBACK_SECS);
        assert_eq!(config.mutation.unavailable_policy, UnavailablePolicy::Rollback);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "log_limt = 100").unwrap();
        assert!(matches!(
            DeckhandConfig::from_path(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("deckhand.toml");
        assert!(matches!(
            DeckhandConfig::from_path(&missing),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_zero_limit_rejected() {
        let config = DeckhandConfig {
            log_limit: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "log_limit", .. })
        ));
    }

    proptest! {
        #[test]
        fn positive_settings_validate(limit in 1usize..10_000, poll in 1u64..600_000, fallback in 1u64..3_600) {
            let config = DeckhandConfig {
                log_limit: limit,
                poll_interval_ms: poll,
                expiry: ExpiryConfig { epsilon_ms: 0, fallback_secs: fallback },
                ..Default::default()
            };
            prop_assert!(config.validate().is_ok());
        }

        #[test]
        fn blank_log_list_rejected(spaces in " {0,8}") {
            let config = DeckhandConfig {
                log_list: spaces,
                ..Default::default()
            };
            prop_assert!(config.validate().is_err());
        }
    }
}
