//! Deckhand Core - Shared Types
//!
//! Data model, query keys, error taxonomy, configuration and the remote call
//! gateway contract shared by the cache and sync crates. No scheduling or
//! cache logic lives here.

pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod key;
pub mod records;

pub use clock::{Clock, SystemClock};
pub use config::{DeckhandConfig, ExpiryConfig, MutationConfig, UnavailablePolicy};
pub use error::{
    CacheError, ConfigError, DeckhandError, DeckhandResult, GatewayError, GatewayResult,
};
pub use gateway::{calls, CallArgs, GatewayClient, Remote, RemoteGateway};
pub use key::{KeyPart, QueryKey};
pub use records::{
    max_record_id, newest_first, ActiveModeState, ConfirmedState, ExpiryRow, ExtraFields,
    LogRecord, ProviderHealth,
};

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Identifier of one optimistic mutation, carried in its tracing span.
/// UUIDv7 so ids sort by start time.
pub type MutationId = Uuid;

/// Generate a new UUIDv7 mutation id.
pub fn new_mutation_id() -> MutationId {
    Uuid::now_v7()
}
