//! Deckhand Cache - Query Cache Store
//!
//! In-memory, keyed, versioned store shared by every sync component.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   observe / get    ┌──────────────────────────┐
//! │  Observers   │ ◄────────────────► │        CacheStore        │
//! └──────────────┘   CacheEvent       │  QueryKey → Entry        │
//!                                     │  (slot, version, stale,  │
//! ┌──────────────┐   set / update /   │   last_error, fetch gen) │
//! │ Synchronizer │   complete_fetch   └────────────┬─────────────┘
//! │ Executor     │ ─────────────────►              │ miss / stale
//! │ Scheduler    │                          ┌──────▼───────┐
//! └──────────────┘                          │ QueryFetcher │
//!                                           └──────────────┘
//! ```
//!
//! Entries distinguish never-fetched (`Missing`), backend-absent
//! (`Unavailable`) and fetched data (`Ready`). Background fetches hold a
//! [`FetchTicket`]; cancelling a key's fetches makes their results unwritable.

mod cached;
mod events;
mod fetch;
mod stats;
mod store;

pub use cached::{CacheRead, Cached, Freshness};
pub use events::{CacheEvent, CacheEventKind, Subscription, DEFAULT_EVENT_CAPACITY};
pub use fetch::{FetchTicket, QueryFetcher};
pub use stats::CacheStats;
pub use store::{CacheStore, EntryMeta, EntrySnapshot};
