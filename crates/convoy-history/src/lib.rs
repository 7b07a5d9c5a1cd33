//! `convoy-history`: conversation history with a two-tier store.
//!
//! The in-memory cache is the authoritative working copy until process
//! restart. Every mutation schedules a fire-and-forget snapshot write to the
//! durable medium (SQLite); writes for one conversation are applied in order,
//! and [`HistoryStore::flush`] waits for them to land.

pub mod db;
pub mod error;
pub mod store;
pub mod types;

pub use error::{HistoryError, Result};
pub use store::{HistoryObserver, HistoryStore, SnapshotStore, SqliteSnapshotStore};
pub use types::{HistoryMessage, Role};
