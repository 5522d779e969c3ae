//! Database layer for dossier
//!
//! Persisted sessions live in SQLite:
//! - Schema migrations via `PRAGMA user_version`
//! - One row per session holding the ledger snapshot as JSON
//! - Summary columns for history listing without decoding snapshots

pub mod repo;
pub mod schema;

pub use repo::{Database, SessionSummary, SnapshotStore};
