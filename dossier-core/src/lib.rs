//! # dossier-core
//!
//! Core library for dossier - state synchronization for multi-phase research
//! sessions.
//!
//! This library provides:
//! - Domain types for sessions, phases, live entities, and step results
//! - An event channel with at-least-once delivery
//! - A projector that folds events into an order-independent snapshot
//! - The phase ledger that owns artifacts, reruns, and cancellation
//! - The step execution loop with a bounded worker pool
//! - Hydration of stored sessions and a SQLite snapshot store
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! State flows in one direction:
//! - **Ledger:** authoritative artifacts, mutated only by phase work
//! - **Channel:** events describing every mutation, possibly duplicated or reordered
//! - **Projector:** derived snapshot for clients, built from events only
//!
//! ## Example
//!
//! ```rust,no_run
//! use dossier_core::{Config, Database, SnapshotStore};
//!
//! let config = Config::load().expect("failed to load config");
//!
//! let db = Database::open(&Config::database_path()).expect("failed to open database");
//! db.migrate().expect("failed to run migrations");
//!
//! let stored = db.load_snapshot("session-1").expect("missing session");
//! let view = dossier_core::hydrate(&stored, dossier_core::HydrationMode::View, &config.projector);
//! println!("{:?}", view.snapshot.phase);
//! ```

// Re-export commonly used items at the crate root
pub use channel::{session_channel, ChannelPublisher, ChannelReceiver, EventSink, RecordingSink};
pub use config::Config;
pub use db::{Database, SessionSummary, SnapshotStore};
pub use error::{Error, Result};
pub use events::{ChannelEvent, EventEnvelope};
pub use hydrator::{hydrate, Hydration, HydrationMode, ResumeCommand};
pub use ledger::{LedgerSnapshot, PhaseLedger, RerunOptions};
pub use projector::{ProjectionSnapshot, Projector};
pub use registry::SessionRegistry;
pub use types::*;
pub use validator::{validate, ValidationReport, Violation, ViolationCode};

// Public modules
pub mod channel;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod executor;
pub mod hydrator;
pub mod ledger;
pub mod logging;
pub mod projector;
pub mod registry;
pub mod types;
pub mod validator;
