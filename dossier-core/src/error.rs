//! Error types for dossier-core

use thiserror::Error;

use crate::types::Phase;

/// Main error type for the dossier-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Session not found
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Plan step not found
    #[error("step not found in plan: {0}")]
    StepNotFound(u32),

    /// The session is cancelled and refuses new work
    #[error("session {session_id} is cancelled")]
    Cancelled { session_id: String },

    /// Attempt to move the current phase backwards outside of a rerun
    #[error("cannot move phase from {from} back to {to} without a rerun")]
    PhaseRegression { from: Phase, to: Phase },

    /// A rerun of the same scope is already running
    #[error("rerun already in progress: {0}")]
    RerunInProgress(String),

    /// A phase needs an upstream artifact that does not exist
    #[error("missing artifact for {phase}: {reason}")]
    MissingArtifact { phase: Phase, reason: String },

    /// A step turn broke the request/findings contract
    #[error("step protocol violation: {0}")]
    Protocol(String),

    /// Content retrieval collaborator failed
    #[error("retrieval error: {0}")]
    Retrieval(String),

    /// Step analyst collaborator failed
    #[error("analyst error: {0}")]
    Analyst(String),

    /// Event channel closed or unusable
    #[error("channel error: {0}")]
    Channel(String),
}

/// Result type alias for dossier-core
pub type Result<T> = std::result::Result<T, Error>;
