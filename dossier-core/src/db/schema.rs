//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: sessions with their ledger snapshot
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        id               TEXT PRIMARY KEY,
        phase            TEXT,
        outcome          TEXT NOT NULL,
        user_topic       TEXT,
        revision         INTEGER NOT NULL DEFAULT 0,
        created_at       DATETIME NOT NULL,
        updated_at       DATETIME NOT NULL,

        -- Full ledger snapshot
        snapshot         JSON NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at DESC);
    "#,
    // Version 2: step progress summary and outcome filter for history listing
    r#"
    ALTER TABLE sessions ADD COLUMN steps_total INTEGER NOT NULL DEFAULT 0;
    ALTER TABLE sessions ADD COLUMN steps_completed INTEGER NOT NULL DEFAULT 0;
    ALTER TABLE sessions ADD COLUMN steps_failed INTEGER NOT NULL DEFAULT 0;
    ALTER TABLE sessions ADD COLUMN report_stale INTEGER NOT NULL DEFAULT 0;

    CREATE INDEX IF NOT EXISTS idx_sessions_outcome ON sessions(outcome, updated_at DESC);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute_batch(&format!("PRAGMA user_version = {}", version))?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}
