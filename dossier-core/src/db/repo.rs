//! Database repository layer
//!
//! Stores and lists persisted session snapshots.

use crate::error::{Error, Result};
use crate::ledger::LedgerSnapshot;
use crate::types::{Phase, SessionOutcome};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Load/save boundary for session snapshots.
pub trait SnapshotStore: Send + Sync {
    /// Stored snapshot for `session_id`, or `SessionNotFound`
    fn load_snapshot(&self, session_id: &str) -> Result<LedgerSnapshot>;

    /// Insert or replace the stored snapshot
    fn save_snapshot(&self, snapshot: &LedgerSnapshot) -> Result<()>;
}

/// Session summary for history listings.
///
/// Read from the summary columns so listing never decodes snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub id: String,
    pub phase: Option<Phase>,
    pub outcome: SessionOutcome,
    pub user_topic: Option<String>,
    pub revision: u64,
    pub steps_total: usize,
    pub steps_completed: usize,
    pub steps_failed: usize,
    pub report_stale: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fixed-width timestamps so text ordering matches time ordering
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Database handle (single connection)
pub struct Database {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn();
        super::schema::run_migrations(&conn)
    }

    // ============================================
    // Session operations
    // ============================================

    /// Sessions newest first, optionally limited to one outcome
    pub fn list_sessions(&self, outcome: Option<SessionOutcome>) -> Result<Vec<SessionSummary>> {
        let conn = self.conn();

        let mut sql = String::from(
            "SELECT id, phase, outcome, user_topic, revision, steps_total, steps_completed,
                    steps_failed, report_stale, created_at, updated_at
             FROM sessions WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![];

        if let Some(outcome) = outcome {
            sql.push_str(" AND outcome = ?");
            params.push(Box::new(outcome.as_str().to_string()));
        }

        sql.push_str(" ORDER BY updated_at DESC, id ASC");

        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = conn.prepare(&sql)?;
        let sessions = stmt
            .query_map(params_refs.as_slice(), Self::row_to_summary)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(sessions)
    }

    /// Remove a session. Returns false when it did not exist.
    pub fn delete_session(&self, session_id: &str) -> Result<bool> {
        let conn = self.conn();
        let removed = conn.execute("DELETE FROM sessions WHERE id = ?", [session_id])?;
        if removed > 0 {
            tracing::info!(session_id, "Deleted session");
        }
        Ok(removed > 0)
    }

    fn row_to_summary(row: &Row) -> rusqlite::Result<SessionSummary> {
        let phase_str: Option<String> = row.get("phase")?;
        let outcome_str: String = row.get("outcome")?;
        let revision: i64 = row.get("revision")?;
        let count = |column: &str| -> rusqlite::Result<usize> {
            let value: i64 = row.get(column)?;
            Ok(value.max(0) as usize)
        };
        let created_at_str: String = row.get("created_at")?;
        let updated_at_str: String = row.get("updated_at")?;

        Ok(SessionSummary {
            id: row.get("id")?,
            phase: phase_str.and_then(|s| s.parse().ok()),
            outcome: SessionOutcome::from_raw(&outcome_str),
            user_topic: row.get("user_topic")?,
            revision: revision.max(0) as u64,
            steps_total: count("steps_total")?,
            steps_completed: count("steps_completed")?,
            steps_failed: count("steps_failed")?,
            report_stale: row.get("report_stale")?,
            created_at: parse_timestamp(&created_at_str),
            updated_at: parse_timestamp(&updated_at_str),
        })
    }
}

impl SnapshotStore for Database {
    fn load_snapshot(&self, session_id: &str) -> Result<LedgerSnapshot> {
        let conn = self.conn();
        let json: Option<String> = conn
            .query_row(
                "SELECT snapshot FROM sessions WHERE id = ?",
                [session_id],
                |row| row.get(0),
            )
            .optional()?;

        match json {
            Some(json) => LedgerSnapshot::from_json(&json),
            None => Err(Error::SessionNotFound(session_id.to_string())),
        }
    }

    fn save_snapshot(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        let json = snapshot.to_json()?;
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO sessions (id, phase, outcome, user_topic, revision,
                                  steps_total, steps_completed, steps_failed, report_stale,
                                  created_at, updated_at, snapshot)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(id) DO UPDATE SET
                phase = excluded.phase,
                outcome = excluded.outcome,
                user_topic = excluded.user_topic,
                revision = excluded.revision,
                steps_total = excluded.steps_total,
                steps_completed = excluded.steps_completed,
                steps_failed = excluded.steps_failed,
                report_stale = excluded.report_stale,
                updated_at = excluded.updated_at,
                snapshot = excluded.snapshot
            "#,
            params![
                snapshot.session_id,
                snapshot.phase.map(|p| p.as_str()),
                snapshot.outcome.as_str(),
                snapshot.user_topic,
                snapshot.revision as i64,
                snapshot.plan.len() as i64,
                snapshot.steps.len() as i64,
                snapshot.failed_steps.len() as i64,
                snapshot.report_stale,
                timestamp(&snapshot.created_at),
                timestamp(&snapshot.updated_at),
                json,
            ],
        )?;
        tracing::debug!(
            session_id = %snapshot.session_id,
            revision = snapshot.revision,
            "Saved session snapshot"
        );
        Ok(())
    }
}
