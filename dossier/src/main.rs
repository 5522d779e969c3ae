//! dossier - diagnostics for research session state
//!
//! Replays recorded event logs through the projector and inspects sessions
//! persisted by the ledger.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/dossier/sessions.db (~/.local/share/dossier/sessions.db)
//! - Logs: $XDG_STATE_HOME/dossier/dossier.log (~/.local/state/dossier/dossier.log)
//! - Config: $XDG_CONFIG_HOME/dossier/config.toml (~/.config/dossier/config.toml)

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use dossier_core::{
    hydrate, session_channel, validator, ChannelEvent, Config, Database, EventEnvelope,
    HydrationMode, ProjectionSnapshot, SessionOutcome, SessionRegistry, SnapshotStore,
};

#[derive(Parser)]
#[command(name = "dossier")]
#[command(about = "Inspect research session state")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fold an event log (one JSON event or envelope per line) into a snapshot
    Replay {
        /// Path to the JSONL event log
        file: PathBuf,

        /// Shuffle events with this seed before folding
        #[arg(long)]
        shuffle_seed: Option<u64>,

        /// Deliver every event twice
        #[arg(long)]
        duplicate: bool,

        /// Print the full snapshot as JSON
        #[arg(long)]
        json: bool,

        /// Exit with an error when validation finds violations
        #[arg(long)]
        strict: bool,
    },

    /// List persisted sessions, newest first
    Sessions {
        /// Only sessions with this outcome (in-progress, completed, cancelled, failed)
        #[arg(long)]
        outcome: Option<String>,
    },

    /// Show a persisted session without resuming it
    Show {
        session_id: String,

        /// Print the full snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete a persisted session
    Delete { session_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard =
        dossier_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("dossier starting");

    match args.command {
        Command::Replay {
            file,
            shuffle_seed,
            duplicate,
            json,
            strict,
        } => replay(&config, &file, shuffle_seed, duplicate, json, strict).await,
        Command::Sessions { outcome } => list_sessions(outcome.as_deref()),
        Command::Show { session_id, json } => show(&config, &session_id, json),
        Command::Delete { session_id } => delete(&session_id),
    }
}

fn open_database() -> Result<Database> {
    let db_path = Config::database_path();
    tracing::info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;
    Ok(db)
}

/// Read events from a JSONL log. Blank lines and `#` comments are skipped.
fn read_events(path: &Path) -> Result<Vec<ChannelEvent>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read event log {}", path.display()))?;

    let mut events = Vec::new();
    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let event = match serde_json::from_str::<EventEnvelope>(line) {
            Ok(envelope) => envelope.event,
            Err(_) => ChannelEvent::from_json(line)
                .with_context(|| format!("invalid event on line {}", number + 1))?,
        };
        events.push(event);
    }
    Ok(events)
}

async fn replay(
    config: &Config,
    path: &Path,
    shuffle_seed: Option<u64>,
    duplicate: bool,
    json: bool,
    strict: bool,
) -> Result<()> {
    let mut events = read_events(path)?;
    if let Some(seed) = shuffle_seed {
        let mut rng = StdRng::seed_from_u64(seed);
        events.shuffle(&mut rng);
    }

    let session_id = events
        .iter()
        .find_map(|event| match event {
            ChannelEvent::SessionBound { session_id } => Some(session_id.clone()),
            _ => None,
        })
        .unwrap_or_else(|| "replay".to_string());

    tracing::info!(
        session_id = %session_id,
        events = events.len(),
        shuffle_seed = ?shuffle_seed,
        duplicate,
        "Replaying event log"
    );

    let registry = SessionRegistry::new(&config.projector);
    let (publisher, receiver) = session_channel(session_id.clone());
    let copies = if duplicate { 2 } else { 1 };
    for event in events {
        publisher.emit_repeated(event, copies)?;
    }
    drop(publisher);
    let stats = receiver.pump(&registry).await;

    let snapshot = registry.snapshot(&session_id).unwrap_or_default();
    let report = validator::sample(&snapshot);

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        println!(
            "Events: {} received, {} retransmitted",
            stats.events_received, stats.duplicates
        );
        print_summary(&snapshot);
        print_validation(&report);
    }

    if strict && !report.is_valid {
        bail!("{} consistency violation(s)", report.violations.len());
    }
    Ok(())
}

fn list_sessions(outcome: Option<&str>) -> Result<()> {
    let outcome = outcome
        .map(|raw| raw.parse::<SessionOutcome>())
        .transpose()
        .map_err(anyhow::Error::msg)?;

    let db = open_database()?;
    let sessions = db
        .list_sessions(outcome)
        .context("failed to list sessions")?;

    if sessions.is_empty() {
        println!("No sessions");
        return Ok(());
    }

    for session in sessions {
        let steps = format!(
            "{}/{}{}",
            session.steps_completed,
            session.steps_total,
            if session.steps_failed > 0 {
                format!(" ({} failed)", session.steps_failed)
            } else {
                String::new()
            }
        );
        println!(
            "{}  {:<11}  {:<12}  {:<14}  {}  {}",
            session.id,
            session.outcome.as_str(),
            session.phase.map(|p| p.as_str()).unwrap_or("-"),
            steps,
            session.updated_at.format("%Y-%m-%d %H:%M"),
            session.user_topic.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn show(config: &Config, session_id: &str, json: bool) -> Result<()> {
    let db = open_database()?;
    let stored = db
        .load_snapshot(session_id)
        .with_context(|| format!("failed to load session {}", session_id))?;

    let view = hydrate(&stored, HydrationMode::View, &config.projector);
    let report = validator::sample(&view.snapshot);

    if json {
        println!("{}", serde_json::to_string_pretty(&view.snapshot)?);
        return Ok(());
    }

    print_summary(&view.snapshot);
    if view.phase_inferred {
        println!("           (phase inferred from artifacts)");
    }
    println!(
        "Progress:  {}/{} steps done, next: {}",
        view.progress.completed_step_ids.len(),
        view.progress.total_steps,
        view.progress
            .next_step_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    print_validation(&report);
    Ok(())
}

fn delete(session_id: &str) -> Result<()> {
    let db = open_database()?;
    if !db
        .delete_session(session_id)
        .context("failed to delete session")?
    {
        bail!("session not found: {}", session_id);
    }
    println!("Deleted {}", session_id);
    Ok(())
}

fn print_summary(snapshot: &ProjectionSnapshot) {
    let scraping = &snapshot.scraping;
    let with_findings = snapshot.phase3_steps.len();

    println!(
        "Session:   {}",
        snapshot.session_id.as_deref().unwrap_or("<unbound>")
    );
    println!(
        "Phase:     {} (revision {})",
        snapshot.phase.map(|p| p.as_str()).unwrap_or("-"),
        snapshot.revision
    );
    println!(
        "Scraping:  {} completed, {} failed of {} ({:.1}%)",
        scraping.completed,
        scraping.failed,
        scraping
            .expected_total
            .map(|n| n as usize)
            .unwrap_or(scraping.total),
        scraping.completion_rate * 100.0
    );
    println!("Goals:     {}", snapshot.goals.len());
    println!(
        "Plan:      {} steps, {} with findings",
        snapshot.plan_steps.len(),
        with_findings
    );
    println!(
        "Streams:   {} (foreground: {})",
        snapshot.streams.len(),
        snapshot.foreground_stream.as_deref().unwrap_or("-")
    );
    let report = match (&snapshot.report, snapshot.report_stale) {
        (Some(_), true) => "present (stale)",
        (Some(_), false) => "present",
        (None, _) => "none",
    };
    println!("Report:    {}", report);
    println!(
        "Cancelled: {}",
        if snapshot.cancelled { "yes" } else { "no" }
    );
}

fn print_validation(report: &dossier_core::ValidationReport) {
    if report.is_valid {
        println!("Validation: ok");
        return;
    }
    println!("Validation: {} violation(s)", report.violations.len());
    for violation in &report.violations {
        println!("  [{}] {}", violation.code.as_str(), violation.message);
    }
}
