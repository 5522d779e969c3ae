//! Core domain types for dossier
//!
//! These types describe one research session: the phases it moves through,
//! the sources it scrapes, the live entities a client sees while phases
//! stream, and the step findings that feed the final report.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Session** | One research job from input to final report |
//! | **Phase** | A coarse pipeline stage (scraping, goal discovery, planning, step execution, synthesis) |
//! | **Step** | One plan item executed by the step loop; may request more context before finalizing |
//! | **Live entity** | A goal, plan step, insight, action or report section as the client currently sees it |
//! | **Stream buffer** | Accumulated tokens of one streaming model output |
//! | **Stale report** | A final report built from upstream artifacts that have since changed |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================
// Phases
// ============================================

/// Pipeline stage of a session.
///
/// Declaration order is pipeline order, so `Ord` compares by position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    #[serde(rename = "input")]
    Input,
    // source preparation belongs to the scraping stage
    #[serde(rename = "scraping", alias = "phase0")]
    Scraping,
    #[serde(
        rename = "research-0.5",
        alias = "phase0.5",
        alias = "phase0-5",
        alias = "phase0_5"
    )]
    RoleGeneration,
    #[serde(rename = "research-1", alias = "phase1")]
    GoalDiscovery,
    #[serde(rename = "research-2", alias = "phase2")]
    Planning,
    #[serde(rename = "phase3")]
    StepExecution,
    #[serde(rename = "phase4")]
    Synthesis,
    #[serde(rename = "complete")]
    Complete,
}

impl Phase {
    /// All phases in pipeline order
    pub const ALL: [Phase; 8] = [
        Phase::Input,
        Phase::Scraping,
        Phase::RoleGeneration,
        Phase::GoalDiscovery,
        Phase::Planning,
        Phase::StepExecution,
        Phase::Synthesis,
        Phase::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Input => "input",
            Phase::Scraping => "scraping",
            Phase::RoleGeneration => "research-0.5",
            Phase::GoalDiscovery => "research-1",
            Phase::Planning => "research-2",
            Phase::StepExecution => "phase3",
            Phase::Synthesis => "phase4",
            Phase::Complete => "complete",
        }
    }

    /// Phases that produce artifacts and can be rerun
    pub fn is_rerunnable(&self) -> bool {
        !matches!(self, Phase::Input | Phase::Complete)
    }

    /// Phases a rerun of `self` executes.
    ///
    /// With `downstream` the sequence runs from `self` through synthesis,
    /// otherwise it is just `self`.
    pub fn rerun_sequence(&self, downstream: bool) -> Vec<Phase> {
        if !downstream {
            return vec![*self];
        }
        Phase::ALL
            .iter()
            .copied()
            .filter(|p| p.is_rerunnable() && p >= self)
            .collect()
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "input" => Ok(Phase::Input),
            // source preparation belongs to the scraping stage
            "scraping" | "phase0" => Ok(Phase::Scraping),
            "research-0.5" | "phase0.5" | "phase0-5" | "phase0_5" => Ok(Phase::RoleGeneration),
            "research-1" | "phase1" => Ok(Phase::GoalDiscovery),
            "research-2" | "phase2" => Ok(Phase::Planning),
            "phase3" => Ok(Phase::StepExecution),
            "phase4" => Ok(Phase::Synthesis),
            "complete" => Ok(Phase::Complete),
            _ => Err(format!("unknown phase: {}", s)),
        }
    }
}

// ============================================
// Live entities
// ============================================

/// Status shared by the live entity family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveStatus {
    Pending,
    #[default]
    Streaming,
    Error,
    Ready,
}

impl LiveStatus {
    /// Progress rank within one rerun epoch; a merge never lowers it there.
    ///
    /// `Ready` outranks `Error` so a successful retry supersedes a failure.
    /// A newer epoch starts over, see `PlanStepUpdate::epoch`.
    pub fn rank(&self) -> u8 {
        match self {
            LiveStatus::Pending => 0,
            LiveStatus::Streaming => 1,
            LiveStatus::Error => 2,
            LiveStatus::Ready => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LiveStatus::Ready | LiveStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LiveStatus::Pending => "pending",
            LiveStatus::Streaming => "streaming",
            LiveStatus::Error => "error",
            LiveStatus::Ready => "ready",
        }
    }
}

/// A research goal as streamed to the client.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LiveGoal {
    pub id: String,
    pub goal_text: Option<String>,
    pub rationale: Option<String>,
    pub status: LiveStatus,
    pub error: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A plan step as streamed to the client.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LivePlanStep {
    pub step_id: u32,
    pub goal: Option<String>,
    pub required_data: Option<String>,
    pub chunk_strategy: Option<String>,
    /// Turns the step loop has taken so far
    pub iteration: Option<u32>,
    pub status: LiveStatus,
    pub error: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// An insight surfaced while steps run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LiveInsight {
    pub id: String,
    pub step_id: Option<u32>,
    pub content: Option<String>,
    pub status: LiveStatus,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A suggested follow-up action.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LiveAction {
    pub id: String,
    pub label: Option<String>,
    pub detail: Option<String>,
    pub status: LiveStatus,
    pub updated_at: Option<DateTime<Utc>>,
}

/// One section of the report being synthesized.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LiveReportSection {
    pub id: String,
    pub title: Option<String>,
    pub content: Option<String>,
    pub status: LiveStatus,
    pub updated_at: Option<DateTime<Utc>>,
}

// ============================================
// Scraping
// ============================================

/// Status of one scraped source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemStatus {
    #[default]
    Pending,
    InProgress,
    Failed,
    Completed,
}

impl ItemStatus {
    /// Progress rank; a merge never lowers it.
    pub fn rank(&self) -> u8 {
        match self {
            ItemStatus::Pending => 0,
            ItemStatus::InProgress => 1,
            ItemStatus::Failed => 2,
            ItemStatus::Completed => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::InProgress => "in-progress",
            ItemStatus::Failed => "failed",
            ItemStatus::Completed => "completed",
        }
    }
}

/// One source being collected.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScrapingItem {
    /// `link_id` when the producer sent one, otherwise the url
    pub id: String,
    pub url: String,
    pub status: ItemStatus,
    pub stage: Option<String>,
    pub bytes: Option<u64>,
    pub word_count: Option<u64>,
    pub error: Option<String>,
}

/// Aggregate scraping progress, always recomputed from the item list.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScrapingStatus {
    pub total: usize,
    pub expected_total: Option<u64>,
    pub completed: usize,
    pub failed: usize,
    pub in_progress: usize,
    pub pending: usize,
    pub completion_rate: f64,
    pub is_100_percent: bool,
    pub can_proceed_to_research: bool,
}

impl ScrapingStatus {
    /// Derive the aggregate from the authoritative item list.
    pub fn from_items<'a, I>(items: I, expected_total: Option<u64>) -> Self
    where
        I: IntoIterator<Item = &'a ScrapingItem>,
    {
        let mut status = ScrapingStatus {
            expected_total,
            ..Default::default()
        };
        for item in items {
            status.total += 1;
            match item.status {
                ItemStatus::Pending => status.pending += 1,
                ItemStatus::InProgress => status.in_progress += 1,
                ItemStatus::Failed => status.failed += 1,
                ItemStatus::Completed => status.completed += 1,
            }
        }

        let denominator = match expected_total {
            Some(n) if n > 0 => n as usize,
            _ => status.total,
        };
        let finished = status.completed + status.failed;
        if denominator > 0 {
            status.completion_rate = (finished as f64 / denominator as f64).min(1.0);
            status.is_100_percent = finished >= denominator;
        }
        status.can_proceed_to_research = status.is_100_percent;
        status
    }
}

// ============================================
// Streams
// ============================================

/// Status of a stream buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    #[default]
    Active,
    Completed,
    Error,
}

impl StreamStatus {
    pub fn rank(&self) -> u8 {
        match self {
            StreamStatus::Active => 0,
            StreamStatus::Completed => 1,
            StreamStatus::Error => 2,
        }
    }
}

/// Accumulated output of one streaming model call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StreamBuffer {
    pub id: String,
    pub phase: Option<Phase>,
    pub text: String,
    pub token_count: u64,
    pub status: StreamStatus,
    pub error: Option<String>,
    /// Kept visible by the user even after completion
    pub pinned: bool,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_token_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

// ============================================
// Step findings
// ============================================

/// Duplicate findings pruned against earlier steps.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NoveltyReport {
    pub candidate_count: usize,
    pub duplicates_removed: usize,
    #[serde(default)]
    pub pruned: Vec<PrunedFinding>,
}

/// A finding removed because an earlier step already reported it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrunedFinding {
    pub text: String,
    pub matched_text: String,
    pub keyword_overlap: f64,
}

/// Structured findings of one step.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Findings {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub points_of_interest: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub novelty: Option<NoveltyReport>,
}

impl Findings {
    pub fn is_empty(&self) -> bool {
        self.summary.trim().is_empty() && self.points_of_interest.is_empty()
    }
}

/// Compact description of a retrieval request, as carried by `step.iteration`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalRequestSummary {
    pub request_type: String,
    /// Canonical key used to deduplicate requests
    pub key: String,
}

/// Finalized output of one plan step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase3Step {
    pub step_id: u32,
    pub findings: Findings,
    #[serde(default)]
    pub insights: String,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    /// `findings`, or `forced_finalize` when the iteration bound forced the last turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_reason: Option<String>,
}

/// A plan step whose last execution failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step_id: u32,
    pub reason: String,
    /// Rerun epoch the failure belongs to
    #[serde(default)]
    pub epoch: u64,
}

// ============================================
// Plan and goals (ledger artifacts)
// ============================================

/// A research goal produced by goal discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchGoal {
    pub id: String,
    pub goal_text: String,
    #[serde(default)]
    pub rationale: Option<String>,
}

/// One step of the research plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub step_id: u32,
    pub goal: String,
    #[serde(default)]
    pub required_data: Option<String>,
    #[serde(default)]
    pub chunk_strategy: Option<String>,
}

/// The synthesized report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    pub text: String,
    pub produced_at: DateTime<Utc>,
}

// ============================================
// Conversation
// ============================================

/// Author of a conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// Delivery state of a conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Streaming,
    #[default]
    Completed,
    Error,
}

impl MessageStatus {
    pub fn rank(&self) -> u8 {
        match self {
            MessageStatus::Pending => 0,
            MessageStatus::Streaming => 1,
            MessageStatus::Error => 2,
            MessageStatus::Completed => 3,
        }
    }
}

/// One message of the session conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
}

// ============================================
// Session-level state
// ============================================

/// Phase-level rerun bookkeeping.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PhaseRerunState {
    pub in_progress: bool,
    pub target: Option<Phase>,
    #[serde(default)]
    pub sequence: Vec<Phase>,
    #[serde(default)]
    pub downstream: bool,
    pub last_error: Option<String>,
}

/// Step-level rerun bookkeeping, independent of the phase-level one.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StepRerunState {
    pub in_progress: bool,
    pub target: Option<u32>,
    #[serde(default)]
    pub regenerate_report: bool,
    pub last_error: Option<String>,
}

/// Aggregate counters captured when a session is cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CountersSnapshot {
    pub scraping_completed: usize,
    pub scraping_failed: usize,
    pub scraping_in_progress: usize,
    pub goals: usize,
    pub plan_steps: usize,
    pub steps_completed: usize,
}

/// Record of an explicit cancellation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancellationRecord {
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub counters: CountersSnapshot,
    /// Ledger revision at which the cancellation happened
    #[serde(default)]
    pub revision: u64,
}

/// Coarse outcome of a session, used for history listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionOutcome {
    #[default]
    InProgress,
    Completed,
    Cancelled,
    Failed,
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionOutcome::InProgress => "in-progress",
            SessionOutcome::Completed => "completed",
            SessionOutcome::Cancelled => "cancelled",
            SessionOutcome::Failed => "failed",
        }
    }

    /// Map a raw persisted status string; unknown values count as in progress.
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "completed" | "complete" | "done" | "finished" => SessionOutcome::Completed,
            "cancelled" | "canceled" => SessionOutcome::Cancelled,
            "failed" | "error" | "errored" => SessionOutcome::Failed,
            _ => SessionOutcome::InProgress,
        }
    }
}

impl std::fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SessionOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(SessionOutcome::from_raw(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order_and_names() {
        assert!(Phase::Scraping < Phase::Planning);
        assert!(Phase::Synthesis < Phase::Complete);
        for phase in Phase::ALL {
            assert_eq!(phase.as_str().parse::<Phase>().unwrap(), phase);
        }
    }

    #[test]
    fn test_phase_backend_aliases() {
        assert_eq!("phase2".parse::<Phase>().unwrap(), Phase::Planning);
        assert_eq!("phase0_5".parse::<Phase>().unwrap(), Phase::RoleGeneration);
        assert_eq!("Phase0.5".parse::<Phase>().unwrap(), Phase::RoleGeneration);
        assert_eq!("phase0".parse::<Phase>().unwrap(), Phase::Scraping);
        assert!("phase9".parse::<Phase>().is_err());
    }

    #[test]
    fn test_phase_backend_aliases_on_the_wire() {
        let phase: Phase = serde_json::from_str(r#""phase2""#).unwrap();
        assert_eq!(phase, Phase::Planning);
        let phase: Phase = serde_json::from_str(r#""phase0_5""#).unwrap();
        assert_eq!(phase, Phase::RoleGeneration);
        assert_eq!(serde_json::to_string(&Phase::Planning).unwrap(), r#""research-2""#);

        let event = crate::events::ChannelEvent::from_json(
            r#"{"type":"phase.changed","phase":"phase1","revision":2}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            crate::events::ChannelEvent::PhaseChanged {
                phase: Phase::GoalDiscovery,
                revision: 2
            }
        );
    }

    #[test]
    fn test_rerun_sequence() {
        assert_eq!(
            Phase::Planning.rerun_sequence(true),
            vec![Phase::Planning, Phase::StepExecution, Phase::Synthesis]
        );
        assert_eq!(Phase::Planning.rerun_sequence(false), vec![Phase::Planning]);
    }

    #[test]
    fn test_scraping_status_counts_failed_as_finished() {
        let items = vec![
            ScrapingItem {
                id: "a".into(),
                status: ItemStatus::Completed,
                ..Default::default()
            },
            ScrapingItem {
                id: "b".into(),
                status: ItemStatus::Completed,
                ..Default::default()
            },
            ScrapingItem {
                id: "c".into(),
                status: ItemStatus::Failed,
                ..Default::default()
            },
        ];
        let status = ScrapingStatus::from_items(&items, Some(3));
        assert_eq!(status.completed, 2);
        assert_eq!(status.failed, 1);
        assert_eq!(status.completion_rate, 1.0);
        assert!(status.is_100_percent);
        assert!(status.can_proceed_to_research);
    }

    #[test]
    fn test_scraping_status_without_items() {
        let status = ScrapingStatus::from_items(Vec::<ScrapingItem>::new().iter(), None);
        assert_eq!(status.completion_rate, 0.0);
        assert!(!status.can_proceed_to_research);

        // a known denominator keeps the rate below 100% until items arrive
        let items = vec![ScrapingItem {
            id: "a".into(),
            status: ItemStatus::Completed,
            ..Default::default()
        }];
        let status = ScrapingStatus::from_items(&items, Some(4));
        assert_eq!(status.completion_rate, 0.25);
        assert!(!status.is_100_percent);
    }

    #[test]
    fn test_session_outcome_mapping() {
        assert_eq!(SessionOutcome::from_raw("done"), SessionOutcome::Completed);
        assert_eq!(SessionOutcome::from_raw("Canceled"), SessionOutcome::Cancelled);
        assert_eq!(SessionOutcome::from_raw("errored"), SessionOutcome::Failed);
        assert_eq!(SessionOutcome::from_raw("initialized"), SessionOutcome::InProgress);
    }

    #[test]
    fn test_status_ranks() {
        assert!(LiveStatus::Ready.rank() > LiveStatus::Streaming.rank());
        assert!(LiveStatus::Error.rank() > LiveStatus::Pending.rank());
        assert!(ItemStatus::Completed.rank() > ItemStatus::InProgress.rank());
    }
}
