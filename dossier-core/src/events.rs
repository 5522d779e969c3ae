//! Channel events
//!
//! Every message that crosses the event channel is one variant of
//! [`ChannelEvent`]. The wire form is JSON with a `type` tag
//! (`"stream.token"`, `"goal.update"`, ...). Field names are snake_case;
//! the camelCase spellings some producers use are accepted as aliases.
//!
//! ## Partial updates
//!
//! Entity updates (`goal.update`, `plan_step.update`, ...) are patches: every
//! domain field is optional and an absent field means "unchanged", never
//! "reset". The projector relies on this to merge duplicated and reordered
//! events without losing information.
//!
//! ## Ordering signals
//!
//! The transport gives no ordering guarantee, so ledger-originated events
//! carry the ledger `revision` at which they were produced. Consumers keep the
//! highest revision they have seen instead of the latest arrival.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{
    CountersSnapshot, Findings, ItemStatus, LiveStatus, MessageRole, MessageStatus, Phase,
    Phase3Step, PhaseRerunState, RetrievalRequestSummary, StepRerunState,
};

/// Closed set of events carried by the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChannelEvent {
    #[serde(rename = "session.bound")]
    SessionBound { session_id: String },

    #[serde(rename = "phase.changed")]
    PhaseChanged { phase: Phase, revision: u64 },

    #[serde(rename = "stream.start")]
    StreamStart(StreamStart),

    #[serde(rename = "stream.token")]
    StreamToken(StreamToken),

    #[serde(rename = "stream.complete")]
    StreamComplete(StreamComplete),

    #[serde(rename = "stream.error")]
    StreamError(StreamError),

    #[serde(rename = "goal.update")]
    GoalUpdate(GoalUpdate),

    #[serde(rename = "plan_step.update")]
    PlanStepUpdate(PlanStepUpdate),

    #[serde(rename = "insight.update")]
    InsightUpdate(InsightUpdate),

    #[serde(rename = "action.update")]
    ActionUpdate(ActionUpdate),

    #[serde(rename = "report_section.update")]
    ReportSectionUpdate(ReportSectionUpdate),

    #[serde(rename = "step.iteration")]
    StepIteration(StepIteration),

    #[serde(rename = "phase3_step.add")]
    Phase3StepAdd(Phase3StepAdd),

    #[serde(rename = "scraping_item.progress")]
    ScrapingItemProgress(ScrapingItemProgress),

    #[serde(rename = "batch.initialized")]
    BatchInitialized {
        #[serde(default, alias = "expectedTotal")]
        expected_total: Option<u64>,
    },

    #[serde(rename = "report.updated")]
    ReportUpdated(ReportUpdated),

    #[serde(rename = "rerun.updated")]
    RerunUpdated(RerunUpdated),

    #[serde(rename = "cancellation.recorded")]
    CancellationRecorded(CancellationRecorded),

    #[serde(rename = "session.resumed")]
    SessionResumed { revision: u64 },

    #[serde(rename = "conversation.message")]
    ConversationMessage(ConversationMessageEvent),
}

impl ChannelEvent {
    /// Wire name of the event
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelEvent::SessionBound { .. } => "session.bound",
            ChannelEvent::PhaseChanged { .. } => "phase.changed",
            ChannelEvent::StreamStart(_) => "stream.start",
            ChannelEvent::StreamToken(_) => "stream.token",
            ChannelEvent::StreamComplete(_) => "stream.complete",
            ChannelEvent::StreamError(_) => "stream.error",
            ChannelEvent::GoalUpdate(_) => "goal.update",
            ChannelEvent::PlanStepUpdate(_) => "plan_step.update",
            ChannelEvent::InsightUpdate(_) => "insight.update",
            ChannelEvent::ActionUpdate(_) => "action.update",
            ChannelEvent::ReportSectionUpdate(_) => "report_section.update",
            ChannelEvent::StepIteration(_) => "step.iteration",
            ChannelEvent::Phase3StepAdd(_) => "phase3_step.add",
            ChannelEvent::ScrapingItemProgress(_) => "scraping_item.progress",
            ChannelEvent::BatchInitialized { .. } => "batch.initialized",
            ChannelEvent::ReportUpdated(_) => "report.updated",
            ChannelEvent::RerunUpdated(_) => "rerun.updated",
            ChannelEvent::CancellationRecorded(_) => "cancellation.recorded",
            ChannelEvent::SessionResumed { .. } => "session.resumed",
            ChannelEvent::ConversationMessage(_) => "conversation.message",
        }
    }

    /// Parse one event from its JSON form
    pub fn from_json(line: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

// ============================================
// Streams
// ============================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStart {
    #[serde(alias = "streamId")]
    pub stream_id: String,
    #[serde(default)]
    pub phase: Option<Phase>,
    #[serde(default)]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamToken {
    #[serde(alias = "streamId")]
    pub stream_id: String,
    pub token: String,
    /// Position of the token in the stream; makes retransmits idempotent
    #[serde(default)]
    pub index: Option<u64>,
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
}

/// Terminal status reported by `stream.complete`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    #[default]
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamComplete {
    #[serde(alias = "streamId")]
    pub stream_id: String,
    #[serde(default)]
    pub status: CompletionStatus,
    #[serde(default)]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamError {
    #[serde(alias = "streamId")]
    pub stream_id: String,
    pub error: String,
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
}

// ============================================
// Entity patches
// ============================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GoalUpdate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<LiveStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, alias = "updatedAt", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanStepUpdate {
    pub step_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<LiveStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, alias = "updatedAt", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Ledger revision that started the execution this update belongs to.
    ///
    /// Zero for the first run. A rerun raises it, and updates from a newer
    /// epoch replace the status of older ones even when it ranks lower.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub epoch: u64,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InsightUpdate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<LiveStatus>,
    #[serde(default, alias = "updatedAt", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ActionUpdate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<LiveStatus>,
    #[serde(default, alias = "updatedAt", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReportSectionUpdate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<LiveStatus>,
    #[serde(default, alias = "updatedAt", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

// ============================================
// Step events
// ============================================

/// One turn of the step loop.
///
/// A turn either asks for more context or reports findings; never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepIteration {
    pub step_id: u32,
    pub iteration: u32,
    #[serde(default)]
    pub requests: Vec<RetrievalRequestSummary>,
    #[serde(default)]
    pub findings: Option<Findings>,
}

impl StepIteration {
    /// True when the turn honours the request/findings exclusion.
    pub fn is_well_formed(&self) -> bool {
        !(self.findings.is_some() && !self.requests.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase3StepAdd {
    pub step_id: u32,
    pub findings: Findings,
    #[serde(default)]
    pub insights: String,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, alias = "completionReason", skip_serializing_if = "Option::is_none")]
    pub completion_reason: Option<String>,
}

impl From<Phase3StepAdd> for Phase3Step {
    fn from(add: Phase3StepAdd) -> Self {
        Phase3Step {
            step_id: add.step_id,
            findings: add.findings,
            insights: add.insights,
            confidence: add.confidence,
            timestamp: add.timestamp,
            completion_reason: add.completion_reason,
        }
    }
}

impl From<&Phase3Step> for Phase3StepAdd {
    fn from(step: &Phase3Step) -> Self {
        Phase3StepAdd {
            step_id: step.step_id,
            findings: step.findings.clone(),
            insights: step.insights.clone(),
            confidence: step.confidence,
            timestamp: step.timestamp,
            completion_reason: step.completion_reason.clone(),
        }
    }
}

// ============================================
// Scraping
// ============================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScrapingItemProgress {
    #[serde(default, alias = "linkId")]
    pub link_id: Option<String>,
    pub url: String,
    #[serde(default)]
    pub status: Option<ItemStatus>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub bytes: Option<u64>,
    #[serde(default, alias = "wordCount")]
    pub word_count: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}



// ============================================
// Ledger events
// ============================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportUpdated {
    pub revision: u64,
    /// Report text when a report exists
    #[serde(default)]
    pub text: Option<String>,
    pub stale: bool,
}

/// Which rerun bookkeeping a `rerun.updated` event carries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum RerunScope {
    Phase(PhaseRerunState),
    Step(StepRerunState),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerunUpdated {
    pub revision: u64,
    pub state: RerunScope,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancellationRecorded {
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    #[serde(alias = "countersSnapshot")]
    pub counters_snapshot: CountersSnapshot,
    #[serde(default)]
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessageEvent {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
}

// ============================================
// Envelope
// ============================================

/// An event as sent over one connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub session_id: String,
    /// When the producer emitted the event
    pub emitted_at: DateTime<Utc>,
    /// Content-based hash for retransmit telemetry (32-char hex)
    pub event_hash: String,
    pub event: ChannelEvent,
}

impl EventEnvelope {
    pub fn new(session_id: impl Into<String>, event: ChannelEvent) -> Self {
        let event_hash = compute_event_hash(&event);
        Self {
            session_id: session_id.into(),
            emitted_at: Utc::now(),
            event_hash,
            event,
        }
    }
}

/// Compute a content-based hash of an event
///
/// Returns a 32-character hex digest of SHA-256(kind + payload). The emit
/// time is not part of the input, so a retransmit hashes identically.
pub fn compute_event_hash(event: &ChannelEvent) -> String {
    let content = serde_json::to_string(event).unwrap_or_default();
    let hash_input = format!("{}:{}", event.kind(), content);

    let mut hasher = Sha256::new();
    hasher.update(hash_input.as_bytes());
    let result = hasher.finalize();

    // Take first 16 bytes (32 hex chars)
    hex::encode(&result[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tagged_events() {
        let event = ChannelEvent::from_json(
            r#"{"type":"goal.update","id":"1","goal_text":"X"}"#,
        )
        .unwrap();
        match event {
            ChannelEvent::GoalUpdate(update) => {
                assert_eq!(update.id, "1");
                assert_eq!(update.goal_text.as_deref(), Some("X"));
                assert!(update.status.is_none());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_camel_case_aliases() {
        let event = ChannelEvent::from_json(
            r#"{"type":"stream.token","streamId":"s1","token":"he","index":0}"#,
        )
        .unwrap();
        assert_eq!(event.kind(), "stream.token");

        let event =
            ChannelEvent::from_json(r#"{"type":"batch.initialized","expectedTotal":3}"#).unwrap();
        assert_eq!(
            event,
            ChannelEvent::BatchInitialized {
                expected_total: Some(3)
            }
        );
    }

    #[test]
    fn test_missing_expected_total_is_none() {
        let event = ChannelEvent::from_json(r#"{"type":"batch.initialized"}"#).unwrap();
        assert_eq!(
            event,
            ChannelEvent::BatchInitialized {
                expected_total: None
            }
        );
    }

    #[test]
    fn test_unknown_event_type_is_rejected() {
        assert!(ChannelEvent::from_json(r#"{"type":"goal.delete","id":"1"}"#).is_err());
    }

    #[test]
    fn test_event_hash_ignores_emit_time() {
        let event = ChannelEvent::SessionResumed { revision: 4 };
        let first = EventEnvelope::new("s", event.clone());
        let second = EventEnvelope::new("s", event);
        assert_eq!(first.event_hash, second.event_hash);
        assert_eq!(first.event_hash.len(), 32);
    }

    #[test]
    fn test_step_iteration_exclusion() {
        let turn = StepIteration {
            step_id: 1,
            iteration: 1,
            requests: vec![RetrievalRequestSummary {
                request_type: "semantic".into(),
                key: "k".into(),
            }],
            findings: Some(Findings::default()),
        };
        assert!(!turn.is_well_formed());
    }

    #[test]
    fn test_rerun_scope_wire_form() {
        let event = ChannelEvent::RerunUpdated(RerunUpdated {
            revision: 2,
            state: RerunScope::Step(StepRerunState {
                in_progress: true,
                target: Some(3),
                regenerate_report: true,
                last_error: None,
            }),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "rerun.updated");
        assert_eq!(json["state"]["scope"], "step");
        assert_eq!(json["state"]["target"], 3);
    }
}
