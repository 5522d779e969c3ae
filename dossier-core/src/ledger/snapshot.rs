//! Persisted form of a phase ledger

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::types::{
    CancellationRecord, ConversationMessage, FinalReport, Phase, Phase3Step, PhaseRerunState,
    PlanStep, ResearchGoal, ScrapingItem, SessionOutcome, StepFailure, StepRerunState,
};

fn outcome_from_raw<'de, D>(deserializer: D) -> Result<SessionOutcome, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.as_deref().map(SessionOutcome::from_raw).unwrap_or_default())
}

/// Everything needed to restore or view a session without its event stream.
///
/// Older snapshots may lack `phase`; readers fall back to inferring it from
/// which artifacts exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub session_id: String,
    #[serde(default)]
    pub phase: Option<Phase>,
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub user_topic: Option<String>,
    #[serde(default, deserialize_with = "outcome_from_raw")]
    pub outcome: SessionOutcome,

    #[serde(default)]
    pub scraping_items: Vec<ScrapingItem>,
    #[serde(default)]
    pub expected_total: Option<u64>,
    #[serde(default)]
    pub goals: Vec<ResearchGoal>,
    #[serde(default)]
    pub plan: Vec<PlanStep>,
    #[serde(default)]
    pub steps: Vec<Phase3Step>,
    #[serde(default)]
    pub failed_steps: Vec<StepFailure>,
    #[serde(default)]
    pub report: Option<FinalReport>,

    #[serde(default)]
    pub report_stale: bool,
    #[serde(default)]
    pub stale_phases: Vec<Phase>,
    #[serde(default)]
    pub stale_steps: Vec<u32>,

    #[serde(default)]
    pub phase_rerun: PhaseRerunState,
    #[serde(default)]
    pub step_rerun: StepRerunState,
    /// Revision of the last phase rerun that re-executed the whole plan
    #[serde(default)]
    pub rerun_epoch: u64,
    /// Revision of the last rerun of each single step
    #[serde(default)]
    pub step_epochs: BTreeMap<u32, u64>,

    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub cancellation: Option<CancellationRecord>,

    #[serde(default)]
    pub conversation: Vec<ConversationMessage>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl LedgerSnapshot {
    /// Empty snapshot for a new session
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            phase: None,
            revision: 0,
            user_topic: None,
            outcome: SessionOutcome::InProgress,
            scraping_items: Vec::new(),
            expected_total: None,
            goals: Vec::new(),
            plan: Vec::new(),
            steps: Vec::new(),
            failed_steps: Vec::new(),
            report: None,
            report_stale: false,
            stale_phases: Vec::new(),
            stale_steps: Vec::new(),
            phase_rerun: PhaseRerunState::default(),
            step_rerun: StepRerunState::default(),
            rerun_epoch: 0,
            step_epochs: BTreeMap::new(),
            cancelled: false,
            cancellation: None,
            conversation: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Execution epoch a plan step's status belongs to
    pub fn step_epoch(&self, step_id: u32) -> u64 {
        step_epoch(self.rerun_epoch, &self.step_epochs, step_id)
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

pub(super) fn step_epoch(rerun_epoch: u64, step_epochs: &BTreeMap<u32, u64>, step_id: u32) -> u64 {
    step_epochs
        .get(&step_id)
        .copied()
        .unwrap_or(0)
        .max(rerun_epoch)
}
