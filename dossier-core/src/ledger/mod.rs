//! Phase ledger
//!
//! The ledger is the only writer of a session's current phase and the
//! authority on which artifacts exist. Every mutation bumps a revision
//! counter and is broadcast through an [`EventSink`]; ledger events carry the
//! revision so consumers can order them without clocks.
//!
//! ## Reruns
//!
//! - A phase rerun with `downstream` marks every artifact from the target
//!   onward as stale (never deleted) and reopens the target phase.
//! - A phase rerun without `downstream` touches only the target's artifacts.
//! - A step rerun re-executes one plan step and has its own bookkeeping, so
//!   it can run while a phase rerun is displayed.
//!
//! Every rerun that executes plan steps again opens a new epoch, numbered by
//! the revision that started it. Plan step updates carry their epoch so a
//! client lets the new execution replace the status of the old one.
//!
//! ## Cancellation
//!
//! Cancelling freezes the ledger: counters are captured, the shared
//! [`CancellationToken`] fires, and no new work or phase advancement is
//! accepted. Work already running may still record its results.

mod snapshot;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::channel::EventSink;
use crate::error::{Error, Result};
use crate::events::{
    CancellationRecorded, ChannelEvent, ConversationMessageEvent, GoalUpdate, PlanStepUpdate,
    Phase3StepAdd, ReportUpdated, RerunScope, RerunUpdated, ScrapingItemProgress,
};
use crate::types::{
    CancellationRecord, ConversationMessage, CountersSnapshot, FinalReport, ItemStatus, LiveStatus,
    Phase, Phase3Step, PhaseRerunState, PlanStep, ResearchGoal, ScrapingItem, SessionOutcome,
    StepFailure, StepRerunState,
};

pub use snapshot::LedgerSnapshot;

use snapshot::step_epoch;

/// Options of a phase rerun
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RerunOptions {
    /// Also rerun every later phase through synthesis
    pub downstream: bool,
}

/// Server-side record of one research session.
pub struct PhaseLedger {
    session_id: String,
    sink: Arc<dyn EventSink>,
    revision: u64,
    phase: Phase,
    user_topic: Option<String>,
    outcome: SessionOutcome,

    scraping_items: BTreeMap<String, ScrapingItem>,
    expected_total: Option<u64>,
    goals: Vec<ResearchGoal>,
    plan: Vec<PlanStep>,
    steps: BTreeMap<u32, Phase3Step>,
    failed_steps: BTreeMap<u32, StepFailure>,
    report: Option<FinalReport>,

    report_stale: bool,
    stale_phases: BTreeSet<Phase>,
    stale_steps: BTreeSet<u32>,

    phase_rerun: PhaseRerunState,
    step_rerun: StepRerunState,
    rerun_epoch: u64,
    step_epochs: BTreeMap<u32, u64>,

    cancelled: bool,
    cancellation: Option<CancellationRecord>,
    cancel_token: CancellationToken,

    conversation: Vec<ConversationMessage>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for PhaseLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseLedger")
            .field("session_id", &self.session_id)
            .field("revision", &self.revision)
            .field("phase", &self.phase)
            .field("cancelled", &self.cancelled)
            .finish_non_exhaustive()
    }
}

impl PhaseLedger {
    /// Start a new session at the input phase.
    pub fn new(session_id: impl Into<String>, sink: Arc<dyn EventSink>) -> Self {
        let ledger = Self::from_snapshot(LedgerSnapshot::new(session_id), sink);
        ledger.sink.emit(ChannelEvent::SessionBound {
            session_id: ledger.session_id.clone(),
        });
        tracing::info!(session_id = %ledger.session_id, "Session created");
        ledger
    }

    /// Restore a ledger from its persisted form.
    ///
    /// Reruns that were running when the snapshot was taken did not finish;
    /// they are closed with an error so a new rerun can start.
    pub fn from_snapshot(snapshot: LedgerSnapshot, sink: Arc<dyn EventSink>) -> Self {
        let mut phase_rerun = snapshot.phase_rerun;
        if phase_rerun.in_progress {
            tracing::warn!(
                session_id = %snapshot.session_id,
                rerun_target = ?phase_rerun.target,
                "Phase rerun was interrupted"
            );
            phase_rerun.in_progress = false;
            phase_rerun.last_error = Some("interrupted".to_string());
        }
        let mut step_rerun = snapshot.step_rerun;
        if step_rerun.in_progress {
            tracing::warn!(
                session_id = %snapshot.session_id,
                rerun_target = ?step_rerun.target,
                "Step rerun was interrupted"
            );
            step_rerun.in_progress = false;
            step_rerun.last_error = Some("interrupted".to_string());
        }

        let cancel_token = CancellationToken::new();
        if snapshot.cancelled {
            cancel_token.cancel();
        }

        Self {
            session_id: snapshot.session_id,
            sink,
            revision: snapshot.revision,
            phase: snapshot.phase.unwrap_or(Phase::Input),
            user_topic: snapshot.user_topic,
            outcome: snapshot.outcome,
            scraping_items: snapshot
                .scraping_items
                .into_iter()
                .map(|item| (item.id.clone(), item))
                .collect(),
            expected_total: snapshot.expected_total,
            goals: snapshot.goals,
            plan: snapshot.plan,
            steps: snapshot
                .steps
                .into_iter()
                .map(|step| (step.step_id, step))
                .collect(),
            failed_steps: snapshot
                .failed_steps
                .into_iter()
                .map(|failure| (failure.step_id, failure))
                .collect(),
            report: snapshot.report,
            report_stale: snapshot.report_stale,
            stale_phases: snapshot.stale_phases.into_iter().collect(),
            stale_steps: snapshot.stale_steps.into_iter().collect(),
            phase_rerun,
            step_rerun,
            rerun_epoch: snapshot.rerun_epoch,
            step_epochs: snapshot.step_epochs,
            cancelled: snapshot.cancelled,
            cancellation: snapshot.cancellation,
            cancel_token,
            conversation: snapshot.conversation,
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
        }
    }

    // ============================================
    // Accessors
    // ============================================

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn outcome(&self) -> SessionOutcome {
        self.outcome
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// False once the session is cancelled; checked by the step loop
    pub fn can_start_work(&self) -> bool {
        !self.cancelled
    }

    /// Token that fires when the session is cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn goals(&self) -> &[ResearchGoal] {
        &self.goals
    }

    pub fn plan(&self) -> &[PlanStep] {
        &self.plan
    }

    pub fn steps(&self) -> impl Iterator<Item = &Phase3Step> {
        self.steps.values()
    }

    /// Steps whose last execution failed, by step id
    pub fn failed_steps(&self) -> impl Iterator<Item = &StepFailure> {
        self.failed_steps.values()
    }

    /// Execution epoch of a plan step; zero until a rerun executes it again
    pub fn step_epoch(&self, step_id: u32) -> u64 {
        step_epoch(self.rerun_epoch, &self.step_epochs, step_id)
    }

    pub fn report(&self) -> Option<&FinalReport> {
        self.report.as_ref()
    }

    pub fn is_report_stale(&self) -> bool {
        self.report_stale
    }

    /// Phases whose artifacts predate a rerun
    pub fn stale_phases(&self) -> Vec<Phase> {
        let mut phases = self.stale_phases.clone();
        if !self.stale_steps.is_empty() {
            phases.insert(Phase::StepExecution);
        }
        if self.report_stale {
            phases.insert(Phase::Synthesis);
        }
        phases.into_iter().collect()
    }

    pub fn is_step_stale(&self, step_id: u32) -> bool {
        self.stale_steps.contains(&step_id)
    }

    pub fn phase_rerun(&self) -> &PhaseRerunState {
        &self.phase_rerun
    }

    pub fn step_rerun(&self) -> &StepRerunState {
        &self.step_rerun
    }

    pub fn cancellation(&self) -> Option<&CancellationRecord> {
        self.cancellation.as_ref()
    }

    pub fn set_user_topic(&mut self, topic: impl Into<String>) {
        self.user_topic = Some(topic.into());
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn bump(&mut self) -> u64 {
        self.revision += 1;
        self.touch();
        self.revision
    }

    fn emit(&self, event: ChannelEvent) {
        self.sink.emit(event);
    }

    fn emit_report(&self) {
        self.emit(ChannelEvent::ReportUpdated(ReportUpdated {
            revision: self.revision,
            text: self.report.as_ref().map(|r| r.text.clone()),
            stale: self.report_stale,
        }));
    }

    fn ensure_active(&self) -> Result<()> {
        if self.cancelled {
            return Err(Error::Cancelled {
                session_id: self.session_id.clone(),
            });
        }
        Ok(())
    }

    // ============================================
    // Phase advancement
    // ============================================

    /// Move the session forward to `phase`.
    ///
    /// Moving backwards is only possible through [`PhaseLedger::rerun`].
    pub fn advance(&mut self, phase: Phase) -> Result<()> {
        self.ensure_active()?;
        if phase < self.phase {
            return Err(Error::PhaseRegression {
                from: self.phase,
                to: phase,
            });
        }
        if phase == self.phase {
            return Ok(());
        }
        if phase >= Phase::StepExecution && phase != Phase::Complete && self.plan.is_empty() {
            return Err(Error::MissingArtifact {
                phase,
                reason: "no research plan".to_string(),
            });
        }

        let from = self.phase;
        self.phase = phase;
        if phase == Phase::Complete {
            self.outcome = SessionOutcome::Completed;
        }
        let revision = self.bump();
        tracing::info!(
            session_id = %self.session_id,
            from = %from,
            to = %phase,
            revision,
            "Phase advanced"
        );
        self.emit(ChannelEvent::PhaseChanged { phase, revision });
        Ok(())
    }

    // ============================================
    // Artifacts
    // ============================================

    /// Declare how many sources the scraping batch will produce.
    pub fn initialize_batch(&mut self, expected_total: u64) {
        if expected_total > 0 {
            self.expected_total = Some(expected_total);
        }
        self.touch();
        self.emit(ChannelEvent::BatchInitialized {
            expected_total: Some(expected_total),
        });
    }

    /// Record progress of one source and forward it to clients.
    pub fn record_scraping(&mut self, progress: ScrapingItemProgress) {
        let id = self.scraping_key(&progress);
        let item = self
            .scraping_items
            .entry(id.clone())
            .or_insert_with(|| ScrapingItem {
                id,
                url: progress.url.clone(),
                ..Default::default()
            });
        if let Some(status) = progress.status {
            if status.rank() >= item.status.rank() {
                item.status = status;
            }
        }
        if progress.stage.is_some() {
            item.stage = progress.stage.clone();
        }
        if progress.bytes.is_some() {
            item.bytes = progress.bytes;
        }
        if progress.word_count.is_some() {
            item.word_count = progress.word_count;
        }
        if progress.error.is_some() {
            item.error = progress.error.clone();
        }
        self.touch();
        self.emit(ChannelEvent::ScrapingItemProgress(progress));
    }

    /// Key of the item a progress event belongs to.
    ///
    /// Items are keyed by link id when one is known and by url otherwise. An
    /// item first seen without a link id moves to its link id once an event
    /// carries it, and url-only events find the item through its url.
    fn scraping_key(&mut self, progress: &ScrapingItemProgress) -> String {
        match &progress.link_id {
            Some(link_id) => {
                if !self.scraping_items.contains_key(link_id) {
                    if let Some(item) = self.scraping_items.remove(&progress.url) {
                        self.scraping_items.insert(
                            link_id.clone(),
                            ScrapingItem {
                                id: link_id.clone(),
                                ..item
                            },
                        );
                    }
                }
                link_id.clone()
            }
            None => self
                .scraping_items
                .values()
                .find(|item| item.url == progress.url)
                .map(|item| item.id.clone())
                .unwrap_or_else(|| progress.url.clone()),
        }
    }

    pub fn scraping_items(&self) -> impl Iterator<Item = &ScrapingItem> {
        self.scraping_items.values()
    }

    pub fn record_goals(&mut self, goals: Vec<ResearchGoal>) {
        self.stale_phases.remove(&Phase::GoalDiscovery);
        self.goals = goals;
        self.touch();
        tracing::debug!(session_id = %self.session_id, goals = self.goals.len(), "Goals recorded");
        for goal in &self.goals {
            self.emit(ChannelEvent::GoalUpdate(GoalUpdate {
                id: goal.id.clone(),
                goal_text: Some(goal.goal_text.clone()),
                rationale: goal.rationale.clone(),
                status: Some(LiveStatus::Ready),
                error: None,
                updated_at: Some(self.updated_at),
            }));
        }
    }

    /// Record the research plan.
    ///
    /// Plan steps are announced as pending; the step loop moves them on.
    pub fn record_plan(&mut self, plan: Vec<PlanStep>) {
        self.stale_phases.remove(&Phase::Planning);
        self.plan = plan;
        self.touch();
        tracing::debug!(session_id = %self.session_id, steps = self.plan.len(), "Plan recorded");
        for step in &self.plan {
            self.emit(ChannelEvent::PlanStepUpdate(PlanStepUpdate {
                step_id: step.step_id,
                goal: Some(step.goal.clone()),
                required_data: step.required_data.clone(),
                chunk_strategy: step.chunk_strategy.clone(),
                status: Some(LiveStatus::Pending),
                error: None,
                updated_at: Some(self.updated_at),
                epoch: self.step_epoch(step.step_id),
            }));
        }
    }

    fn emit_step_status(&self, step_id: u32, status: LiveStatus, error: Option<String>) {
        self.emit(ChannelEvent::PlanStepUpdate(PlanStepUpdate {
            step_id,
            status: Some(status),
            error,
            updated_at: Some(self.updated_at),
            epoch: self.step_epoch(step_id),
            ..Default::default()
        }));
    }

    /// Store findings of one step, replacing earlier findings for the same id.
    ///
    /// Accepted after cancellation so in-flight steps keep their results.
    pub fn record_step(&mut self, step: Phase3Step) {
        self.stale_steps.remove(&step.step_id);
        if self.stale_steps.is_empty() {
            self.stale_phases.remove(&Phase::StepExecution);
        }
        self.failed_steps.remove(&step.step_id);
        self.emit(ChannelEvent::Phase3StepAdd(Phase3StepAdd::from(&step)));
        self.steps.insert(step.step_id, step);
        self.touch();
    }

    /// Remember that a step's current execution failed.
    ///
    /// The step loop has already published the error status. Accepted after
    /// cancellation like [`PhaseLedger::record_step`]; earlier findings of
    /// the step are kept.
    pub fn record_step_failure(&mut self, step_id: u32, reason: impl Into<String>) {
        let failure = StepFailure {
            step_id,
            reason: reason.into(),
            epoch: self.step_epoch(step_id),
        };
        tracing::debug!(
            session_id = %self.session_id,
            step_id,
            reason = %failure.reason,
            epoch = failure.epoch,
            "Step failure recorded"
        );
        self.failed_steps.insert(step_id, failure);
        self.touch();
    }

    /// Store a freshly synthesized report; it is no longer stale.
    pub fn record_report(&mut self, text: impl Into<String>) {
        self.report = Some(FinalReport {
            text: text.into(),
            produced_at: Utc::now(),
        });
        self.report_stale = false;
        self.stale_phases.remove(&Phase::Synthesis);
        self.bump();
        tracing::info!(session_id = %self.session_id, revision = self.revision, "Report recorded");
        self.emit_report();
    }

    pub fn add_message(&mut self, message: ConversationMessage) {
        self.emit(ChannelEvent::ConversationMessage(ConversationMessageEvent {
            id: message.id.clone(),
            role: message.role,
            content: message.content.clone(),
            status: message.status,
            timestamp: message.timestamp,
        }));
        match self.conversation.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message,
            None => self.conversation.push(message),
        }
        self.touch();
    }

    // ============================================
    // Reruns
    // ============================================

    /// Reopen `phase` and return the phases the rerun will execute.
    pub fn rerun(&mut self, phase: Phase, options: RerunOptions) -> Result<Vec<Phase>> {
        self.ensure_active()?;
        if !phase.is_rerunnable() {
            return Err(Error::MissingArtifact {
                phase,
                reason: "phase produces no artifacts".to_string(),
            });
        }
        if self.phase_rerun.in_progress {
            return Err(Error::RerunInProgress(format!(
                "phase rerun of {}",
                self.phase_rerun
                    .target
                    .map(|p| p.as_str())
                    .unwrap_or("unknown")
            )));
        }
        match phase {
            Phase::Planning if self.goals.is_empty() => {
                return Err(Error::MissingArtifact {
                    phase,
                    reason: "no research goals".to_string(),
                })
            }
            Phase::StepExecution | Phase::Synthesis if self.plan.is_empty() => {
                return Err(Error::MissingArtifact {
                    phase,
                    reason: "no research plan".to_string(),
                })
            }
            _ => {}
        }

        let sequence = phase.rerun_sequence(options.downstream);
        for target in &sequence {
            self.mark_stale(*target);
        }
        if options.downstream && phase < self.phase {
            self.phase = phase;
        }

        self.phase_rerun = PhaseRerunState {
            in_progress: true,
            target: Some(phase),
            sequence: sequence.clone(),
            downstream: options.downstream,
            last_error: None,
        };
        let revision = self.bump();
        let reexecutes = sequence.contains(&Phase::StepExecution);
        if reexecutes {
            self.rerun_epoch = revision;
            self.failed_steps.clear();
        }
        tracing::info!(
            session_id = %self.session_id,
            phase = %phase,
            downstream = options.downstream,
            revision,
            "Phase rerun started"
        );

        if options.downstream {
            self.emit(ChannelEvent::PhaseChanged {
                phase: self.phase,
                revision,
            });
        }
        self.emit_phase_rerun();
        self.emit_report();
        if reexecutes {
            for step_id in self.plan.iter().map(|s| s.step_id) {
                self.emit_step_status(step_id, LiveStatus::Pending, None);
            }
        }
        Ok(sequence)
    }

    fn mark_stale(&mut self, phase: Phase) {
        match phase {
            Phase::StepExecution => {
                self.stale_steps.extend(self.steps.keys().copied());
                if !self.steps.is_empty() {
                    self.stale_phases.insert(Phase::StepExecution);
                }
            }
            Phase::Synthesis => {
                if self.report.is_some() {
                    self.report_stale = true;
                }
            }
            other => {
                self.stale_phases.insert(other);
            }
        }
    }

    fn emit_phase_rerun(&self) {
        self.emit(ChannelEvent::RerunUpdated(RerunUpdated {
            revision: self.revision,
            state: RerunScope::Phase(self.phase_rerun.clone()),
        }));
    }

    fn emit_step_rerun(&self) {
        self.emit(ChannelEvent::RerunUpdated(RerunUpdated {
            revision: self.revision,
            state: RerunScope::Step(self.step_rerun.clone()),
        }));
    }

    /// Close the running phase rerun.
    ///
    /// A successful rerun that did not regenerate the report leaves the
    /// existing report stale.
    pub fn finish_rerun(&mut self, result: std::result::Result<(), String>) {
        if !self.phase_rerun.in_progress {
            return;
        }
        self.phase_rerun.in_progress = false;
        match result {
            Ok(()) => {
                let regenerated = self.phase_rerun.sequence.contains(&Phase::Synthesis);
                if !regenerated && self.report.is_some() {
                    self.report_stale = true;
                }
                self.phase_rerun.last_error = None;
            }
            Err(error) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    rerun_target = ?self.phase_rerun.target,
                    error = %error,
                    "Phase rerun failed"
                );
                self.phase_rerun.last_error = Some(error);
            }
        }
        self.bump();
        self.emit_phase_rerun();
        self.emit_report();
    }

    /// Start re-executing one plan step.
    pub fn begin_step_rerun(&mut self, step_id: u32, regenerate_report: bool) -> Result<PlanStep> {
        self.ensure_active()?;
        if self.step_rerun.in_progress {
            return Err(Error::RerunInProgress(format!(
                "step rerun of {}",
                self.step_rerun.target.unwrap_or_default()
            )));
        }
        if self.plan.is_empty() {
            return Err(Error::MissingArtifact {
                phase: Phase::StepExecution,
                reason: "no research plan".to_string(),
            });
        }
        let step = self
            .plan
            .iter()
            .find(|s| s.step_id == step_id)
            .cloned()
            .ok_or(Error::StepNotFound(step_id))?;

        if self.steps.contains_key(&step_id) {
            self.stale_steps.insert(step_id);
        }
        self.step_rerun = StepRerunState {
            in_progress: true,
            target: Some(step_id),
            regenerate_report,
            last_error: None,
        };
        let revision = self.bump();
        self.step_epochs.insert(step_id, revision);
        self.failed_steps.remove(&step_id);
        tracing::info!(
            session_id = %self.session_id,
            step_id,
            regenerate_report,
            revision,
            "Step rerun started"
        );
        self.emit_step_rerun();
        self.emit_step_status(step_id, LiveStatus::Pending, None);
        Ok(step)
    }

    /// Close the running step rerun.
    ///
    /// `Ok(report_regenerated)` on success. The report goes stale unless it
    /// was regenerated afterwards.
    pub fn finish_step_rerun(&mut self, result: std::result::Result<bool, String>) {
        if !self.step_rerun.in_progress {
            return;
        }
        self.step_rerun.in_progress = false;
        let mut failed = None;
        match result {
            Ok(report_regenerated) => {
                self.step_rerun.last_error = None;
                if !report_regenerated && self.report.is_some() {
                    self.report_stale = true;
                }
            }
            Err(error) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    step_id = ?self.step_rerun.target,
                    error = %error,
                    "Step rerun failed"
                );
                if let Some(step_id) = self.step_rerun.target {
                    self.record_step_failure(step_id, error.clone());
                    failed = Some((step_id, error.clone()));
                }
                self.step_rerun.last_error = Some(error);
            }
        }
        self.bump();
        self.emit_step_rerun();
        self.emit_report();
        if let Some((step_id, error)) = failed {
            self.emit_step_status(step_id, LiveStatus::Error, Some(error));
        }
    }

    // ============================================
    // Cancellation
    // ============================================

    pub fn counters(&self) -> CountersSnapshot {
        let count = |status: ItemStatus| {
            self.scraping_items
                .values()
                .filter(|item| item.status == status)
                .count()
        };
        CountersSnapshot {
            scraping_completed: count(ItemStatus::Completed),
            scraping_failed: count(ItemStatus::Failed),
            scraping_in_progress: count(ItemStatus::InProgress),
            goals: self.goals.len(),
            plan_steps: self.plan.len(),
            steps_completed: self.steps.len(),
        }
    }

    /// Freeze the session. Cancelling twice keeps the first record.
    pub fn cancel(&mut self, reason: impl Into<String>) -> CancellationRecord {
        if self.cancelled {
            if let Some(record) = &self.cancellation {
                return record.clone();
            }
        }

        self.cancelled = true;
        self.outcome = SessionOutcome::Cancelled;
        self.cancel_token.cancel();
        let revision = self.bump();
        let record = CancellationRecord {
            reason: reason.into(),
            timestamp: self.updated_at,
            counters: self.counters(),
            revision,
        };
        tracing::info!(
            session_id = %self.session_id,
            reason = %record.reason,
            revision,
            "Session cancelled"
        );
        self.emit(ChannelEvent::CancellationRecorded(CancellationRecorded {
            reason: record.reason.clone(),
            timestamp: record.timestamp,
            counters_snapshot: record.counters.clone(),
            revision,
        }));
        self.cancellation = Some(record.clone());
        record
    }

    /// Lift a cancellation. The record stays as history.
    pub fn resume(&mut self) {
        if !self.cancelled {
            return;
        }
        self.cancelled = false;
        self.outcome = if self.phase == Phase::Complete {
            SessionOutcome::Completed
        } else {
            SessionOutcome::InProgress
        };
        self.cancel_token = CancellationToken::new();
        let revision = self.bump();
        tracing::info!(session_id = %self.session_id, revision, "Session resumed");
        self.emit(ChannelEvent::SessionResumed { revision });
    }

    /// Mark the session as failed without touching its artifacts.
    pub fn fail(&mut self, reason: &str) {
        tracing::error!(session_id = %self.session_id, reason = %reason, "Session failed");
        self.outcome = SessionOutcome::Failed;
        self.touch();
    }

    // ============================================
    // Persistence
    // ============================================

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            session_id: self.session_id.clone(),
            phase: Some(self.phase),
            revision: self.revision,
            user_topic: self.user_topic.clone(),
            outcome: self.outcome,
            scraping_items: self.scraping_items.values().cloned().collect(),
            expected_total: self.expected_total,
            goals: self.goals.clone(),
            plan: self.plan.clone(),
            steps: self.steps.values().cloned().collect(),
            failed_steps: self.failed_steps.values().cloned().collect(),
            report: self.report.clone(),
            report_stale: self.report_stale,
            stale_phases: self.stale_phases.iter().copied().collect(),
            stale_steps: self.stale_steps.iter().copied().collect(),
            phase_rerun: self.phase_rerun.clone(),
            step_rerun: self.step_rerun.clone(),
            rerun_epoch: self.rerun_epoch,
            step_epochs: self.step_epochs.clone(),
            cancelled: self.cancelled,
            cancellation: self.cancellation.clone(),
            conversation: self.conversation.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RecordingSink;
    use crate::projector::Projector;
    use crate::types::Findings;

    fn ledger() -> (PhaseLedger, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let ledger = PhaseLedger::new("s1", sink.clone());
        (ledger, sink)
    }

    fn plan(ids: &[u32]) -> Vec<PlanStep> {
        ids.iter()
            .map(|id| PlanStep {
                step_id: *id,
                goal: format!("step {}", id),
                required_data: None,
                chunk_strategy: None,
            })
            .collect()
    }

    fn step(step_id: u32) -> Phase3Step {
        Phase3Step {
            step_id,
            findings: Findings {
                summary: format!("findings {}", step_id),
                ..Default::default()
            },
            insights: String::new(),
            confidence: 0.7,
            timestamp: Utc::now(),
            completion_reason: Some("findings".into()),
        }
    }

    fn goal() -> ResearchGoal {
        ResearchGoal {
            id: "g1".into(),
            goal_text: "Understand churn".into(),
            rationale: None,
        }
    }

    /// Ledger that ran through synthesis with a three-step plan
    fn completed() -> (PhaseLedger, Arc<RecordingSink>) {
        let (mut ledger, sink) = ledger();
        ledger.advance(Phase::Scraping).unwrap();
        ledger.record_goals(vec![goal()]);
        ledger.advance(Phase::GoalDiscovery).unwrap();
        ledger.record_plan(plan(&[1, 2, 3]));
        ledger.advance(Phase::Planning).unwrap();
        ledger.advance(Phase::StepExecution).unwrap();
        for id in [1, 2, 3] {
            ledger.record_step(step(id));
        }
        ledger.advance(Phase::Synthesis).unwrap();
        ledger.record_report("report");
        (ledger, sink)
    }

    #[test]
    fn test_advance_is_monotonic() {
        let (mut ledger, _) = ledger();
        ledger.advance(Phase::GoalDiscovery).unwrap();
        let err = ledger.advance(Phase::Scraping).unwrap_err();
        assert!(matches!(err, Error::PhaseRegression { .. }));
        assert_eq!(ledger.phase(), Phase::GoalDiscovery);
    }

    #[test]
    fn test_step_execution_needs_plan() {
        let (mut ledger, _) = ledger();
        let err = ledger.advance(Phase::StepExecution).unwrap_err();
        assert!(matches!(err, Error::MissingArtifact { .. }));
    }

    #[test]
    fn test_downstream_rerun_marks_report_stale_and_keeps_steps() {
        let (mut ledger, _) = completed();
        let sequence = ledger
            .rerun(Phase::Planning, RerunOptions { downstream: true })
            .unwrap();

        assert_eq!(
            sequence,
            vec![Phase::Planning, Phase::StepExecution, Phase::Synthesis]
        );
        assert!(ledger.is_report_stale());
        assert_eq!(ledger.steps().count(), 3);
        assert!(ledger.is_step_stale(2));
        assert_eq!(ledger.phase(), Phase::Planning);
        assert!(ledger.phase_rerun().in_progress);
    }

    #[test]
    fn test_synthesis_only_rerun_leaves_upstream_alone() {
        let (mut ledger, _) = completed();
        ledger
            .rerun(Phase::Synthesis, RerunOptions { downstream: false })
            .unwrap();

        assert!(ledger.is_report_stale());
        assert_eq!(ledger.stale_phases(), vec![Phase::Synthesis]);
        assert_eq!(ledger.phase(), Phase::Synthesis);

        ledger.record_report("new report");
        ledger.finish_rerun(Ok(()));
        assert!(!ledger.is_report_stale());
        assert!(ledger.stale_phases().is_empty());
    }

    #[test]
    fn test_non_report_rerun_leaves_report_stale() {
        let (mut ledger, _) = completed();
        ledger
            .rerun(Phase::GoalDiscovery, RerunOptions { downstream: false })
            .unwrap();
        assert!(!ledger.is_report_stale());
        ledger.record_goals(vec![goal()]);
        ledger.finish_rerun(Ok(()));
        assert!(ledger.is_report_stale());
    }

    #[test]
    fn test_second_phase_rerun_is_rejected() {
        let (mut ledger, _) = completed();
        ledger
            .rerun(Phase::Synthesis, RerunOptions::default())
            .unwrap();
        let err = ledger
            .rerun(Phase::Planning, RerunOptions { downstream: true })
            .unwrap_err();
        assert!(matches!(err, Error::RerunInProgress(_)));
    }

    #[test]
    fn test_step_rerun_is_independent_of_phase_rerun() {
        let (mut ledger, _) = completed();
        ledger
            .rerun(Phase::Synthesis, RerunOptions::default())
            .unwrap();
        let planned = ledger.begin_step_rerun(2, true).unwrap();
        assert_eq!(planned.step_id, 2);
        assert!(ledger.phase_rerun().in_progress);
        assert!(ledger.step_rerun().in_progress);
        assert_eq!(ledger.step_rerun().target, Some(2));
    }

    #[test]
    fn test_step_rerun_requires_planned_step() {
        let (mut ledger, _) = ledger();
        assert!(matches!(
            ledger.begin_step_rerun(1, false).unwrap_err(),
            Error::MissingArtifact { .. }
        ));

        let (mut ledger, _) = completed();
        assert!(matches!(
            ledger.begin_step_rerun(9, false).unwrap_err(),
            Error::StepNotFound(9)
        ));
    }

    #[test]
    fn test_step_rerun_without_regeneration_stales_report() {
        let (mut ledger, _) = completed();
        ledger.begin_step_rerun(1, false).unwrap();
        ledger.record_step(step(1));
        ledger.finish_step_rerun(Ok(false));
        assert!(ledger.is_report_stale());
        assert!(!ledger.is_step_stale(1));
    }

    #[test]
    fn test_cancel_freezes_advancement() {
        let (mut ledger, sink) = ledger();
        ledger.advance(Phase::Scraping).unwrap();
        let token = ledger.cancellation_token();

        let record = ledger.cancel("user request");
        assert!(token.is_cancelled());
        assert!(!ledger.can_start_work());
        assert_eq!(ledger.outcome(), SessionOutcome::Cancelled);
        assert_eq!(record.revision, ledger.revision());
        assert!(matches!(
            ledger.advance(Phase::GoalDiscovery).unwrap_err(),
            Error::Cancelled { .. }
        ));

        // in-flight results are still accepted
        ledger.record_goals(vec![goal()]);
        assert_eq!(ledger.goals().len(), 1);

        let again = ledger.cancel("second");
        assert_eq!(again.reason, "user request");
        let cancellations = sink
            .events()
            .into_iter()
            .filter(|e| e.kind() == "cancellation.recorded")
            .count();
        assert_eq!(cancellations, 1);
    }

    #[test]
    fn test_resume_after_cancel() {
        let (mut ledger, sink) = ledger();
        ledger.cancel("pause");
        ledger.resume();

        assert!(ledger.can_start_work());
        assert!(!ledger.cancellation_token().is_cancelled());
        assert!(ledger.cancellation().is_some());
        assert_eq!(ledger.outcome(), SessionOutcome::InProgress);
        assert_eq!(
            sink.events().last(),
            Some(&ChannelEvent::SessionResumed {
                revision: ledger.revision()
            })
        );
    }

    #[test]
    fn test_snapshot_restore_closes_interrupted_reruns() {
        let (mut ledger, _) = completed();
        ledger.begin_step_rerun(3, true).unwrap();
        let snapshot = ledger.snapshot();

        let restored = PhaseLedger::from_snapshot(snapshot, Arc::new(RecordingSink::new()));
        assert!(!restored.step_rerun().in_progress);
        assert_eq!(restored.step_rerun().last_error.as_deref(), Some("interrupted"));
        assert_eq!(restored.phase(), Phase::Synthesis);
        assert_eq!(restored.steps().count(), 3);
    }

    fn progress(link_id: Option<&str>, url: &str, status: ItemStatus) -> ScrapingItemProgress {
        ScrapingItemProgress {
            link_id: link_id.map(String::from),
            url: url.to_string(),
            status: Some(status),
            ..Default::default()
        }
    }

    #[test]
    fn test_scraping_item_is_found_by_url_or_link_id() {
        let (mut ledger, _) = ledger();
        ledger.record_scraping(progress(Some("a"), "https://x/1", ItemStatus::InProgress));
        ledger.record_scraping(progress(None, "https://x/1", ItemStatus::Completed));

        let counters = ledger.counters();
        assert_eq!(ledger.scraping_items().count(), 1);
        assert_eq!(counters.scraping_completed, 1);
        assert_eq!(counters.scraping_in_progress, 0);

        // url first, link id later
        ledger.record_scraping(progress(None, "https://x/2", ItemStatus::InProgress));
        ledger.record_scraping(progress(Some("b"), "https://x/2", ItemStatus::Failed));
        let ids: Vec<&str> = ledger.scraping_items().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(ledger.counters().scraping_failed, 1);
    }

    #[test]
    fn test_step_rerun_ending_in_error_is_shown_as_error() {
        let (mut ledger, sink) = completed();
        ledger.begin_step_rerun(2, false).unwrap();
        let epoch = ledger.step_epoch(2);
        assert_eq!(epoch, ledger.revision());
        assert_eq!(ledger.step_epoch(1), 0);

        ledger.finish_step_rerun(Err("max_iterations_exhausted".into()));

        let failures: Vec<&StepFailure> = ledger.failed_steps().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].step_id, 2);
        assert_eq!(failures[0].epoch, epoch);

        let mut projector = Projector::default();
        projector.apply_all(sink.events());
        let snapshot = projector.snapshot();
        let step = snapshot.plan_steps.iter().find(|s| s.step_id == 2).unwrap();
        assert_eq!(step.status, LiveStatus::Error);
        assert_eq!(step.error.as_deref(), Some("max_iterations_exhausted"));

        // the same events in reverse still show the error
        let mut reversed = Projector::default();
        reversed.apply_all(sink.events().into_iter().rev());
        assert_eq!(reversed.snapshot().canonical(), snapshot.canonical());
    }

    #[test]
    fn test_downstream_rerun_reopens_every_plan_step() {
        let (mut ledger, sink) = completed();
        ledger.record_step_failure(3, "analyst unavailable");
        ledger
            .rerun(Phase::StepExecution, RerunOptions { downstream: true })
            .unwrap();
        assert_eq!(ledger.step_epoch(1), ledger.revision());
        assert_eq!(ledger.failed_steps().count(), 0);

        let mut projector = Projector::default();
        projector.apply_all(sink.events());
        assert!(projector
            .snapshot()
            .plan_steps
            .iter()
            .all(|s| s.status == LiveStatus::Pending));
    }

    #[test]
    fn test_recorded_step_clears_failure() {
        let (mut ledger, _) = completed();
        ledger.record_step_failure(1, "boom");
        assert_eq!(ledger.failed_steps().count(), 1);
        let restored =
            PhaseLedger::from_snapshot(ledger.snapshot(), Arc::new(RecordingSink::new()));
        assert_eq!(restored.failed_steps().count(), 1);

        ledger.record_step(step(1));
        assert_eq!(ledger.failed_steps().count(), 0);
    }
}
