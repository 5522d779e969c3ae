//! Live projector
//!
//! Folds channel events into a queryable [`ProjectionSnapshot`]. The fold is
//! deterministic over the event multiset: duplicates and reordering change
//! nothing except first-seen display order and the foreground stream, which
//! [`ProjectionSnapshot::canonical`] leaves out. Stream tokens sent without
//! an index are the one exception; see [`StreamTable`].
//!
//! Merge rules by collection:
//!
//! | Collection | Rule |
//! |------------|------|
//! | Live entities | Field-level overlay, most advanced status wins, first-seen order |
//! | Phase 3 steps | Unique by `step_id`, sorted by `step_id`, newest timestamp wins, content breaks ties |
//! | Scraping items | Keyed by url, field-level overlay; aggregates recomputed from the items |
//! | Expected total | Largest positive value ever seen |
//! | Streams | Tokens keyed by index, unindexed ones appended; status only moves forward |
//! | Conversation | Unique by id, sorted by timestamp, oldest evicted past the cap |
//! | Ledger state | Highest ledger revision wins |
//!
//! The projector never performs I/O.

mod merge;
mod streams;

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::config::ProjectorConfig;
use crate::events::{
    CancellationRecorded, ChannelEvent, ConversationMessageEvent, Phase3StepAdd, ReportUpdated,
    RerunScope, ScrapingItemProgress, StepIteration,
};
use crate::types::{
    CancellationRecord, ConversationMessage, ItemStatus, LiveAction, LiveGoal, LiveInsight,
    LivePlanStep, LiveReportSection, Phase, Phase3Step, PhaseRerunState, ScrapingItem,
    ScrapingStatus, StepRerunState, StreamBuffer,
};

pub use merge::{EntityStore, FieldClocks, LiveRecord, Stamp};
pub use streams::StreamTable;

use merge::{advance, overlay};

/// A step turn that carried both requests and findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepProtocolViolation {
    pub step_id: u32,
    pub iteration: u32,
}

/// Everything a client renders, derived from events only.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProjectionSnapshot {
    pub session_id: Option<String>,
    pub phase: Option<Phase>,
    /// Highest ledger revision observed
    pub revision: u64,

    pub goals: Vec<LiveGoal>,
    pub plan_steps: Vec<LivePlanStep>,
    pub insights: Vec<LiveInsight>,
    pub actions: Vec<LiveAction>,
    pub report_sections: Vec<LiveReportSection>,

    /// Sorted by `step_id`
    pub phase3_steps: Vec<Phase3Step>,

    /// Sorted by item id
    pub scraping_items: Vec<ScrapingItem>,
    pub scraping: ScrapingStatus,

    /// Sorted by id
    pub streams: Vec<StreamBuffer>,
    pub foreground_stream: Option<String>,

    /// Sorted by timestamp, oldest first
    pub conversation: Vec<ConversationMessage>,

    pub phase_rerun: PhaseRerunState,
    pub step_rerun: StepRerunState,

    pub report: Option<String>,
    pub report_stale: bool,

    pub cancelled: bool,
    pub cancellation: Option<CancellationRecord>,

    pub protocol_violations: Vec<StepProtocolViolation>,
}

impl ProjectionSnapshot {
    /// View with arrival-dependent presentation state removed.
    ///
    /// Two folds of the same event multiset always have equal canonical views.
    pub fn canonical(&self) -> ProjectionSnapshot {
        let mut view = self.clone();
        view.goals.sort_by(|a, b| a.id.cmp(&b.id));
        view.plan_steps.sort_by_key(|s| s.step_id);
        view.insights.sort_by(|a, b| a.id.cmp(&b.id));
        view.actions.sort_by(|a, b| a.id.cmp(&b.id));
        view.report_sections.sort_by(|a, b| a.id.cmp(&b.id));
        view.foreground_stream = None;
        for stream in &mut view.streams {
            stream.pinned = false;
        }
        view
    }

    pub fn has_plan(&self) -> bool {
        !self.plan_steps.is_empty()
    }

    /// True when no derived collection holds anything
    pub fn is_blank(&self) -> bool {
        self.goals.is_empty()
            && self.plan_steps.is_empty()
            && self.insights.is_empty()
            && self.actions.is_empty()
            && self.report_sections.is_empty()
            && self.phase3_steps.is_empty()
            && self.scraping_items.is_empty()
            && self.streams.is_empty()
            && self.conversation.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
struct ScrapingSlot {
    link_id: Option<String>,
    status: Option<ItemStatus>,
    stage: Option<String>,
    bytes: Option<u64>,
    word_count: Option<u64>,
    error: Option<String>,
    clocks: FieldClocks,
}

impl ScrapingSlot {
    fn render(&self, url: &str) -> ScrapingItem {
        ScrapingItem {
            id: self.link_id.clone().unwrap_or_else(|| url.to_string()),
            url: url.to_string(),
            status: self.status.unwrap_or_default(),
            stage: self.stage.clone(),
            bytes: self.bytes,
            word_count: self.word_count,
            error: self.error.clone(),
        }
    }
}

/// Folds one session's events into derived state.
#[derive(Debug, Clone)]
pub struct Projector {
    config: ProjectorConfig,
    session_id: Option<String>,
    revision: u64,
    phase: Option<(u64, Phase)>,

    goals: EntityStore<LiveGoal>,
    plan_steps: EntityStore<LivePlanStep>,
    insights: EntityStore<LiveInsight>,
    actions: EntityStore<LiveAction>,
    report_sections: EntityStore<LiveReportSection>,
    iterations: BTreeMap<u32, u32>,
    protocol_violations: BTreeSet<StepProtocolViolation>,

    phase3_steps: BTreeMap<u32, Phase3Step>,

    /// Keyed by url; a producer may send the link id on some events only
    scraping_items: BTreeMap<String, ScrapingSlot>,
    expected_total: Option<u64>,

    streams: StreamTable,
    conversation: BTreeMap<String, ConversationMessage>,

    phase_rerun: Option<(u64, PhaseRerunState)>,
    step_rerun: Option<(u64, StepRerunState)>,
    report: Option<ReportUpdated>,
    cancellation: Option<CancellationRecord>,
    resumed_revision: Option<u64>,
}

impl Default for Projector {
    fn default() -> Self {
        Self::new(&ProjectorConfig::default())
    }
}

impl Projector {
    pub fn new(config: &ProjectorConfig) -> Self {
        Self {
            config: config.clone(),
            session_id: None,
            revision: 0,
            phase: None,
            goals: EntityStore::default(),
            plan_steps: EntityStore::default(),
            insights: EntityStore::default(),
            actions: EntityStore::default(),
            report_sections: EntityStore::default(),
            iterations: BTreeMap::new(),
            protocol_violations: BTreeSet::new(),
            phase3_steps: BTreeMap::new(),
            scraping_items: BTreeMap::new(),
            expected_total: None,
            streams: StreamTable::default(),
            conversation: BTreeMap::new(),
            phase_rerun: None,
            step_rerun: None,
            report: None,
            cancellation: None,
            resumed_revision: None,
        }
    }

    /// Projector already bound to a session
    pub fn for_session(session_id: impl Into<String>, config: &ProjectorConfig) -> Self {
        let mut projector = Self::new(config);
        projector.bind(session_id.into());
        projector
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn bind(&mut self, session_id: String) {
        match &self.session_id {
            None => self.session_id = Some(session_id),
            Some(current) if *current == session_id => {}
            Some(current) => {
                tracing::warn!(
                    bound = %current,
                    received = %session_id,
                    "Ignoring session binding for a different session"
                );
            }
        }
    }

    fn observe_revision(&mut self, revision: u64) {
        self.revision = self.revision.max(revision);
    }

    /// Merge one event.
    pub fn apply(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::SessionBound { session_id } => self.bind(session_id),
            ChannelEvent::PhaseChanged { phase, revision } => {
                self.observe_revision(revision);
                if self.phase.map_or(true, |current| (revision, phase) > current) {
                    self.phase = Some((revision, phase));
                }
            }
            ChannelEvent::StreamStart(start) => self.streams.start(start),
            ChannelEvent::StreamToken(token) => self.streams.token(token),
            ChannelEvent::StreamComplete(complete) => self.streams.complete(complete),
            ChannelEvent::StreamError(error) => self.streams.error(error),
            ChannelEvent::GoalUpdate(update) => self.goals.apply(update),
            ChannelEvent::PlanStepUpdate(update) => self.plan_steps.apply(update),
            ChannelEvent::InsightUpdate(update) => self.insights.apply(update),
            ChannelEvent::ActionUpdate(update) => self.actions.apply(update),
            ChannelEvent::ReportSectionUpdate(update) => self.report_sections.apply(update),
            ChannelEvent::StepIteration(turn) => self.apply_iteration(turn),
            ChannelEvent::Phase3StepAdd(step) => self.apply_phase3_step(step),
            ChannelEvent::ScrapingItemProgress(progress) => self.apply_scraping(progress),
            ChannelEvent::BatchInitialized { expected_total } => {
                // zero or missing never replaces a known denominator
                if let Some(total) = expected_total.filter(|t| *t > 0) {
                    self.expected_total = Some(self.expected_total.unwrap_or(0).max(total));
                }
            }
            ChannelEvent::ReportUpdated(report) => {
                self.observe_revision(report.revision);
                if self.report.as_ref().map_or(true, |r| report.revision > r.revision) {
                    self.report = Some(report);
                }
            }
            ChannelEvent::RerunUpdated(rerun) => {
                self.observe_revision(rerun.revision);
                match rerun.state {
                    RerunScope::Phase(state) => {
                        keep_newest(&mut self.phase_rerun, rerun.revision, state)
                    }
                    RerunScope::Step(state) => {
                        keep_newest(&mut self.step_rerun, rerun.revision, state)
                    }
                }
            }
            ChannelEvent::CancellationRecorded(record) => self.apply_cancellation(record),
            ChannelEvent::SessionResumed { revision } => {
                self.observe_revision(revision);
                self.resumed_revision = self.resumed_revision.max(Some(revision));
            }
            ChannelEvent::ConversationMessage(message) => self.apply_message(message),
        }
    }

    /// Merge a batch of events in the given order.
    pub fn apply_all(&mut self, events: impl IntoIterator<Item = ChannelEvent>) {
        for event in events {
            self.apply(event);
        }
    }

    fn apply_iteration(&mut self, turn: StepIteration) {
        if !turn.is_well_formed() {
            tracing::warn!(
                step_id = turn.step_id,
                iteration = turn.iteration,
                "Step turn carried both requests and findings"
            );
            self.protocol_violations.insert(StepProtocolViolation {
                step_id: turn.step_id,
                iteration: turn.iteration,
            });
        }
        let seen = self.iterations.entry(turn.step_id).or_insert(0);
        *seen = (*seen).max(turn.iteration);
    }

    fn apply_phase3_step(&mut self, add: Phase3StepAdd) {
        let step = Phase3Step::from(add);
        let replace = self
            .phase3_steps
            .get(&step.step_id)
            .map_or(true, |existing| supersedes(&step, existing));
        if replace {
            self.phase3_steps.insert(step.step_id, step);
        }
    }

    fn apply_scraping(&mut self, progress: ScrapingItemProgress) {
        let slot = self.scraping_items.entry(progress.url).or_default();
        let stamp = Stamp::new(None, progress.status.map(|s| s.rank()));
        overlay("link_id", &mut slot.link_id, progress.link_id, stamp, &mut slot.clocks);
        overlay("stage", &mut slot.stage, progress.stage, stamp, &mut slot.clocks);
        overlay("bytes", &mut slot.bytes, progress.bytes, stamp, &mut slot.clocks);
        overlay("word_count", &mut slot.word_count, progress.word_count, stamp, &mut slot.clocks);
        overlay("error", &mut slot.error, progress.error, stamp, &mut slot.clocks);
        advance(&mut slot.status, progress.status, ItemStatus::rank);
    }

    fn apply_cancellation(&mut self, event: CancellationRecorded) {
        self.observe_revision(event.revision);
        let newer = self
            .cancellation
            .as_ref()
            .map_or(true, |c| event.revision > c.revision);
        if newer {
            self.cancellation = Some(CancellationRecord {
                reason: event.reason,
                timestamp: event.timestamp,
                counters: event.counters_snapshot,
                revision: event.revision,
            });
        }
    }

    fn apply_message(&mut self, event: ConversationMessageEvent) {
        let message = ConversationMessage {
            id: event.id,
            role: event.role,
            content: event.content,
            status: event.status,
            timestamp: event.timestamp,
        };
        let replace = match self.conversation.get(&message.id) {
            Some(current) => {
                (message.status.rank(), message.timestamp, &message.content)
                    > (current.status.rank(), current.timestamp, &current.content)
            }
            None => true,
        };
        if replace {
            self.conversation.insert(message.id.clone(), message);
        }

        while self.conversation.len() > self.config.conversation_cap {
            let oldest = self
                .conversation
                .values()
                .min_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)))
                .map(|m| m.id.clone());
            match oldest {
                Some(id) => {
                    self.conversation.remove(&id);
                }
                None => break,
            }
        }
    }

    // ============================================
    // Presentation state
    // ============================================

    /// Switch the foreground stream. Purely local; returns false for unknown ids.
    pub fn select_foreground(&mut self, stream_id: &str) -> bool {
        self.streams.select_foreground(stream_id)
    }

    pub fn pin_stream(&mut self, stream_id: &str, pinned: bool) -> bool {
        self.streams.set_pinned(stream_id, pinned)
    }

    pub fn streams(&self) -> &StreamTable {
        &self.streams
    }

    // ============================================
    // Snapshot
    // ============================================

    pub fn is_cancelled(&self) -> bool {
        match &self.cancellation {
            Some(record) => self.resumed_revision.map_or(true, |r| record.revision > r),
            None => false,
        }
    }

    fn scraping_items(&self) -> Vec<ScrapingItem> {
        let mut items: Vec<ScrapingItem> = self
            .scraping_items
            .iter()
            .map(|(url, slot)| slot.render(url))
            .collect();
        items.sort_by(|a, b| (&a.id, &a.url).cmp(&(&b.id, &b.url)));
        items
    }

    pub fn scraping_status(&self) -> ScrapingStatus {
        ScrapingStatus::from_items(&self.scraping_items(), self.expected_total)
    }

    pub fn snapshot(&self) -> ProjectionSnapshot {
        let scraping_items = self.scraping_items();
        let scraping = ScrapingStatus::from_items(&scraping_items, self.expected_total);

        let plan_steps = self
            .plan_steps
            .ordered()
            .into_iter()
            .map(|mut step| {
                step.iteration = self.iterations.get(&step.step_id).copied();
                step
            })
            .collect();

        let mut conversation: Vec<ConversationMessage> =
            self.conversation.values().cloned().collect();
        conversation.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));

        let (report, report_stale) = match &self.report {
            Some(r) => (r.text.clone(), r.stale),
            None => (None, false),
        };

        ProjectionSnapshot {
            session_id: self.session_id.clone(),
            phase: self.phase.map(|(_, phase)| phase),
            revision: self.revision,
            goals: self.goals.ordered(),
            plan_steps,
            insights: self.insights.ordered(),
            actions: self.actions.ordered(),
            report_sections: self.report_sections.ordered(),
            phase3_steps: self.phase3_steps.values().cloned().collect(),
            scraping_items,
            scraping,
            streams: self.streams.buffers(),
            foreground_stream: self.streams.foreground().map(str::to_string),
            conversation,
            phase_rerun: self
                .phase_rerun
                .as_ref()
                .map(|(_, s)| s.clone())
                .unwrap_or_default(),
            step_rerun: self
                .step_rerun
                .as_ref()
                .map(|(_, s)| s.clone())
                .unwrap_or_default(),
            report,
            report_stale,
            cancelled: self.is_cancelled(),
            cancellation: self.cancellation.clone(),
            protocol_violations: self.protocol_violations.iter().copied().collect(),
        }
    }
}

/// Whether `incoming` replaces `existing` for the same step.
///
/// Newer timestamps win. Equal timestamps fall back to the content so the
/// winner does not depend on arrival order.
fn supersedes(incoming: &Phase3Step, existing: &Phase3Step) -> bool {
    match incoming.timestamp.cmp(&existing.timestamp) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => match incoming.confidence.total_cmp(&existing.confidence) {
            Ordering::Equal => content_key(incoming) > content_key(existing),
            order => order == Ordering::Greater,
        },
    }
}

fn content_key(step: &Phase3Step) -> String {
    serde_json::to_string(&(&step.findings, &step.insights, &step.completion_reason))
        .unwrap_or_default()
}

fn keep_newest<T>(slot: &mut Option<(u64, T)>, revision: u64, state: T) {
    if slot.as_ref().map_or(true, |(current, _)| revision > *current) {
        *slot = Some((revision, state));
    }
}
