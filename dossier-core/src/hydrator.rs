//! Resume/view hydration
//!
//! Rebuilds a live projector from a persisted [`LedgerSnapshot`] instead of
//! the event stream. The snapshot is turned into the events the ledger would
//! have emitted and fed straight into a fresh [`Projector`], so hydrated and
//! live sessions share one merge path.
//!
//! Resume and view build the projector identically; resume additionally
//! returns a [`ResumeCommand`] for the ledger. [`Hydration::install`] makes
//! the hydrated projector the live one, so events the resumed ledger emits
//! merge on top of the stored state.

use serde::Serialize;

use crate::config::ProjectorConfig;
use crate::error::{Error, Result};
use crate::events::{
    CancellationRecorded, ChannelEvent, ConversationMessageEvent, GoalUpdate, Phase3StepAdd,
    PlanStepUpdate, ReportUpdated, RerunScope, RerunUpdated, ScrapingItemProgress,
};
use crate::ledger::{LedgerSnapshot, PhaseLedger};
use crate::projector::{ProjectionSnapshot, Projector};
use crate::registry::SessionRegistry;
use crate::types::{LiveStatus, Phase};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HydrationMode {
    /// Continue active work after hydrating
    Resume,
    /// Read-only view of a stored session
    View,
}

/// Where step execution stands in a stored session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StepProgress {
    pub completed_step_ids: Vec<u32>,
    /// First plan step without findings
    pub next_step_id: Option<u32>,
    pub total_steps: usize,
}

/// Instruction for the ledger after a resume hydration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeCommand {
    pub session_id: String,
    pub phase: Phase,
    pub next_step_id: Option<u32>,
}

impl ResumeCommand {
    /// Lift any cancellation so work can continue.
    pub fn apply(&self, ledger: &mut PhaseLedger) -> Result<()> {
        if ledger.session_id() != self.session_id {
            return Err(Error::SessionNotFound(self.session_id.clone()));
        }
        ledger.resume();
        tracing::info!(
            session_id = %self.session_id,
            phase = %self.phase,
            next_step_id = ?self.next_step_id,
            "Resuming session"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Hydration {
    pub session_id: String,
    pub projector: Projector,
    pub snapshot: ProjectionSnapshot,
    pub phase: Phase,
    /// True when the phase was inferred from artifacts
    pub phase_inferred: bool,
    pub progress: StepProgress,
    pub resume: Option<ResumeCommand>,
}

impl Hydration {
    /// Install the hydrated projector as the session's live projector.
    ///
    /// For a resume hydration `ledger` must be the restored ledger of the
    /// same session; it is resumed before the projector goes live. A view
    /// hydration ignores `ledger`.
    pub fn install(self, registry: &SessionRegistry, ledger: Option<&mut PhaseLedger>) -> Result<()> {
        if let Some(command) = &self.resume {
            let ledger = ledger.ok_or_else(|| Error::SessionNotFound(self.session_id.clone()))?;
            command.apply(ledger)?;
        }
        tracing::debug!(
            session_id = %self.session_id,
            phase = %self.phase,
            "Installing hydrated projector"
        );
        registry.install(&self.session_id, self.projector);
        Ok(())
    }
}

/// Phase of a stored session, inferred when the snapshot lacks one.
///
/// A non-empty plan means planning finished, goals without a plan mean goal
/// discovery finished, anything else has not started research.
pub fn infer_phase(snapshot: &LedgerSnapshot) -> (Phase, bool) {
    if let Some(phase) = snapshot.phase {
        return (phase, false);
    }
    let phase = if !snapshot.plan.is_empty() {
        Phase::Planning
    } else if !snapshot.goals.is_empty() {
        Phase::GoalDiscovery
    } else {
        Phase::Input
    };
    (phase, true)
}

pub fn step_progress(snapshot: &LedgerSnapshot) -> StepProgress {
    let mut completed_step_ids: Vec<u32> = snapshot.steps.iter().map(|s| s.step_id).collect();
    completed_step_ids.sort_unstable();
    completed_step_ids.dedup();
    let next_step_id = snapshot
        .plan
        .iter()
        .map(|s| s.step_id)
        .find(|id| completed_step_ids.binary_search(id).is_err());
    StepProgress {
        completed_step_ids,
        next_step_id,
        total_steps: snapshot.plan.len(),
    }
}

/// Events equivalent to the stored state
fn replay_events(snapshot: &LedgerSnapshot, phase: Phase) -> Vec<ChannelEvent> {
    let revision = snapshot.revision;
    let at = Some(snapshot.updated_at);
    let mut events = vec![
        ChannelEvent::SessionBound {
            session_id: snapshot.session_id.clone(),
        },
        ChannelEvent::PhaseChanged { phase, revision },
        ChannelEvent::BatchInitialized {
            expected_total: snapshot.expected_total,
        },
    ];

    events.extend(snapshot.scraping_items.iter().map(|item| {
        ChannelEvent::ScrapingItemProgress(ScrapingItemProgress {
            link_id: Some(item.id.clone()),
            url: item.url.clone(),
            status: Some(item.status),
            stage: item.stage.clone(),
            bytes: item.bytes,
            word_count: item.word_count,
            error: item.error.clone(),
        })
    }));

    events.extend(snapshot.goals.iter().map(|goal| {
        ChannelEvent::GoalUpdate(GoalUpdate {
            id: goal.id.clone(),
            goal_text: Some(goal.goal_text.clone()),
            rationale: goal.rationale.clone(),
            status: Some(LiveStatus::Ready),
            error: None,
            updated_at: at,
        })
    }));

    // a failure outranks older findings of the same step
    events.extend(snapshot.plan.iter().map(|step| {
        let failure = snapshot
            .failed_steps
            .iter()
            .find(|f| f.step_id == step.step_id);
        let done = snapshot.steps.iter().any(|s| s.step_id == step.step_id);
        let (status, error) = match failure {
            Some(failure) => (LiveStatus::Error, Some(failure.reason.clone())),
            None if done => (LiveStatus::Ready, None),
            None => (LiveStatus::Pending, None),
        };
        ChannelEvent::PlanStepUpdate(PlanStepUpdate {
            step_id: step.step_id,
            goal: Some(step.goal.clone()),
            required_data: step.required_data.clone(),
            chunk_strategy: step.chunk_strategy.clone(),
            status: Some(status),
            error,
            updated_at: at,
            epoch: snapshot.step_epoch(step.step_id),
        })
    }));

    events.extend(
        snapshot
            .steps
            .iter()
            .map(|step| ChannelEvent::Phase3StepAdd(Phase3StepAdd::from(step))),
    );

    if snapshot.report.is_some() || snapshot.report_stale {
        events.push(ChannelEvent::ReportUpdated(ReportUpdated {
            revision,
            text: snapshot.report.as_ref().map(|r| r.text.clone()),
            stale: snapshot.report_stale,
        }));
    }
    if snapshot.phase_rerun.target.is_some() {
        events.push(ChannelEvent::RerunUpdated(RerunUpdated {
            revision,
            state: RerunScope::Phase(snapshot.phase_rerun.clone()),
        }));
    }
    if snapshot.step_rerun.target.is_some() {
        events.push(ChannelEvent::RerunUpdated(RerunUpdated {
            revision,
            state: RerunScope::Step(snapshot.step_rerun.clone()),
        }));
    }

    if let Some(record) = &snapshot.cancellation {
        events.push(ChannelEvent::CancellationRecorded(CancellationRecorded {
            reason: record.reason.clone(),
            timestamp: record.timestamp,
            counters_snapshot: record.counters.clone(),
            revision: record.revision,
        }));
        if !snapshot.cancelled {
            events.push(ChannelEvent::SessionResumed {
                revision: revision.max(record.revision + 1),
            });
        }
    }

    events.extend(snapshot.conversation.iter().map(|message| {
        ChannelEvent::ConversationMessage(ConversationMessageEvent {
            id: message.id.clone(),
            role: message.role,
            content: message.content.clone(),
            status: message.status,
            timestamp: message.timestamp,
        })
    }));

    events
}

/// Build a projector from a stored session.
pub fn hydrate(
    snapshot: &LedgerSnapshot,
    mode: HydrationMode,
    config: &ProjectorConfig,
) -> Hydration {
    let (phase, phase_inferred) = infer_phase(snapshot);
    if phase_inferred {
        tracing::debug!(
            session_id = %snapshot.session_id,
            phase = %phase,
            "Snapshot has no phase, inferred from artifacts"
        );
    }

    let mut projector = Projector::for_session(snapshot.session_id.clone(), config);
    projector.apply_all(replay_events(snapshot, phase));
    let progress = step_progress(snapshot);

    let resume = match mode {
        HydrationMode::Resume => Some(ResumeCommand {
            session_id: snapshot.session_id.clone(),
            phase,
            next_step_id: progress.next_step_id,
        }),
        HydrationMode::View => None,
    };

    Hydration {
        session_id: snapshot.session_id.clone(),
        snapshot: projector.snapshot(),
        projector,
        phase,
        phase_inferred,
        progress,
        resume,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Findings, Phase3Step, PlanStep, ResearchGoal, StepFailure};
    use chrono::Utc;

    fn legacy() -> LedgerSnapshot {
        let mut snapshot = LedgerSnapshot::new("old");
        snapshot.goals = vec![ResearchGoal {
            id: "g1".into(),
            goal_text: "Map competitors".into(),
            rationale: None,
        }];
        snapshot
    }

    fn with_plan(mut snapshot: LedgerSnapshot) -> LedgerSnapshot {
        snapshot.plan = [1, 2, 3]
            .iter()
            .map(|id| PlanStep {
                step_id: *id,
                goal: format!("step {}", id),
                required_data: None,
                chunk_strategy: None,
            })
            .collect();
        snapshot.steps = vec![Phase3Step {
            step_id: 2,
            findings: Findings::default(),
            insights: String::new(),
            confidence: 0.6,
            timestamp: Utc::now(),
            completion_reason: Some("findings".into()),
        }];
        snapshot
    }

    #[test]
    fn test_phase_inference() {
        assert_eq!(infer_phase(&LedgerSnapshot::new("s")), (Phase::Input, true));
        assert_eq!(infer_phase(&legacy()), (Phase::GoalDiscovery, true));
        assert_eq!(infer_phase(&with_plan(legacy())), (Phase::Planning, true));

        let mut explicit = with_plan(legacy());
        explicit.phase = Some(Phase::Synthesis);
        assert_eq!(infer_phase(&explicit), (Phase::Synthesis, false));
    }

    #[test]
    fn test_step_progress() {
        let progress = step_progress(&with_plan(legacy()));
        assert_eq!(progress.completed_step_ids, vec![2]);
        assert_eq!(progress.next_step_id, Some(1));
        assert_eq!(progress.total_steps, 3);
    }

    #[test]
    fn test_resume_and_view_build_the_same_snapshot() {
        let stored = with_plan(legacy());
        let config = ProjectorConfig::default();
        let resumed = hydrate(&stored, HydrationMode::Resume, &config);
        let viewed = hydrate(&stored, HydrationMode::View, &config);

        assert_eq!(resumed.snapshot, viewed.snapshot);
        assert!(viewed.resume.is_none());
        assert_eq!(resumed.resume.as_ref().unwrap().next_step_id, Some(1));
        assert_eq!(resumed.snapshot.phase, Some(Phase::Planning));
        assert_eq!(resumed.snapshot.plan_steps.len(), 3);
        assert_eq!(resumed.snapshot.plan_steps[1].status, LiveStatus::Ready);
    }

    #[test]
    fn test_resume_command_targets_its_session() {
        use crate::channel::RecordingSink;
        use std::sync::Arc;

        let mut ledger = PhaseLedger::new("other", Arc::new(RecordingSink::new()));
        let command = ResumeCommand {
            session_id: "s".into(),
            phase: Phase::Input,
            next_step_id: None,
        };
        assert!(matches!(
            command.apply(&mut ledger),
            Err(Error::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_failed_step_hydrates_as_error() {
        let mut stored = with_plan(legacy());
        stored.step_epochs.insert(3, 5);
        stored.failed_steps = vec![StepFailure {
            step_id: 3,
            reason: "max_iterations_exhausted".into(),
            epoch: 5,
        }];

        let hydration = hydrate(&stored, HydrationMode::View, &ProjectorConfig::default());
        let steps = &hydration.snapshot.plan_steps;
        assert_eq!(steps[0].status, LiveStatus::Pending);
        assert_eq!(steps[1].status, LiveStatus::Ready);
        assert_eq!(steps[2].status, LiveStatus::Error);
        assert_eq!(steps[2].error.as_deref(), Some("max_iterations_exhausted"));
        assert_eq!(
            hydration.snapshot.phase3_steps[0].completion_reason.as_deref(),
            Some("findings")
        );
    }

    #[test]
    fn test_resume_install_needs_the_ledger() {
        let registry = SessionRegistry::default();
        let hydration = hydrate(&legacy(), HydrationMode::Resume, &ProjectorConfig::default());
        assert!(matches!(
            hydration.install(&registry, None),
            Err(Error::SessionNotFound(_))
        ));
        assert!(registry.snapshot("old").is_none());

        let view = hydrate(&legacy(), HydrationMode::View, &ProjectorConfig::default());
        view.install(&registry, None).unwrap();
        assert_eq!(registry.snapshot("old").unwrap().goals.len(), 1);
    }
}
