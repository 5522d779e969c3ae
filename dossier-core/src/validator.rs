//! Consistency validator
//!
//! Checks cross-entity invariants over a [`ProjectionSnapshot`]. Detection
//! only: nothing here mutates state or gates user actions, and the sole
//! visible effect of a violation is a `warn` log line via [`log`].

use std::collections::BTreeSet;

use serde::Serialize;

use crate::projector::ProjectionSnapshot;

/// Invariant that a snapshot broke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationCode {
    /// Goals or a plan exist but no scraping item completed
    ResearchWithoutSources,
    /// Step findings exist without a plan
    StepsWithoutPlan,
    /// A report exists but step findings do not cover the plan
    ReportIncomplete,
    /// Derived collections are populated without a session id
    OrphanedState,
    /// Findings for a step id that is not in the plan
    StepOutsidePlan,
    /// Step confidence outside [0, 1]
    ConfidenceOutOfRange,
    /// A step turn carried both requests and findings
    StepProtocol,
}

impl ViolationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationCode::ResearchWithoutSources => "research_without_sources",
            ViolationCode::StepsWithoutPlan => "steps_without_plan",
            ViolationCode::ReportIncomplete => "report_incomplete",
            ViolationCode::OrphanedState => "orphaned_state",
            ViolationCode::StepOutsidePlan => "step_outside_plan",
            ViolationCode::ConfidenceOutOfRange => "confidence_out_of_range",
            ViolationCode::StepProtocol => "step_protocol",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub code: ViolationCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    pub fn has(&self, code: ViolationCode) -> bool {
        self.violations.iter().any(|v| v.code == code)
    }
}

/// Check every invariant of `snapshot`.
pub fn validate(snapshot: &ProjectionSnapshot) -> ValidationReport {
    let mut violations = Vec::new();
    let mut flag = |code: ViolationCode, message: String| {
        violations.push(Violation { code, message });
    };

    let has_goals = !snapshot.goals.is_empty();
    let has_plan = snapshot.has_plan();

    if (has_goals || has_plan) && snapshot.scraping.completed == 0 {
        flag(
            ViolationCode::ResearchWithoutSources,
            format!(
                "{} goals and {} plan steps exist but no scraping item completed",
                snapshot.goals.len(),
                snapshot.plan_steps.len()
            ),
        );
    }

    if !snapshot.phase3_steps.is_empty() && !has_plan {
        flag(
            ViolationCode::StepsWithoutPlan,
            format!(
                "{} step results exist without a plan",
                snapshot.phase3_steps.len()
            ),
        );
    }

    if snapshot.report.is_some() && has_plan && snapshot.phase3_steps.len() != snapshot.plan_steps.len() {
        flag(
            ViolationCode::ReportIncomplete,
            format!(
                "report covers {} of {} plan steps",
                snapshot.phase3_steps.len(),
                snapshot.plan_steps.len()
            ),
        );
    }

    if snapshot.session_id.is_none() && !snapshot.is_blank() {
        flag(
            ViolationCode::OrphanedState,
            "derived state exists without a session id".to_string(),
        );
    }

    if has_plan {
        let planned: BTreeSet<u32> = snapshot.plan_steps.iter().map(|s| s.step_id).collect();
        for step in &snapshot.phase3_steps {
            if !planned.contains(&step.step_id) {
                flag(
                    ViolationCode::StepOutsidePlan,
                    format!("step {} has findings but is not in the plan", step.step_id),
                );
            }
        }
    }

    for step in &snapshot.phase3_steps {
        if !(0.0..=1.0).contains(&step.confidence) {
            flag(
                ViolationCode::ConfidenceOutOfRange,
                format!("step {} confidence {} outside [0, 1]", step.step_id, step.confidence),
            );
        }
    }

    for turn in &snapshot.protocol_violations {
        flag(
            ViolationCode::StepProtocol,
            format!(
                "step {} iteration {} carried both requests and findings",
                turn.step_id, turn.iteration
            ),
        );
    }

    ValidationReport {
        is_valid: violations.is_empty(),
        violations,
    }
}

/// Emit one warning per violation.
pub fn log(snapshot: &ProjectionSnapshot, report: &ValidationReport) {
    let session_id = snapshot.session_id.as_deref().unwrap_or("<unbound>");
    for violation in &report.violations {
        tracing::warn!(
            session_id = %session_id,
            code = violation.code.as_str(),
            "{}",
            violation.message
        );
    }
}

/// Validate and log in one go; returns the report for diagnostics.
pub fn sample(snapshot: &ProjectionSnapshot) -> ValidationReport {
    let report = validate(snapshot);
    log(snapshot, &report);
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        Findings, ItemStatus, LiveGoal, LivePlanStep, Phase3Step, ScrapingItem, ScrapingStatus,
    };
    use chrono::Utc;

    fn plan(ids: &[u32]) -> Vec<LivePlanStep> {
        ids.iter()
            .map(|id| LivePlanStep {
                step_id: *id,
                ..Default::default()
            })
            .collect()
    }

    fn step(step_id: u32, confidence: f64) -> Phase3Step {
        Phase3Step {
            step_id,
            findings: Findings::default(),
            insights: String::new(),
            confidence,
            timestamp: Utc::now(),
            completion_reason: None,
        }
    }

    fn scraped() -> (Vec<ScrapingItem>, ScrapingStatus) {
        let items = vec![ScrapingItem {
            id: "a".into(),
            status: ItemStatus::Completed,
            ..Default::default()
        }];
        let status = ScrapingStatus::from_items(&items, None);
        (items, status)
    }

    fn base() -> ProjectionSnapshot {
        let (scraping_items, scraping) = scraped();
        ProjectionSnapshot {
            session_id: Some("s".into()),
            scraping_items,
            scraping,
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_snapshot_is_valid() {
        assert!(validate(&ProjectionSnapshot::default()).is_valid);
    }

    #[test]
    fn test_goals_need_completed_scraping() {
        let snapshot = ProjectionSnapshot {
            session_id: Some("s".into()),
            goals: vec![LiveGoal {
                id: "1".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let report = validate(&snapshot);
        assert!(!report.is_valid);
        assert!(report.has(ViolationCode::ResearchWithoutSources));
    }

    #[test]
    fn test_steps_need_plan() {
        let snapshot = ProjectionSnapshot {
            phase3_steps: vec![step(1, 0.5)],
            ..base()
        };
        assert!(validate(&snapshot).has(ViolationCode::StepsWithoutPlan));
    }

    #[test]
    fn test_report_with_missing_steps_is_incomplete() {
        let snapshot = ProjectionSnapshot {
            plan_steps: plan(&[1, 2, 3]),
            phase3_steps: vec![step(1, 0.5), step(2, 0.5)],
            report: Some("report".into()),
            ..base()
        };
        let report = validate(&snapshot);
        assert_eq!(report.violations.len(), 1);
        assert!(report.has(ViolationCode::ReportIncomplete));
    }

    #[test]
    fn test_orphaned_state() {
        let snapshot = ProjectionSnapshot {
            session_id: None,
            ..base()
        };
        assert!(validate(&snapshot).has(ViolationCode::OrphanedState));
    }

    #[test]
    fn test_step_outside_plan_and_bad_confidence() {
        let snapshot = ProjectionSnapshot {
            plan_steps: plan(&[1]),
            phase3_steps: vec![step(1, 1.2), step(4, 0.3)],
            ..base()
        };
        let report = validate(&snapshot);
        assert!(report.has(ViolationCode::StepOutsidePlan));
        assert!(report.has(ViolationCode::ConfidenceOutOfRange));
    }

    #[test]
    fn test_validation_does_not_mutate() {
        let snapshot = ProjectionSnapshot {
            session_id: None,
            ..base()
        };
        let before = snapshot.clone();
        let _ = sample(&snapshot);
        assert_eq!(snapshot, before);
    }
}
