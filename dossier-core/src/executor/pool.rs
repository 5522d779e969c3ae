//! Bounded worker pool over plan steps
//!
//! Steps are dispatched in plan order with at most `max_parallel_steps`
//! running at once; they may finish in any order. Each step runs on the
//! blocking pool because analysts and retrievers are synchronous.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::ledger::PhaseLedger;
use crate::types::PlanStep;

use super::novelty::NoveltyDigest;
use super::step::{StepOutcome, StepRunner};

/// What happened to each step of a pool run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolReport {
    pub completed: Vec<u32>,
    pub failed: Vec<(u32, String)>,
    /// Stopped at an iteration boundary after cancellation
    pub cancelled: Vec<u32>,
    /// Never started because the session was cancelled first
    pub skipped: Vec<u32>,
}

impl PoolReport {
    fn sort(&mut self) {
        self.completed.sort_unstable();
        self.failed.sort_by_key(|(id, _)| *id);
        self.cancelled.sort_unstable();
        self.skipped.sort_unstable();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Reason recorded for a step whose worker panicked
pub const PANICKED: &str = "panicked";

/// Execute `steps` and record every finalized or failed step in the ledger.
///
/// A failing step never affects the others, including one whose worker
/// panics. Once the session is cancelled no
/// further step starts; running steps stop at their next turn boundary.
pub async fn run_plan(
    runner: StepRunner,
    ledger: Arc<Mutex<PhaseLedger>>,
    steps: Vec<PlanStep>,
    digest: Arc<Mutex<NoveltyDigest>>,
) -> PoolReport {
    let max_parallel = runner.config().max_parallel_steps.max(1);
    let semaphore = Arc::new(Semaphore::new(max_parallel));
    let cancel = lock(&ledger).cancellation_token();
    let mut join_set: JoinSet<StepOutcome> = JoinSet::new();
    let mut report = PoolReport::default();

    tracing::info!(
        session_id = %runner.session_id(),
        steps = steps.len(),
        max_parallel,
        "Step pool started"
    );

    let mut queue = steps.into_iter();
    while let Some(step) = queue.next() {
        let permit = tokio::select! {
            permit = semaphore.clone().acquire_owned() => permit,
            _ = cancel.cancelled() => {
                report.skipped.push(step.step_id);
                report.skipped.extend(queue.by_ref().map(|s| s.step_id));
                break;
            }
        };
        let Ok(permit) = permit else {
            break;
        };
        if !lock(&ledger).can_start_work() {
            report.skipped.push(step.step_id);
            report.skipped.extend(queue.by_ref().map(|s| s.step_id));
            break;
        }

        let step_id = step.step_id;
        let epoch = lock(&ledger).step_epoch(step_id);
        let worker = {
            let runner = runner.clone();
            let ledger = ledger.clone();
            let digest = digest.clone();
            let cancel = cancel.clone();
            move || {
                let _permit = permit;
                let known = lock(&digest).clone();
                let outcome = runner.run_at_epoch(&step, epoch, &known, &cancel);
                match &outcome {
                    StepOutcome::Completed { step: finished, .. } => {
                        lock(&digest).record(finished.step_id, &finished.findings);
                        lock(&ledger).record_step(finished.clone());
                    }
                    StepOutcome::Failed { step_id, reason } => {
                        lock(&ledger).record_step_failure(*step_id, reason.clone());
                    }
                    StepOutcome::Cancelled { .. } => {}
                }
                outcome
            }
        };

        let runner = runner.clone();
        let ledger = ledger.clone();
        join_set.spawn(async move {
            match tokio::task::spawn_blocking(worker).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(
                        session_id = %runner.session_id(),
                        step_id,
                        error = %e,
                        "Step worker panicked"
                    );
                    lock(&ledger).record_step_failure(step_id, PANICKED);
                    runner.fail(step_id, epoch, PANICKED.to_string())
                }
            }
        });
    }

    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(StepOutcome::Completed { step, .. }) => report.completed.push(step.step_id),
            Ok(StepOutcome::Failed { step_id, reason }) => report.failed.push((step_id, reason)),
            Ok(StepOutcome::Cancelled { step_id }) => report.cancelled.push(step_id),
            Err(e) => {
                tracing::error!(
                    session_id = %runner.session_id(),
                    error = %e,
                    "Step task aborted"
                );
            }
        }
    }

    report.sort();
    tracing::info!(
        session_id = %runner.session_id(),
        completed = report.completed.len(),
        failed = report.failed.len(),
        cancelled = report.cancelled.len(),
        skipped = report.skipped.len(),
        "Step pool finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RecordingSink;
    use crate::config::ExecutionConfig;
    use crate::error::Error;
    use crate::executor::{ContentRetriever, RetrievalRequest, StepAnalyst, StepContext, StepTurn};
    use crate::events::ChannelEvent;
    use crate::types::{Findings, LiveStatus, Phase};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Finalizes immediately, except step 2 which errors
    struct Direct {
        running: AtomicUsize,
        peak: AtomicUsize,
        panic_on: Option<u32>,
    }

    impl StepAnalyst for Direct {
        fn analyze(&self, ctx: &StepContext, _on_token: &mut dyn FnMut(&str)) -> crate::Result<StepTurn> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            self.running.fetch_sub(1, Ordering::SeqCst);

            match ctx.step.step_id {
                2 => return Err(Error::Analyst("model unavailable".into())),
                id if self.panic_on == Some(id) => panic!("analyst crashed on step {}", id),
                _ => {}
            }
            Ok(StepTurn::finalizing(
                Findings {
                    summary: format!("summary of step {}", ctx.step.step_id),
                    ..Default::default()
                },
                0.8,
            ))
        }
    }

    struct Nothing;

    impl ContentRetriever for Nothing {
        fn retrieve(&self, _request: &RetrievalRequest) -> crate::Result<String> {
            Ok(String::new())
        }
    }

    fn plan(ids: &[u32]) -> Vec<PlanStep> {
        ids.iter()
            .map(|id| PlanStep {
                step_id: *id,
                goal: format!("goal {}", id),
                required_data: None,
                chunk_strategy: None,
            })
            .collect()
    }

    fn setup(ids: &[u32]) -> (StepRunner, Arc<Mutex<PhaseLedger>>, Arc<Direct>) {
        setup_with(ids, None)
    }

    fn setup_with(
        ids: &[u32],
        panic_on: Option<u32>,
    ) -> (StepRunner, Arc<Mutex<PhaseLedger>>, Arc<Direct>) {
        let sink = Arc::new(RecordingSink::new());
        let mut ledger = PhaseLedger::new("s", sink.clone());
        ledger.record_plan(plan(ids));
        ledger.advance(Phase::StepExecution).unwrap();

        let analyst = Arc::new(Direct {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            panic_on,
        });
        let config = ExecutionConfig {
            max_parallel_steps: 2,
            ..Default::default()
        };
        let runner = StepRunner::new("s", config, analyst.clone(), Arc::new(Nothing), sink);
        (runner, Arc::new(Mutex::new(ledger)), analyst)
    }

    #[tokio::test]
    async fn test_failures_stay_local() {
        let (runner, ledger, analyst) = setup(&[1, 2, 3, 4, 5]);
        let digest = Arc::new(Mutex::new(NoveltyDigest::new(0.7, 16)));

        let report = run_plan(runner, ledger.clone(), plan(&[1, 2, 3, 4, 5]), digest).await;

        assert_eq!(report.completed, vec![1, 3, 4, 5]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, 2);
        assert!(analyst.peak.load(Ordering::SeqCst) <= 2);

        let ledger = ledger.lock().unwrap();
        let recorded: Vec<u32> = ledger.steps().map(|s| s.step_id).collect();
        assert_eq!(recorded, vec![1, 3, 4, 5]);
        let failed: Vec<u32> = ledger.failed_steps().map(|f| f.step_id).collect();
        assert_eq!(failed, vec![2]);
    }

    #[tokio::test]
    async fn test_panicking_worker_is_reported_as_failed() {
        let (runner, ledger, _) = setup_with(&[1, 3, 4], Some(3));
        let digest = Arc::new(Mutex::new(NoveltyDigest::new(0.7, 16)));

        let report = run_plan(runner, ledger.clone(), plan(&[1, 3, 4]), digest).await;

        assert_eq!(report.completed, vec![1, 4]);
        assert_eq!(report.failed, vec![(3, PANICKED.to_string())]);

        let ledger = ledger.lock().unwrap();
        let failure = ledger.failed_steps().next().unwrap();
        assert_eq!(failure.step_id, 3);
        assert_eq!(failure.reason, PANICKED);
    }

    #[tokio::test]
    async fn test_rerun_steps_run_at_their_epoch() {
        let (runner, ledger, _) = setup(&[1]);
        let digest = Arc::new(Mutex::new(NoveltyDigest::new(0.7, 16)));
        let sink = Arc::new(RecordingSink::new());
        let runner = StepRunner::new(
            "s",
            runner.config().clone(),
            Arc::new(Direct {
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                panic_on: None,
            }),
            Arc::new(Nothing),
            sink.clone(),
        );
        let epoch = {
            let mut ledger = ledger.lock().unwrap();
            ledger.begin_step_rerun(1, false).unwrap();
            ledger.step_epoch(1)
        };
        assert!(epoch > 0);

        run_plan(runner, ledger.clone(), plan(&[1]), digest).await;

        assert!(sink.events().iter().any(|e| matches!(
            e,
            ChannelEvent::PlanStepUpdate(u) if u.epoch == epoch && u.status == Some(LiveStatus::Ready)
        )));
    }

    #[tokio::test]
    async fn test_cancelled_session_starts_nothing() {
        let (runner, ledger, _) = setup(&[1, 2, 3]);
        ledger.lock().unwrap().cancel("stop");
        let digest = Arc::new(Mutex::new(NoveltyDigest::new(0.7, 16)));

        let report = run_plan(runner, ledger.clone(), plan(&[1, 2, 3]), digest).await;

        assert!(report.completed.is_empty());
        assert_eq!(report.skipped, vec![1, 2, 3]);
    }
}
