//! Single-step loop

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::channel::EventSink;
use crate::config::ExecutionConfig;
use crate::events::{
    ChannelEvent, CompletionStatus, PlanStepUpdate, StepIteration, StreamComplete, StreamError,
    StreamStart, StreamToken,
};
use crate::types::{LiveStatus, Phase, Phase3Step, PlanStep};

use super::novelty::NoveltyDigest;
use super::{ContentRetriever, RetrievalRequest, StepAnalyst, StepContext, TurnKind};

/// Reason recorded when the final turn still asked for content
pub const EXHAUSTED: &str = "max_iterations_exhausted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Gathering,
    Finalizing,
    Done,
}

/// Result of running one step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed {
        step: Phase3Step,
        iterations: u32,
        /// `findings` or `forced_finalize`
        completion_reason: String,
    },
    Failed {
        step_id: u32,
        reason: String,
    },
    /// Stopped at an iteration boundary because the session was cancelled
    Cancelled { step_id: u32 },
}

impl StepOutcome {
    pub fn step_id(&self) -> u32 {
        match self {
            StepOutcome::Completed { step, .. } => step.step_id,
            StepOutcome::Failed { step_id, .. } | StepOutcome::Cancelled { step_id } => *step_id,
        }
    }
}

/// Runs steps of one session.
#[derive(Clone)]
pub struct StepRunner {
    session_id: String,
    config: ExecutionConfig,
    analyst: Arc<dyn StepAnalyst>,
    retriever: Arc<dyn ContentRetriever>,
    sink: Arc<dyn EventSink>,
}

impl StepRunner {
    pub fn new(
        session_id: impl Into<String>,
        config: ExecutionConfig,
        analyst: Arc<dyn StepAnalyst>,
        retriever: Arc<dyn ContentRetriever>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            config,
            analyst,
            retriever,
            sink,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    fn step_status(&self, step_id: u32, epoch: u64, status: LiveStatus, error: Option<String>) {
        self.sink.emit(ChannelEvent::PlanStepUpdate(PlanStepUpdate {
            step_id,
            status: Some(status),
            error,
            updated_at: Some(Utc::now()),
            epoch,
            ..Default::default()
        }));
    }

    /// Publish a step failure and build its outcome.
    pub(super) fn fail(&self, step_id: u32, epoch: u64, reason: String) -> StepOutcome {
        tracing::warn!(
            session_id = %self.session_id,
            step_id,
            reason = %reason,
            "Step failed"
        );
        self.step_status(step_id, epoch, LiveStatus::Error, Some(reason.clone()));
        StepOutcome::Failed { step_id, reason }
    }

    /// Drive one step of a first execution to completion.
    pub fn run(
        &self,
        step: &PlanStep,
        digest: &NoveltyDigest,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        self.run_at_epoch(step, 0, digest, cancel)
    }

    /// Drive one step to completion, publishing its status under `epoch`.
    ///
    /// Cancellation is checked before every turn; a turn already running is
    /// never interrupted. Failures stay local to this step.
    pub fn run_at_epoch(
        &self,
        step: &PlanStep,
        epoch: u64,
        digest: &NoveltyDigest,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let step_id = step.step_id;
        let max_iterations = self.config.max_iterations.max(2) as u32;
        let mut state = LoopState::Gathering;
        let mut seen_requests: HashSet<String> = HashSet::new();
        let mut ctx = StepContext {
            session_id: self.session_id.clone(),
            step: step.clone(),
            iteration: 0,
            max_iterations,
            finalizing: false,
            retrieved: String::new(),
            known_facts: digest.known_facts(step_id),
        };

        self.step_status(step_id, epoch, LiveStatus::Streaming, None);

        for iteration in 1..=max_iterations {
            if cancel.is_cancelled() {
                tracing::info!(session_id = %self.session_id, step_id, iteration, "Step stopped by cancellation");
                return StepOutcome::Cancelled { step_id };
            }

            let forced = iteration == max_iterations && state == LoopState::Gathering;
            if iteration == max_iterations {
                state = LoopState::Finalizing;
            }
            ctx.iteration = iteration;
            ctx.finalizing = state == LoopState::Finalizing;

            let turn = match self.stream_turn(&ctx) {
                Ok(turn) => turn,
                Err(e) => return self.fail(step_id, epoch, e.to_string()),
            };

            let kind = match turn.classify() {
                Ok(kind) => kind,
                Err(e) => return self.fail(step_id, epoch, e.to_string()),
            };

            match kind {
                TurnKind::Request(requests) => {
                    if state == LoopState::Finalizing {
                        self.emit_iteration(step_id, iteration, &[], None);
                        return self.fail(step_id, epoch, EXHAUSTED.to_string());
                    }
                    let fresh: Vec<RetrievalRequest> = requests
                        .into_iter()
                        .filter(|r| !r.is_blank())
                        .map(|r| r.normalized())
                        .filter(|r| seen_requests.insert(r.request_key()))
                        .collect();
                    self.emit_iteration(step_id, iteration, &fresh, None);

                    if fresh.is_empty() {
                        tracing::debug!(session_id = %self.session_id, step_id, iteration, "No new requests, finalizing");
                        state = LoopState::Finalizing;
                        continue;
                    }
                    let appended = self.gather(&fresh);
                    ctx.retrieved.push_str(&appended);
                }
                TurnKind::Finalize {
                    findings,
                    confidence,
                    insights,
                } => {
                    let confidence = if (0.0..=1.0).contains(&confidence) {
                        confidence
                    } else {
                        tracing::warn!(
                            session_id = %self.session_id,
                            step_id,
                            confidence,
                            "Confidence out of range, clamping"
                        );
                        if confidence.is_nan() {
                            0.0
                        } else {
                            confidence.clamp(0.0, 1.0)
                        }
                    };
                    let findings = digest.prune(step_id, findings);
                    self.emit_iteration(step_id, iteration, &[], Some(findings.clone()));
                    self.step_status(step_id, epoch, LiveStatus::Ready, None);

                    let completion_reason = if forced { "forced_finalize" } else { "findings" };
                    tracing::info!(
                        session_id = %self.session_id,
                        step_id,
                        iteration,
                        confidence,
                        completion_reason,
                        "Step finalized"
                    );
                    return StepOutcome::Completed {
                        step: Phase3Step {
                            step_id,
                            findings,
                            insights,
                            confidence,
                            timestamp: Utc::now(),
                            completion_reason: Some(completion_reason.to_string()),
                        },
                        iterations: iteration,
                        completion_reason: completion_reason.to_string(),
                    };
                }
            }
        }

        // the last turn always finalizes or fails; kept for clarity of the bound
        self.fail(step_id, epoch, EXHAUSTED.to_string())
    }

    fn emit_iteration(
        &self,
        step_id: u32,
        iteration: u32,
        requests: &[RetrievalRequest],
        findings: Option<crate::types::Findings>,
    ) {
        self.sink.emit(ChannelEvent::StepIteration(StepIteration {
            step_id,
            iteration,
            requests: requests.iter().map(RetrievalRequest::summary).collect(),
            findings,
        }));
    }

    /// Run one analyst turn with its output streamed as indexed tokens.
    fn stream_turn(&self, ctx: &StepContext) -> crate::Result<super::StepTurn> {
        let stream_id = format!(
            "{}:step-{}:turn-{}",
            self.session_id, ctx.step.step_id, ctx.iteration
        );
        let mut metadata = serde_json::Map::new();
        metadata.insert("step_id".to_string(), ctx.step.step_id.into());
        metadata.insert("iteration".to_string(), ctx.iteration.into());
        self.sink.emit(ChannelEvent::StreamStart(StreamStart {
            stream_id: stream_id.clone(),
            phase: Some(Phase::StepExecution),
            metadata: Some(metadata),
            at: Some(Utc::now()),
        }));

        let mut index = 0u64;
        let sink = &self.sink;
        let mut on_token = |token: &str| {
            sink.emit(ChannelEvent::StreamToken(StreamToken {
                stream_id: stream_id.clone(),
                token: token.to_string(),
                index: Some(index),
                at: Some(Utc::now()),
            }));
            index += 1;
        };

        match self.analyst.analyze(ctx, &mut on_token) {
            Ok(turn) => {
                self.sink.emit(ChannelEvent::StreamComplete(StreamComplete {
                    stream_id,
                    status: CompletionStatus::Completed,
                    metadata: None,
                    at: Some(Utc::now()),
                }));
                Ok(turn)
            }
            Err(e) => {
                self.sink.emit(ChannelEvent::StreamError(StreamError {
                    stream_id,
                    error: e.to_string(),
                    at: Some(Utc::now()),
                }));
                Err(e)
            }
        }
    }

    /// Fetch fresh requests into one appended context block.
    ///
    /// Failed lookups become inline error blocks. Each block is capped at
    /// `max_chars_per_item` and the round at `max_total_context_chars`.
    fn gather(&self, requests: &[RetrievalRequest]) -> String {
        let mut appended = String::new();
        let mut used = 0usize;
        let budget = self.config.max_total_context_chars;

        for request in requests {
            let body = match self.retriever.retrieve(request) {
                Ok(text) => truncate_chars(&text, self.config.max_chars_per_item),
                Err(e) => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        request = %request.request_key(),
                        error = %e,
                        "Retrieval failed"
                    );
                    format!("[retrieval error: {}]", e)
                }
            };
            let block = format!("\n--- {} ---\n{}\n", request.request_key(), body);
            let len = block.chars().count();
            if used + len > budget {
                let remaining = budget.saturating_sub(used);
                appended.push_str(&truncate_chars(&block, remaining));
                appended.push_str("\n[context limit reached]\n");
                break;
            }
            used += len;
            appended.push_str(&block);
        }
        appended
    }
}

/// First `max` characters of `text`
fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((byte, _)) => text[..byte].to_string(),
        None => text.to_string(),
    }
}
