//! Step execution loop
//!
//! Each plan step runs a bounded request/finalize cycle against two
//! collaborators:
//!
//! - a [`StepAnalyst`] that reads the step context and either asks for more
//!   content or reports findings
//! - a [`ContentRetriever`] that answers content requests
//!
//! A step moves `gathering -> finalizing -> done`. Every turn is reported as a
//! `step.iteration` event, and the analyst's output is streamed token by token.
//! The [`pool`] runs many steps with bounded parallelism.

mod novelty;
mod pool;
mod step;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{Findings, PlanStep, RetrievalRequestSummary};

pub use novelty::{keyword_bag, keyword_overlap, NoveltyDigest};
pub use pool::{run_plan, PoolReport, PANICKED};
pub use step::{LoopState, StepOutcome, StepRunner};

// ============================================
// Retrieval requests
// ============================================

/// Content a step asks for before it can finalize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request_type", rename_all = "snake_case")]
pub enum RetrievalRequest {
    /// Entire text of one collected item
    FullContentItem { item_id: String },
    /// Passages around a marker such as a heading or timestamp
    ByMarker {
        #[serde(default)]
        item_id: Option<String>,
        marker: String,
    },
    /// Passages about a topic
    ByTopic { topic: String },
    /// Nearest passages to a free-text query
    Semantic {
        query: String,
        #[serde(default)]
        top_k: Option<u32>,
    },
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl RetrievalRequest {
    pub fn request_type(&self) -> &'static str {
        match self {
            RetrievalRequest::FullContentItem { .. } => "full_content_item",
            RetrievalRequest::ByMarker { .. } => "by_marker",
            RetrievalRequest::ByTopic { .. } => "by_topic",
            RetrievalRequest::Semantic { .. } => "semantic",
        }
    }

    /// Trimmed form; topics and queries are also lowercased.
    pub fn normalized(&self) -> RetrievalRequest {
        match self {
            RetrievalRequest::FullContentItem { item_id } => RetrievalRequest::FullContentItem {
                item_id: item_id.trim().to_string(),
            },
            RetrievalRequest::ByMarker { item_id, marker } => RetrievalRequest::ByMarker {
                item_id: item_id
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
                marker: collapse(marker),
            },
            RetrievalRequest::ByTopic { topic } => RetrievalRequest::ByTopic {
                topic: collapse(topic).to_lowercase(),
            },
            RetrievalRequest::Semantic { query, top_k } => RetrievalRequest::Semantic {
                query: collapse(query).to_lowercase(),
                top_k: *top_k,
            },
        }
    }

    /// Canonical key: the normalized request as JSON with sorted keys
    pub fn request_key(&self) -> String {
        serde_json::to_value(self.normalized())
            .map(|value| value.to_string())
            .unwrap_or_else(|_| format!("{:?}", self.normalized()))
    }

    pub fn summary(&self) -> RetrievalRequestSummary {
        RetrievalRequestSummary {
            request_type: self.request_type().to_string(),
            key: self.request_key(),
        }
    }

    /// True when the request names nothing to look up
    pub fn is_blank(&self) -> bool {
        match self {
            RetrievalRequest::FullContentItem { item_id } => item_id.trim().is_empty(),
            RetrievalRequest::ByMarker { marker, .. } => marker.trim().is_empty(),
            RetrievalRequest::ByTopic { topic } => topic.trim().is_empty(),
            RetrievalRequest::Semantic { query, .. } => query.trim().is_empty(),
        }
    }
}

// ============================================
// Analyst protocol
// ============================================

/// What the analyst returned for one turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepTurn {
    #[serde(default)]
    pub requests: Vec<RetrievalRequest>,
    #[serde(default)]
    pub findings: Option<Findings>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub insights: String,
}

/// A turn after the request/findings exclusion was checked
#[derive(Debug, Clone, PartialEq)]
pub enum TurnKind {
    Request(Vec<RetrievalRequest>),
    Finalize {
        findings: Findings,
        confidence: f64,
        insights: String,
    },
}

impl StepTurn {
    pub fn requesting(requests: Vec<RetrievalRequest>) -> Self {
        Self {
            requests,
            ..Default::default()
        }
    }

    pub fn finalizing(findings: Findings, confidence: f64) -> Self {
        Self {
            findings: Some(findings),
            confidence: Some(confidence),
            ..Default::default()
        }
    }

    /// Enforce that a turn carries requests or findings, never both.
    pub fn classify(self) -> Result<TurnKind> {
        match (self.requests.is_empty(), self.findings) {
            (false, Some(_)) => Err(Error::Protocol(
                "turn carried both requests and findings".to_string(),
            )),
            (true, None) => Err(Error::Protocol(
                "turn carried neither requests nor findings".to_string(),
            )),
            (false, None) => Ok(TurnKind::Request(self.requests)),
            (true, Some(findings)) => Ok(TurnKind::Finalize {
                findings,
                confidence: self.confidence.unwrap_or(0.0),
                insights: self.insights,
            }),
        }
    }
}

/// Input of one analyst turn. Grows monotonically across turns.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub session_id: String,
    pub step: PlanStep,
    /// 1-based turn number
    pub iteration: u32,
    pub max_iterations: u32,
    /// The analyst must report findings this turn
    pub finalizing: bool,
    /// Content retrieved by earlier turns
    pub retrieved: String,
    /// Facts other steps already reported
    pub known_facts: Vec<String>,
}

/// Model-backed reasoning for one step turn.
pub trait StepAnalyst: Send + Sync {
    /// Produce a turn, forwarding output tokens to `on_token` as they arrive.
    fn analyze(&self, ctx: &StepContext, on_token: &mut dyn FnMut(&str)) -> Result<StepTurn>;
}

/// Answers the four retrieval request types.
pub trait ContentRetriever: Send + Sync {
    fn retrieve(&self, request: &RetrievalRequest) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_key_normalizes() {
        let a = RetrievalRequest::ByTopic {
            topic: "  Pricing   Strategy ".into(),
        };
        let b = RetrievalRequest::ByTopic {
            topic: "pricing strategy".into(),
        };
        assert_eq!(a.request_key(), b.request_key());
        assert_eq!(
            a.request_key(),
            r#"{"request_type":"by_topic","topic":"pricing strategy"}"#
        );
    }

    #[test]
    fn test_request_wire_form() {
        let request: RetrievalRequest =
            serde_json::from_str(r#"{"request_type":"semantic","query":"churn drivers"}"#).unwrap();
        assert_eq!(request.request_type(), "semantic");
        assert!(!request.is_blank());
    }

    #[test]
    fn test_turn_exclusion() {
        let both = StepTurn {
            requests: vec![RetrievalRequest::ByTopic {
                topic: "x".into(),
            }],
            findings: Some(Findings::default()),
            ..Default::default()
        };
        assert!(matches!(both.classify(), Err(Error::Protocol(_))));
        assert!(matches!(
            StepTurn::default().classify(),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            StepTurn::finalizing(Findings::default(), 0.4).classify(),
            Ok(TurnKind::Finalize { .. })
        ));
    }
}
