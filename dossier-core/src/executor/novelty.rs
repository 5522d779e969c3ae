//! Digest of already-reported findings
//!
//! Every finalized step adds its summary and points of interest to a
//! session-wide digest. A new step's points whose keyword overlap with an
//! entry from another step reaches the threshold are pruned as duplicates.

use std::collections::BTreeSet;

use crate::types::{Findings, NoveltyReport, PrunedFinding};

/// Lowercased word tokens longer than one character.
///
/// Text without such tokens falls back to character bigrams, then to the
/// whole string, so short inputs still compare.
pub fn keyword_bag(text: &str) -> BTreeSet<String> {
    let lowered = text.trim().to_lowercase();
    if lowered.is_empty() {
        return BTreeSet::new();
    }
    let mut bag: BTreeSet<String> = lowered
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|token| token.chars().count() > 1)
        .map(str::to_string)
        .collect();
    if bag.is_empty() {
        let chars: Vec<char> = lowered.chars().collect();
        if chars.len() > 2 {
            bag = chars.windows(2).map(|pair| pair.iter().collect()).collect();
        } else {
            bag.insert(lowered);
        }
    }
    bag
}

/// Shared keywords relative to the smaller bag
pub fn keyword_overlap(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    shared as f64 / a.len().min(b.len()).max(1) as f64
}

#[derive(Debug, Clone)]
struct DigestEntry {
    step_id: u32,
    text: String,
    keywords: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct NoveltyDigest {
    entries: Vec<DigestEntry>,
    threshold: f64,
    max_entries_per_step: usize,
}

impl NoveltyDigest {
    pub fn new(threshold: f64, max_entries_per_step: usize) -> Self {
        Self {
            entries: Vec::new(),
            threshold,
            max_entries_per_step,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Texts reported by steps other than `step_id`, for the step context
    pub fn known_facts(&self, step_id: u32) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| entry.step_id != step_id)
            .map(|entry| entry.text.clone())
            .collect()
    }

    /// Drop points already reported by another step and attach the report.
    ///
    /// A step never prunes against its own earlier entries, so a rerun can
    /// restate what it found before.
    pub fn prune(&self, step_id: u32, mut findings: Findings) -> Findings {
        let candidate_count = findings.points_of_interest.len();
        let mut kept = Vec::with_capacity(candidate_count);
        let mut pruned = Vec::new();

        for point in findings.points_of_interest {
            let bag = keyword_bag(&point);
            let best = self
                .entries
                .iter()
                .filter(|entry| entry.step_id != step_id)
                .map(|entry| (keyword_overlap(&bag, &entry.keywords), entry))
                .max_by(|a, b| a.0.total_cmp(&b.0));

            match best {
                Some((score, entry)) if score >= self.threshold => {
                    tracing::debug!(step_id, score, "Pruned duplicate finding");
                    pruned.push(PrunedFinding {
                        text: point,
                        matched_text: entry.text.clone(),
                        keyword_overlap: (score * 1000.0).round() / 1000.0,
                    });
                }
                _ => kept.push(point),
            }
        }

        findings.points_of_interest = kept;
        findings.novelty = Some(NoveltyReport {
            candidate_count,
            duplicates_removed: pruned.len(),
            pruned,
        });
        findings
    }

    /// Store the text units of a finalized step, replacing its earlier ones.
    pub fn record(&mut self, step_id: u32, findings: &Findings) {
        self.entries.retain(|entry| entry.step_id != step_id);
        let summary = Some(findings.summary.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let units = summary
            .into_iter()
            .chain(findings.points_of_interest.iter().cloned())
            .filter(|text| !text.trim().is_empty())
            .take(self.max_entries_per_step);
        for text in units {
            self.entries.push(DigestEntry {
                step_id,
                keywords: keyword_bag(&text),
                text,
            });
        }
    }
}
