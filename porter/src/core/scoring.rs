//! Candidate scoring and winner selection for arbitration.
//!
//! Scoring is pure: given a candidate's parsed output and its semantic
//! result, compute a scorecard and a composite score. Judge escalation is
//! decided here; invoking the judge is the arbitration engine's job.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::plan::EngineKind;
use crate::core::protocol::EngineOutput;
use crate::core::semantics::{Equivalence, SemanticCheckResult};

/// Incompletion-marker classes and their per-file penalty weights.
const PLACEHOLDER_CLASSES: [(&str, u32); 4] = [
    ("todo", 10),
    ("fixme", 10),
    ("not implemented", 15),
    ("unimplemented", 15),
];

/// Heuristic quality measurements for one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scorecard {
    /// Output matched the required `{files: [...]}` shape.
    pub protocol_valid: bool,
    /// Declared target files are a subset of produced files.
    pub deliverables_ok: bool,
    /// Accumulated placeholder penalty across files and marker classes.
    pub placeholder_penalty: u32,
    /// Total produced content size in bytes.
    pub content_size: usize,
    /// External validation command exit status, when one was run.
    pub validation_passed: Option<bool>,
}

/// Score a parsed candidate against the task's declared target files.
/// The validation-command result is attached by the caller afterwards.
pub fn score_candidate(output: &EngineOutput, target_files: &[String]) -> Scorecard {
    let produced: BTreeSet<&str> = output.files.iter().map(|f| f.path.as_str()).collect();
    let deliverables_ok = target_files
        .iter()
        .all(|target| produced.contains(target.as_str()));

    let mut placeholder_penalty = 0u32;
    let mut content_size = 0usize;
    for file in &output.files {
        content_size += file.content.len();
        let lower = file.content.to_lowercase();
        for (marker, weight) in PLACEHOLDER_CLASSES {
            if lower.contains(marker) {
                placeholder_penalty += weight;
            }
        }
    }

    Scorecard {
        protocol_valid: true,
        deliverables_ok,
        placeholder_penalty,
        content_size,
        validation_passed: None,
    }
}

/// Composite score: equivalence tier + confidence + completeness bonus
/// − placeholder penalty + validation bonus.
pub fn composite_score(scorecard: &Scorecard, semantic: &SemanticCheckResult) -> f64 {
    let mut score = match semantic.semantic_equivalence {
        Equivalence::High => 100.0,
        Equivalence::Medium => 50.0,
        Equivalence::Low => 0.0,
        Equivalence::Unknown => 25.0,
    };
    score += semantic.confidence * 50.0;
    if scorecard.deliverables_ok {
        score += 20.0;
    }
    score -= f64::from(scorecard.placeholder_penalty) * 5.0;
    if scorecard.validation_passed.unwrap_or(true) {
        score += 15.0;
    }
    score
}

/// A candidate is disqualified outright when its output is classified low
/// equivalence or flagged for human review, regardless of heuristic score.
pub fn is_eligible(semantic: &SemanticCheckResult) -> bool {
    semantic.semantic_equivalence != Equivalence::Low && !semantic.requires_human_review
}

/// One scored, eligible candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidate {
    pub engine: EngineKind,
    pub score: f64,
    pub confidence: f64,
}

/// Outcome of pure selection over ranked candidates.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// No eligible candidates survived filtering.
    NoneEligible,
    /// A single winner by heuristic score.
    Winner(EngineKind),
    /// Scores too close or leader confidence too low: escalate to a judge.
    NeedsJudge { leader: EngineKind },
}

/// Select among eligible candidates. Judge escalation triggers when the
/// top two scores are within 10 points, or the leader's confidence is
/// below 0.6.
pub fn select_winner(ranked: &[RankedCandidate], use_judge: bool) -> Selection {
    if ranked.is_empty() {
        return Selection::NoneEligible;
    }

    let mut sorted: Vec<&RankedCandidate> = ranked.iter().collect();
    sorted.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    let leader = sorted[0];

    if !use_judge || sorted.len() == 1 {
        return Selection::Winner(leader.engine);
    }

    let runner_up = sorted[1];
    let close = (leader.score - runner_up.score).abs() <= 10.0;
    let shaky = leader.confidence < 0.6;
    if close || shaky {
        Selection::NeedsJudge {
            leader: leader.engine,
        }
    } else {
        Selection::Winner(leader.engine)
    }
}
