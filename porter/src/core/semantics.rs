//! Heuristic semantic-equivalence analysis.
//!
//! The analyzer estimates whether converted content preserves the meaning
//! of its source. It is a coarse keyword signal, not a proof, so it sits
//! behind [`EquivalenceAnalyzer`] and can be swapped for a real analyzer
//! without touching the executor or arbitration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::types::{Decision, GlossaryEntry, Severity};

/// Coarse equivalence estimate for one task's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Equivalence {
    High,
    Medium,
    Low,
    Unknown,
}

impl Equivalence {
    pub fn as_str(self) -> &'static str {
        match self {
            Equivalence::High => "high",
            Equivalence::Medium => "medium",
            Equivalence::Low => "low",
            Equivalence::Unknown => "unknown",
        }
    }
}

/// Risk vocabulary detected in converted content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFlag {
    ControlFlow,
    Memory,
    Concurrency,
    Io,
    Lifetime,
}

impl RiskFlag {
    pub const ALL: [RiskFlag; 5] = [
        RiskFlag::ControlFlow,
        RiskFlag::Memory,
        RiskFlag::Concurrency,
        RiskFlag::Io,
        RiskFlag::Lifetime,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RiskFlag::ControlFlow => "control_flow",
            RiskFlag::Memory => "memory",
            RiskFlag::Concurrency => "concurrency",
            RiskFlag::Io => "io",
            RiskFlag::Lifetime => "lifetime",
        }
    }

    fn indicators(self) -> &'static [&'static str] {
        match self {
            RiskFlag::ControlFlow => &[
                "if", "else", "while", "for", "switch", "match", "try", "catch", "finally",
            ],
            RiskFlag::Memory => &[
                "malloc", "free", "delete", "dispose", "memory", "ptr", "pointer", "reference",
            ],
            RiskFlag::Concurrency => &[
                "thread", "mutex", "lock", "sync", "async", "parallel", "concurrent", "race",
            ],
            RiskFlag::Io => &[
                "read", "write", "file", "network", "socket", "stream", "database", "connection",
            ],
            RiskFlag::Lifetime => &[
                "lifetime", "scope", "destructor", "finalizer", "raii", "garbage", "cleanup",
            ],
        }
    }
}

/// Per-task semantic check result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticCheckResult {
    pub semantic_equivalence: Equivalence,
    pub confidence: f64,
    pub preserved_concepts: Vec<String>,
    pub changed_concepts: Vec<String>,
    pub lost_concepts: Vec<String>,
    pub assumptions: Vec<String>,
    pub risk_flags: Vec<RiskFlag>,
    pub requires_human_review: bool,
}

/// Four-state gating decision derived from one semantic result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Block,
    Pause,
    Escalate,
    Continue,
}

/// Inputs for one equivalence analysis.
#[derive(Debug, Clone)]
pub struct AnalysisInput<'a> {
    /// Concatenated target file content produced by the task.
    pub target_content: &'a str,
    /// The task's acceptance-criteria text, used as the conversion summary.
    pub conversion_summary: &'a str,
    pub active_decisions: &'a [Decision],
    pub glossary: &'a [GlossaryEntry],
}

/// Pluggable equivalence scorer.
pub trait EquivalenceAnalyzer {
    fn analyze(&self, input: &AnalysisInput<'_>) -> SemanticCheckResult;
}

/// Default keyword-matching analyzer.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordAnalyzer;

impl EquivalenceAnalyzer for KeywordAnalyzer {
    fn analyze(&self, input: &AnalysisInput<'_>) -> SemanticCheckResult {
        let target_lower = input.target_content.to_lowercase();
        let summary_lower = input.conversion_summary.to_lowercase();

        let risk_flags: Vec<RiskFlag> = RiskFlag::ALL
            .into_iter()
            .filter(|flag| {
                flag.indicators()
                    .iter()
                    .any(|indicator| target_lower.contains(indicator))
            })
            .collect();

        let mut preserved_concepts = Vec::new();
        let mut changed_concepts = Vec::new();
        let mut lost_concepts = Vec::new();
        let mut assumptions = Vec::new();

        let (semantic_equivalence, confidence) = if input.target_content.trim().is_empty() {
            lost_concepts.push("all_source_content".to_string());
            changed_concepts.push("content_existence".to_string());
            assumptions.push("target is empty despite conversion attempt".to_string());
            (Equivalence::Low, 0.9)
        } else if input.target_content.len() < input.conversion_summary.len() / 10 {
            assumptions.push("target content is far shorter than expected".to_string());
            (Equivalence::Medium, 0.7)
        } else {
            match keyword_overlap(&summary_lower, &target_lower) {
                Some(ratio) if ratio > 0.7 => {
                    preserved_concepts.push("core_functionality".to_string());
                    (Equivalence::High, 0.8)
                }
                Some(ratio) if ratio > 0.3 => {
                    changed_concepts.push("implementation_details".to_string());
                    (Equivalence::Medium, 0.6)
                }
                Some(_) => {
                    lost_concepts.push("functionality_context".to_string());
                    (Equivalence::Low, 0.5)
                }
                None => (Equivalence::Unknown, 0.0),
            }
        };

        for entry in input.glossary {
            let source = entry.source_term.to_lowercase();
            let target = entry.target_term.to_lowercase();
            if summary_lower.contains(&source) && !target_lower.contains(&target) {
                lost_concepts.push(format!("glossary_term_{}", entry.source_term));
                assumptions.push(format!(
                    "term mapping '{}' -> '{}' not applied",
                    entry.source_term, entry.target_term
                ));
            }
        }

        let requires_human_review = semantic_equivalence == Equivalence::Low
            || !risk_flags.is_empty()
            || (semantic_equivalence == Equivalence::Medium && confidence < 0.7);

        SemanticCheckResult {
            semantic_equivalence,
            confidence,
            preserved_concepts,
            changed_concepts,
            lost_concepts,
            assumptions,
            risk_flags,
            requires_human_review,
        }
    }
}

/// Ratio of the summary's first ten keywords found in the target.
fn keyword_overlap(summary_lower: &str, target_lower: &str) -> Option<f64> {
    let keywords: Vec<&str> = summary_lower.split_whitespace().take(10).collect();
    if keywords.is_empty() {
        return None;
    }
    let matched = keywords
        .iter()
        .filter(|kw| target_lower.contains(**kw))
        .count();
    Some(matched as f64 / keywords.len() as f64)
}

/// Classify the gating decision for one result.
pub fn classify_risk_level(result: &SemanticCheckResult, accept_semantic_risk: bool) -> RiskLevel {
    if result.semantic_equivalence == Equivalence::Low {
        return RiskLevel::Block;
    }
    if result.requires_human_review && !accept_semantic_risk {
        return RiskLevel::Pause;
    }
    if !result.risk_flags.is_empty() && result.confidence < 0.6 {
        return RiskLevel::Escalate;
    }
    RiskLevel::Continue
}

/// Running totals across all checked tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SemanticSummary {
    pub total_checked: usize,
    pub equivalence_counts: BTreeMap<String, usize>,
    pub cumulative_risk_flags: BTreeMap<String, usize>,
    pub unresolved_warnings: usize,
    #[serde(default)]
    pub last_updated: String,
}

impl SemanticSummary {
    pub fn record(&mut self, result: &SemanticCheckResult) {
        self.total_checked += 1;
        *self
            .equivalence_counts
            .entry(result.semantic_equivalence.as_str().to_string())
            .or_insert(0) += 1;
        for flag in &result.risk_flags {
            *self
                .cumulative_risk_flags
                .entry(flag.as_str().to_string())
                .or_insert(0) += 1;
        }
        if result.requires_human_review {
            self.unresolved_warnings += 1;
        }
    }

    fn count(&self, map: &BTreeMap<String, usize>, key: &str) -> usize {
        map.get(key).copied().unwrap_or(0)
    }

    fn ratio(&self, count: usize) -> f64 {
        if self.total_checked == 0 {
            0.0
        } else {
            count as f64 / self.total_checked as f64
        }
    }
}

/// Ceilings for the aggregate drift check. Exceeding any of them blocks
/// the whole pipeline, independent of the latest task's classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftThresholds {
    pub max_low_equivalence_ratio: f64,
    pub max_unresolved_warnings: usize,
    pub max_control_flow_risk_ratio: f64,
    pub max_memory_risk_ratio: f64,
}

impl Default for DriftThresholds {
    fn default() -> Self {
        Self {
            max_low_equivalence_ratio: 0.2,
            max_unresolved_warnings: 10,
            max_control_flow_risk_ratio: 0.3,
            max_memory_risk_ratio: 0.2,
        }
    }
}

/// Check the running summary against thresholds. Each returned string
/// names one exceeded metric.
pub fn check_drift_thresholds(
    summary: &SemanticSummary,
    thresholds: &DriftThresholds,
) -> Vec<String> {
    let mut exceeded = Vec::new();
    if summary.total_checked == 0 {
        return exceeded;
    }

    let low_ratio = summary.ratio(summary.count(&summary.equivalence_counts, "low"));
    if low_ratio > thresholds.max_low_equivalence_ratio {
        exceeded.push(format!(
            "low-equivalence ratio {:.2} exceeds ceiling {:.2}",
            low_ratio, thresholds.max_low_equivalence_ratio
        ));
    }

    if summary.unresolved_warnings > thresholds.max_unresolved_warnings {
        exceeded.push(format!(
            "unresolved reviews {} exceed ceiling {}",
            summary.unresolved_warnings, thresholds.max_unresolved_warnings
        ));
    }

    let control_ratio = summary.ratio(summary.count(&summary.cumulative_risk_flags, "control_flow"));
    if control_ratio > thresholds.max_control_flow_risk_ratio {
        exceeded.push(format!(
            "control-flow risk ratio {:.2} exceeds ceiling {:.2}",
            control_ratio, thresholds.max_control_flow_risk_ratio
        ));
    }

    let memory_ratio = summary.ratio(summary.count(&summary.cumulative_risk_flags, "memory"));
    if memory_ratio > thresholds.max_memory_risk_ratio {
        exceeded.push(format!(
            "memory risk ratio {:.2} exceeds ceiling {:.2}",
            memory_ratio, thresholds.max_memory_risk_ratio
        ));
    }

    exceeded
}

/// A semantic contradiction found across persisted task results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inconsistency {
    pub kind: String,
    pub description: String,
    pub affected_tasks: Vec<String>,
    pub severity: Severity,
}

/// Scan persisted results for cross-file contradictions:
/// - the same concept preserved in one task and lost/changed in another
///   (medium severity)
/// - a glossary term referenced but not applied (high)
/// - an active target-language decision contradicted by memory-management
///   risk flags (high)
pub fn check_cross_consistency(
    results: &BTreeMap<String, SemanticCheckResult>,
    active_decisions: &[Decision],
    glossary: &[GlossaryEntry],
) -> Vec<Inconsistency> {
    let mut inconsistencies = Vec::new();
    if results.len() < 2 {
        return inconsistencies;
    }

    let mut concept_states: BTreeMap<&str, Vec<(&str, &str)>> = BTreeMap::new();
    for (task_id, result) in results {
        for concept in &result.preserved_concepts {
            concept_states
                .entry(concept.as_str())
                .or_default()
                .push((task_id.as_str(), "preserved"));
        }
        for concept in &result.changed_concepts {
            concept_states
                .entry(concept.as_str())
                .or_default()
                .push((task_id.as_str(), "changed"));
        }
        for concept in &result.lost_concepts {
            concept_states
                .entry(concept.as_str())
                .or_default()
                .push((task_id.as_str(), "lost"));
        }
    }

    for (concept, states) in &concept_states {
        if states.len() < 2 {
            continue;
        }
        let first = states[0].1;
        if states.iter().any(|(_, state)| *state != first) {
            inconsistencies.push(Inconsistency {
                kind: "concept_mapping_inconsistency".to_string(),
                description: format!("concept '{concept}' treated differently across tasks"),
                affected_tasks: states.iter().map(|(id, _)| (*id).to_string()).collect(),
                severity: Severity::Medium,
            });
        }
    }

    for entry in glossary {
        let needle = entry.source_term.to_lowercase();
        for (task_id, result) in results {
            let referenced = result
                .assumptions
                .iter()
                .any(|assumption| assumption.to_lowercase().contains(&needle));
            if referenced {
                inconsistencies.push(Inconsistency {
                    kind: "glossary_violation".to_string(),
                    description: format!(
                        "glossary term '{}' -> '{}' not applied in task {}",
                        entry.source_term, entry.target_term, task_id
                    ),
                    affected_tasks: vec![task_id.clone()],
                    severity: Severity::High,
                });
            }
        }
    }

    // A managed-language target contradicted by manual memory-management
    // vocabulary in the output.
    const MANAGED_TARGETS: [&str; 5] = ["python", "java", "go", "csharp", "javascript"];
    for decision in active_decisions {
        if decision.category != "language_target" {
            continue;
        }
        let Some(value) = decision.value.as_str() else {
            continue;
        };
        if !MANAGED_TARGETS.contains(&value.to_lowercase().as_str()) {
            continue;
        }
        for (task_id, result) in results {
            if result.risk_flags.contains(&RiskFlag::Memory) {
                inconsistencies.push(Inconsistency {
                    kind: "decision_contradiction".to_string(),
                    description: format!(
                        "task {} carries memory-management risk against decision {} (target '{}')",
                        task_id, decision.decision_id, value
                    ),
                    affected_tasks: vec![task_id.clone()],
                    severity: Severity::High,
                });
            }
        }
    }

    inconsistencies
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::DecisionStatus;

    fn analyze(target: &str, summary: &str) -> SemanticCheckResult {
        KeywordAnalyzer.analyze(&AnalysisInput {
            target_content: target,
            conversion_summary: summary,
            active_decisions: &[],
            glossary: &[],
        })
    }

    #[test]
    fn empty_target_is_low_with_high_confidence() {
        let result = analyze("", "convert the parser module");
        assert_eq!(result.semantic_equivalence, Equivalence::Low);
        assert!((result.confidence - 0.9).abs() < f64::EPSILON);
        assert!(result.lost_concepts.contains(&"all_source_content".to_string()));
        assert!(result.requires_human_review);
    }

    #[test]
    fn strong_keyword_overlap_is_high() {
        let summary = "convert parser module tokens";
        let target = "convert parser module tokens and nothing suspicious";
        let result = analyze(target, summary);
        assert_eq!(result.semantic_equivalence, Equivalence::High);
        assert!(result.preserved_concepts.contains(&"core_functionality".to_string()));
    }

    #[test]
    fn no_overlap_is_low() {
        let result = analyze("zzz qqq vvv", "convert parser module tokens");
        assert_eq!(result.semantic_equivalence, Equivalence::Low);
    }

    #[test]
    fn risk_flags_detected_from_vocabulary() {
        let result = analyze(
            "spawn a thread and take the mutex before the socket read",
            "thread mutex socket read",
        );
        assert!(result.risk_flags.contains(&RiskFlag::Concurrency));
        assert!(result.risk_flags.contains(&RiskFlag::Io));
        assert!(result.requires_human_review);
    }

    #[test]
    fn glossary_term_absence_is_lost_concept() {
        let glossary = [GlossaryEntry {
            term_id: "G-001".to_string(),
            created_at: String::new(),
            source_term: "Widget".to_string(),
            target_term: "Component".to_string(),
            definition: String::new(),
            usage_context: String::new(),
        }];
        let result = KeywordAnalyzer.analyze(&AnalysisInput {
            target_content: "nothing relevant nothing relevant widget widget",
            conversion_summary: "convert the Widget registry",
            active_decisions: &[],
            glossary: &glossary,
        });
        assert!(result
            .lost_concepts
            .iter()
            .any(|c| c == "glossary_term_Widget"));
    }

    #[test]
    fn risk_levels_follow_gating_rules() {
        let mut result = analyze("", "anything");
        assert_eq!(classify_risk_level(&result, false), RiskLevel::Block);
        // Accepting risk never unblocks a low-equivalence result.
        assert_eq!(classify_risk_level(&result, true), RiskLevel::Block);

        result = analyze(
            "convert parser module tokens fully done here",
            "convert parser module tokens",
        );
        assert_eq!(classify_risk_level(&result, false), RiskLevel::Continue);

        result.risk_flags = vec![RiskFlag::Io];
        result.requires_human_review = true;
        assert_eq!(classify_risk_level(&result, false), RiskLevel::Pause);
        result.confidence = 0.5;
        assert_eq!(classify_risk_level(&result, true), RiskLevel::Escalate);
    }

    /// Once the low-equivalence fraction exceeds the ceiling, the aggregate
    /// check must report it regardless of the latest individual outcome.
    #[test]
    fn aggregate_threshold_trips_on_low_ratio() {
        let mut summary = SemanticSummary::default();
        let low = analyze("", "anything at all");
        let high = analyze(
            "convert parser module tokens all present",
            "convert parser module tokens",
        );

        summary.record(&low);
        summary.record(&high);
        summary.record(&high);
        summary.record(&high);

        let thresholds = DriftThresholds::default();
        let exceeded = check_drift_thresholds(&summary, &thresholds);
        assert!(
            exceeded.iter().any(|m| m.contains("low-equivalence")),
            "1/4 low should exceed the 20% ceiling: {exceeded:?}"
        );
    }

    #[test]
    fn aggregate_check_passes_when_under_thresholds() {
        let mut summary = SemanticSummary::default();
        let high = analyze(
            "convert parser module tokens all present",
            "convert parser module tokens",
        );
        for _ in 0..5 {
            summary.record(&high);
        }
        assert!(check_drift_thresholds(&summary, &DriftThresholds::default()).is_empty());
    }

    #[test]
    fn cross_consistency_flags_conflicting_concepts() {
        let mut results = BTreeMap::new();
        let mut a = analyze("convert parser module tokens ok", "convert parser module tokens");
        a.preserved_concepts = vec!["registry".to_string()];
        let mut b = a.clone();
        b.preserved_concepts = vec![];
        b.lost_concepts = vec!["registry".to_string()];
        results.insert("t1".to_string(), a);
        results.insert("t2".to_string(), b);

        let found = check_cross_consistency(&results, &[], &[]);
        assert!(found
            .iter()
            .any(|i| i.kind == "concept_mapping_inconsistency" && i.severity == Severity::Medium));
    }

    #[test]
    fn cross_consistency_flags_decision_contradiction() {
        let decision = Decision {
            decision_id: "D-001".to_string(),
            title: "target language".to_string(),
            status: DecisionStatus::Active,
            created_at: String::new(),
            created_by: "planner".to_string(),
            category: "language_target".to_string(),
            description: "target language".to_string(),
            value: serde_json::json!("python"),
            justification: String::new(),
            evidence_refs: vec![],
        };

        let mut results = BTreeMap::new();
        let mut risky = analyze("x", "y z w");
        risky.risk_flags = vec![RiskFlag::Memory];
        results.insert("t1".to_string(), risky);
        results.insert("t2".to_string(), analyze("y z w all here", "y z w"));

        let found = check_cross_consistency(&results, &[decision], &[]);
        assert!(found
            .iter()
            .any(|i| i.kind == "decision_contradiction" && i.severity == Severity::High));
    }
}
