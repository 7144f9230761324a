//! Shared record types for the decision store and semantic tracking.
//!
//! These are data contracts persisted as JSON; persistence itself lives in
//! `io`. Field order matters for fingerprint stability, so keep it fixed.

use serde::{Deserialize, Serialize};

/// Lifecycle of a recorded decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Active,
    Superseded,
}

/// An accepted, authoritative decision (e.g. target language, engine choice).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id: String,
    pub title: String,
    pub status: DecisionStatus,
    pub created_at: String,
    pub created_by: String,
    pub category: String,
    pub description: String,
    pub value: serde_json::Value,
    pub justification: String,
    #[serde(default)]
    pub evidence_refs: Vec<String>,
}

/// A recorded convention (naming, layout, style).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Convention {
    pub convention_id: String,
    pub created_at: String,
    pub category: String,
    pub rule: String,
    pub applies_to: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    Investigating,
    Resolved,
}

/// An open issue raised during conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub issue_id: String,
    pub created_at: String,
    pub severity: Severity,
    pub description: String,
    pub status: IssueStatus,
    #[serde(default)]
    pub related_tasks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

/// A source-term to target-term mapping enforced across the conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlossaryEntry {
    pub term_id: String,
    pub created_at: String,
    pub source_term: String,
    pub target_term: String,
    #[serde(default)]
    pub definition: String,
    #[serde(default)]
    pub usage_context: String,
}

/// One line of the append-only audit summary log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryEntry {
    pub entry_id: String,
    pub task_id: String,
    pub created_at: String,
    pub summary: String,
}
