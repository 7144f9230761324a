//! Append-only store of accepted decisions, conventions, issues, glossary
//! terms, and the audit summary log.
//!
//! Every other component consults this store to detect staleness (via the
//! decision fingerprint) and to enforce compliance before executing tasks.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::core::plan::Task;
use crate::core::types::{
    Convention, Decision, DecisionStatus, GlossaryEntry, Issue, IssueStatus, Severity,
    SummaryEntry,
};

/// File-backed decision store rooted at `.porter/memory/`.
#[derive(Debug, Clone)]
pub struct DecisionStore {
    decisions_path: PathBuf,
    conventions_path: PathBuf,
    issues_path: PathBuf,
    glossary_path: PathBuf,
    summary_log_path: PathBuf,
}

impl DecisionStore {
    /// Open the store, creating empty files on first use.
    pub fn open(memory_dir: &Path) -> Result<Self> {
        fs::create_dir_all(memory_dir)
            .with_context(|| format!("create memory directory {}", memory_dir.display()))?;
        let store = Self {
            decisions_path: memory_dir.join("decisions.json"),
            conventions_path: memory_dir.join("conventions.json"),
            issues_path: memory_dir.join("open_issues.json"),
            glossary_path: memory_dir.join("glossary.json"),
            summary_log_path: memory_dir.join("summary_log.json"),
        };
        for path in [
            &store.decisions_path,
            &store.conventions_path,
            &store.issues_path,
            &store.glossary_path,
            &store.summary_log_path,
        ] {
            if !path.exists() {
                write_json_list::<serde_json::Value>(path, &[])?;
            }
        }
        Ok(store)
    }

    pub fn load_decisions(&self) -> Result<Vec<Decision>> {
        read_json_list(&self.decisions_path)
    }

    pub fn load_conventions(&self) -> Result<Vec<Convention>> {
        read_json_list(&self.conventions_path)
    }

    pub fn load_issues(&self) -> Result<Vec<Issue>> {
        read_json_list(&self.issues_path)
    }

    pub fn load_glossary(&self) -> Result<Vec<GlossaryEntry>> {
        read_json_list(&self.glossary_path)
    }

    pub fn load_summary_log(&self) -> Result<Vec<SummaryEntry>> {
        read_json_list(&self.summary_log_path)
    }

    pub fn active_decisions(&self) -> Result<Vec<Decision>> {
        Ok(self
            .load_decisions()?
            .into_iter()
            .filter(|d| d.status == DecisionStatus::Active)
            .collect())
    }

    pub fn open_issues(&self) -> Result<Vec<Issue>> {
        Ok(self
            .load_issues()?
            .into_iter()
            .filter(|i| matches!(i.status, IssueStatus::Open | IssueStatus::Investigating))
            .collect())
    }

    pub fn add_decision(
        &self,
        category: &str,
        description: &str,
        value: serde_json::Value,
        justification: &str,
        created_by: &str,
    ) -> Result<String> {
        let mut decisions = self.load_decisions()?;
        let decision_id = format!("D-{:03}", decisions.len() + 1);
        decisions.push(Decision {
            decision_id: decision_id.clone(),
            title: description.to_string(),
            status: DecisionStatus::Active,
            created_at: Utc::now().to_rfc3339(),
            created_by: created_by.to_string(),
            category: category.to_string(),
            description: description.to_string(),
            value,
            justification: justification.to_string(),
            evidence_refs: vec![],
        });
        write_json_list(&self.decisions_path, &decisions)?;
        Ok(decision_id)
    }

    /// Supersede a decision and append an active replacement.
    pub fn override_decision(
        &self,
        decision_id: &str,
        new_value: serde_json::Value,
        reason: &str,
        created_by: &str,
    ) -> Result<String> {
        let mut decisions = self.load_decisions()?;
        let index = decisions
            .iter()
            .position(|d| d.decision_id == decision_id)
            .ok_or_else(|| anyhow!("decision '{decision_id}' not found"))?;
        decisions[index].status = DecisionStatus::Superseded;
        let old = decisions[index].clone();

        let replacement = Decision {
            decision_id: format!("D-{:03}", decisions.len() + 1),
            title: old.title,
            status: DecisionStatus::Active,
            created_at: Utc::now().to_rfc3339(),
            created_by: created_by.to_string(),
            category: old.category,
            description: old.description,
            value: new_value,
            justification: reason.to_string(),
            evidence_refs: vec![],
        };
        let new_id = replacement.decision_id.clone();
        decisions.push(replacement);
        write_json_list(&self.decisions_path, &decisions)?;
        Ok(new_id)
    }

    pub fn add_convention(&self, category: &str, rule: &str, applies_to: &str) -> Result<String> {
        let mut conventions = self.load_conventions()?;
        let convention_id = format!("C-{:03}", conventions.len() + 1);
        conventions.push(Convention {
            convention_id: convention_id.clone(),
            created_at: Utc::now().to_rfc3339(),
            category: category.to_string(),
            rule: rule.to_string(),
            applies_to: applies_to.to_string(),
        });
        write_json_list(&self.conventions_path, &conventions)?;
        Ok(convention_id)
    }

    pub fn add_issue(
        &self,
        severity: Severity,
        description: &str,
        related_tasks: &[String],
    ) -> Result<String> {
        let mut issues = self.load_issues()?;
        let issue_id = format!("I-{:03}", issues.len() + 1);
        issues.push(Issue {
            issue_id: issue_id.clone(),
            created_at: Utc::now().to_rfc3339(),
            severity,
            description: description.to_string(),
            status: IssueStatus::Open,
            related_tasks: related_tasks.to_vec(),
            resolution: None,
        });
        write_json_list(&self.issues_path, &issues)?;
        debug!(issue_id = %issue_id, severity = severity.as_str(), "issue recorded");
        Ok(issue_id)
    }

    pub fn add_glossary_entry(
        &self,
        source_term: &str,
        target_term: &str,
        definition: &str,
    ) -> Result<String> {
        let mut glossary = self.load_glossary()?;
        let term_id = format!("G-{:03}", glossary.len() + 1);
        glossary.push(GlossaryEntry {
            term_id: term_id.clone(),
            created_at: Utc::now().to_rfc3339(),
            source_term: source_term.to_string(),
            target_term: target_term.to_string(),
            definition: definition.to_string(),
            usage_context: String::new(),
        });
        write_json_list(&self.glossary_path, &glossary)?;
        Ok(term_id)
    }

    pub fn add_summary_entry(&self, task_id: &str, summary: &str) -> Result<String> {
        let mut entries = self.load_summary_log()?;
        let entry_id = format!("S-{:03}", entries.len() + 1);
        entries.push(SummaryEntry {
            entry_id: entry_id.clone(),
            task_id: task_id.to_string(),
            created_at: Utc::now().to_rfc3339(),
            summary: summary.to_string(),
        });
        write_json_list(&self.summary_log_path, &entries)?;
        Ok(entry_id)
    }

    /// Content fingerprint over active decisions, sorted by id. Detects
    /// plan staleness: a plan generated under one fingerprint must not run
    /// silently under another.
    pub fn decision_fingerprint(&self) -> Result<String> {
        let mut active = self.active_decisions()?;
        active.sort_by(|a, b| a.decision_id.cmp(&b.decision_id));
        let serialized = serde_json::to_string(&active).context("serialize active decisions")?;
        Ok(hex::encode(Sha256::digest(serialized.as_bytes())))
    }

    /// Check a task against active decisions and conventions. Each returned
    /// string is one violation; a non-empty list fails the task before any
    /// engine is invoked.
    pub fn check_task_compliance(&self, task: &Task) -> Result<Vec<String>> {
        let mut violations = Vec::new();
        let decisions = self.active_decisions()?;

        for decision in &decisions {
            if decision.category == "engine_choice"
                && let Some(expected) = decision.value.as_str()
                && expected != task.engine.as_str()
                && !task.engine.is_mechanical()
            {
                violations.push(format!(
                    "task '{}' engine '{}' contradicts decision {}: should be '{}'",
                    task.task_id, task.engine, decision.decision_id, expected
                ));
            }

            if decision.category == "language_target"
                && let Some(language) = decision.value.as_str()
            {
                let expected_exts = language_extensions(language);
                if !expected_exts.is_empty() {
                    for target in &task.target_files {
                        let ext = Path::new(target)
                            .extension()
                            .map(|e| e.to_string_lossy().to_lowercase());
                        if let Some(ext) = ext
                            && !expected_exts.contains(&ext.as_str())
                        {
                            violations.push(format!(
                                "task '{}' target '{}' extension '.{}' contradicts decision {} \
                                 (language '{}')",
                                task.task_id, target, ext, decision.decision_id, language
                            ));
                        }
                    }
                }
            }
        }

        for convention in self.load_conventions()? {
            if convention.category == "naming"
                && convention.rule.to_lowercase().contains("snake_case")
            {
                for target in &task.target_files {
                    let name = Path::new(target)
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    if name.chars().any(|c| c.is_ascii_uppercase()) {
                        violations.push(format!(
                            "task '{}' target '{}' violates naming convention {} ({})",
                            task.task_id, target, convention.convention_id, convention.rule
                        ));
                    }
                }
            }
        }

        Ok(violations)
    }
}

fn language_extensions(language: &str) -> &'static [&'static str] {
    match language.to_lowercase().as_str() {
        "python" => &["py"],
        "javascript" => &["js", "jsx"],
        "typescript" => &["ts", "tsx"],
        "java" => &["java"],
        "cpp" => &["cpp", "cxx", "cc", "h", "hpp"],
        "csharp" => &["cs"],
        "go" => &["go"],
        "rust" => &["rs"],
        _ => &[],
    }
}

fn read_json_list<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

fn write_json_list<T: Serialize>(path: &Path, values: &[T]) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(values)?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::Phase;
    use crate::test_support::task;

    fn store() -> (tempfile::TempDir, DecisionStore) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = DecisionStore::open(&temp.path().join("memory")).expect("open");
        (temp, store)
    }

    #[test]
    fn ids_are_sequential_per_kind() {
        let (_temp, store) = store();
        let d1 = store
            .add_decision("language_target", "target language", serde_json::json!("rust"), "", "planner")
            .expect("d1");
        let d2 = store
            .add_decision("engine_choice", "engine", serde_json::json!("claude"), "", "user")
            .expect("d2");
        let i1 = store
            .add_issue(Severity::High, "broken", &["t-001".to_string()])
            .expect("i1");

        assert_eq!(d1, "D-001");
        assert_eq!(d2, "D-002");
        assert_eq!(i1, "I-001");
    }

    #[test]
    fn fingerprint_changes_only_with_active_decisions() {
        let (_temp, store) = store();
        let before = store.decision_fingerprint().expect("fingerprint");

        store
            .add_decision("language_target", "target", serde_json::json!("rust"), "", "planner")
            .expect("add");
        let after = store.decision_fingerprint().expect("fingerprint");
        assert_ne!(before, after);

        // Issues do not participate in the fingerprint.
        store
            .add_issue(Severity::Low, "note", &[])
            .expect("issue");
        assert_eq!(after, store.decision_fingerprint().expect("fingerprint"));
    }

    #[test]
    fn override_supersedes_and_replaces() {
        let (_temp, store) = store();
        let original = store
            .add_decision("engine_choice", "engine", serde_json::json!("qwen"), "", "planner")
            .expect("add");
        let replacement = store
            .override_decision(&original, serde_json::json!("claude"), "better output", "user")
            .expect("override");

        let decisions = store.load_decisions().expect("load");
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].status, DecisionStatus::Superseded);
        assert_eq!(decisions[1].decision_id, replacement);
        assert_eq!(decisions[1].value, serde_json::json!("claude"));

        let active = store.active_decisions().expect("active");
        assert_eq!(active.len(), 1);
    }

    #[test]
    fn compliance_flags_engine_and_extension_conflicts() {
        let (_temp, store) = store();
        store
            .add_decision("engine_choice", "engine", serde_json::json!("claude"), "", "user")
            .expect("engine decision");
        store
            .add_decision("language_target", "language", serde_json::json!("rust"), "", "user")
            .expect("language decision");

        let mut bad = task("t-001", Phase::File);
        bad.engine = crate::core::plan::EngineKind::Qwen;
        bad.target_files = vec!["src/module.py".to_string()];

        let violations = store.check_task_compliance(&bad).expect("check");
        assert!(violations.iter().any(|v| v.contains("engine 'qwen'")));
        assert!(violations.iter().any(|v| v.contains(".py")));

        let mut good = task("t-002", Phase::File);
        good.engine = crate::core::plan::EngineKind::Claude;
        good.target_files = vec!["src/module.rs".to_string()];
        assert!(store.check_task_compliance(&good).expect("check").is_empty());
    }

    #[test]
    fn summary_log_appends() {
        let (_temp, store) = store();
        store.add_summary_entry("t-001", "did things").expect("s1");
        store.add_summary_entry("t-002", "did more").expect("s2");
        let log = store.load_summary_log().expect("load");
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].entry_id, "S-002");
    }
}
