//! Semantic-integrity orchestration: runs the pluggable analyzer per task,
//! persists results and the running summary, and exposes the aggregate
//! threshold and cross-file consistency checks.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, instrument};

use crate::core::plan::Task;
use crate::core::semantics::{
    AnalysisInput, DriftThresholds, EquivalenceAnalyzer, Inconsistency, KeywordAnalyzer,
    SemanticCheckResult, SemanticSummary, check_cross_consistency, check_drift_thresholds,
};
use crate::io::audit::write_json;
use crate::io::decision_store::DecisionStore;
use crate::io::paths::sanitize_component;

/// File-backed semantic checker with a pluggable analyzer.
pub struct IntegrityChecker {
    semantics_dir: PathBuf,
    analyzer: Box<dyn EquivalenceAnalyzer>,
    thresholds: DriftThresholds,
}

impl IntegrityChecker {
    pub fn new(semantics_dir: &Path, thresholds: DriftThresholds) -> Self {
        Self::with_analyzer(semantics_dir, thresholds, Box::new(KeywordAnalyzer))
    }

    pub fn with_analyzer(
        semantics_dir: &Path,
        thresholds: DriftThresholds,
        analyzer: Box<dyn EquivalenceAnalyzer>,
    ) -> Self {
        Self {
            semantics_dir: semantics_dir.to_path_buf(),
            analyzer,
            thresholds,
        }
    }

    fn summary_path(&self) -> PathBuf {
        self.semantics_dir.join("summary.json")
    }

    fn result_path(&self, task_id: &str) -> PathBuf {
        self.semantics_dir
            .join(format!("task_{}.json", sanitize_component(task_id)))
    }

    /// Analyze content directly, without reading the target tree. Used by
    /// arbitration to check candidate output in isolation; nothing is
    /// persisted.
    pub fn analyze_content(
        &self,
        target_content: &str,
        conversion_summary: &str,
        store: &DecisionStore,
    ) -> Result<SemanticCheckResult> {
        let decisions = store.active_decisions()?;
        let glossary = store.load_glossary()?;
        Ok(self.analyzer.analyze(&AnalysisInput {
            target_content,
            conversion_summary,
            active_decisions: &decisions,
            glossary: &glossary,
        }))
    }

    /// Run the semantic check for a completed task: read the task's target
    /// files, analyze, persist the per-task result, and fold it into the
    /// running summary.
    #[instrument(skip_all, fields(task_id = %task.task_id))]
    pub fn run_check(
        &self,
        task: &Task,
        target_root: &Path,
        store: &DecisionStore,
    ) -> Result<SemanticCheckResult> {
        let mut target_content = String::new();
        for target_file in &task.target_files {
            let full = target_root.join(target_file);
            if full.exists() {
                let contents = fs::read_to_string(&full)
                    .with_context(|| format!("read target {}", full.display()))?;
                target_content.push_str(&contents);
                target_content.push('\n');
            }
        }

        let result = self.analyze_content(&target_content, &task.criteria_text(), store)?;
        write_json(&self.result_path(&task.task_id), &result)?;

        let mut summary = self.load_summary()?;
        summary.record(&result);
        summary.last_updated = Utc::now().to_rfc3339();
        write_json(&self.summary_path(), &summary)?;

        debug!(
            equivalence = result.semantic_equivalence.as_str(),
            confidence = result.confidence,
            "semantic check recorded"
        );
        Ok(result)
    }

    pub fn load_summary(&self) -> Result<SemanticSummary> {
        let path = self.summary_path();
        if !path.exists() {
            return Ok(SemanticSummary::default());
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read summary {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parse summary {}", path.display()))
    }

    /// Load every persisted per-task result.
    pub fn load_all_results(&self) -> Result<BTreeMap<String, SemanticCheckResult>> {
        let mut results = BTreeMap::new();
        if !self.semantics_dir.exists() {
            return Ok(results);
        }
        for entry in fs::read_dir(&self.semantics_dir)
            .with_context(|| format!("read semantics dir {}", self.semantics_dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(task_id) = name
                .strip_prefix("task_")
                .and_then(|rest| rest.strip_suffix(".json"))
            else {
                continue;
            };
            let contents = fs::read_to_string(entry.path())
                .with_context(|| format!("read {}", entry.path().display()))?;
            match serde_json::from_str(&contents) {
                Ok(result) => {
                    results.insert(task_id.to_string(), result);
                }
                Err(_) => continue,
            }
        }
        Ok(results)
    }

    /// Aggregate drift check against configured ceilings. Each returned
    /// string names an exceeded metric; non-empty blocks the pipeline.
    pub fn exceeded_thresholds(&self) -> Result<Vec<String>> {
        let summary = self.load_summary()?;
        Ok(check_drift_thresholds(&summary, &self.thresholds))
    }

    /// Cross-file consistency over all persisted results.
    pub fn cross_file_inconsistencies(&self, store: &DecisionStore) -> Result<Vec<Inconsistency>> {
        let results = self.load_all_results()?;
        let decisions = store.active_decisions()?;
        let glossary = store.load_glossary()?;
        Ok(check_cross_consistency(&results, &decisions, &glossary))
    }
}
