//! Regression replay: re-execute a recorded run, measure drift, and test
//! convergence across rounds.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::core::convergence::{Convergence, classify_convergence};
use crate::core::plan::{EngineKind, Phase, Plan, TaskStatus};
use crate::core::semantics::SemanticSummary;
use crate::executor::{ExecutionOptions, TaskExecutor};
use crate::integrity::IntegrityChecker;
use crate::io::audit::write_json;
use crate::io::decision_store::DecisionStore;
use crate::io::engine::EngineRunner;
use crate::io::paths::PorterPaths;
use crate::io::run_store::{RunStore, compute_tree_hashes};

/// Replay execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayMode {
    /// Re-execute into a rehearsal directory; the real target is untouched.
    Dry,
    /// Re-execute against the real target.
    Apply,
}

/// Optional narrowing of the replayed plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayFilter {
    Task(String),
    Phase(Phase),
}

impl std::str::FromStr for ReplayFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(task_id) = s.strip_prefix("task:") {
            return Ok(ReplayFilter::Task(task_id.to_string()));
        }
        if let Some(phase) = s.strip_prefix("phase:") {
            return phase.parse().map(ReplayFilter::Phase);
        }
        Err(format!("expected 'task:<id>' or 'phase:<name>', got '{s}'"))
    }
}

/// Options for one replay invocation.
#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub mode: ReplayMode,
    pub only: Option<ReplayFilter>,
    pub limit: Option<usize>,
    pub max_replay_rounds: usize,
    pub fail_on_any_drift: bool,
    pub allow_engine_change: bool,
    /// Replace the recorded engines. Requires `allow_engine_change`.
    pub engine_override: Option<EngineKind>,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            mode: ReplayMode::Dry,
            only: None,
            limit: None,
            max_replay_rounds: 1,
            fail_on_any_drift: false,
            allow_engine_change: false,
            engine_override: None,
        }
    }
}

/// Structural divergence between two target-tree snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralDrift {
    pub drift_detected: bool,
    pub added_files: Vec<String>,
    pub removed_files: Vec<String>,
    pub modified_files: Vec<String>,
}

impl StructuralDrift {
    pub fn change_count(&self) -> usize {
        self.added_files.len() + self.removed_files.len() + self.modified_files.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionDrift {
    pub drift_detected: bool,
    pub original_fingerprint: String,
    pub current_fingerprint: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemanticDrift {
    pub drift_detected: bool,
    /// Open issues present now that were not open at the original run.
    pub new_issues: Vec<String>,
    pub unresolved_warnings_before: usize,
    pub unresolved_warnings_now: usize,
}

/// One replay round's drift report. Each section toggles independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftReport {
    pub run_id: String,
    pub replay_mode: ReplayMode,
    pub round: usize,
    pub created_at: String,
    pub structural: StructuralDrift,
    pub decision: DecisionDrift,
    pub semantic: SemanticDrift,
    pub drift_detected: bool,
}

/// Result of a replay invocation.
#[derive(Debug, Clone)]
pub struct ReplayOutcome {
    pub reports: Vec<DriftReport>,
    /// Present when more than one round ran.
    pub convergence: Option<Convergence>,
    pub drift_detected: bool,
}

/// Replay a recorded run against the current repository state.
#[instrument(skip_all, fields(run_id, mode = ?options.mode))]
pub fn run_replay(
    source_root: &Path,
    target_root: &Path,
    runner: &dyn EngineRunner,
    run_id: &str,
    options: &ReplayOptions,
) -> Result<ReplayOutcome> {
    if options.engine_override.is_some() && !options.allow_engine_change {
        return Err(anyhow!(
            "engine change not allowed; pass --allow-engine-change to deviate from recorded engines"
        ));
    }
    if options.max_replay_rounds == 0 {
        return Err(anyhow!("max_replay_rounds must be > 0"));
    }
    if options.max_replay_rounds > 1 && options.mode == ReplayMode::Dry {
        return Err(anyhow!("convergent replay requires --apply"));
    }

    let paths = PorterPaths::new(target_root);
    let run_store = RunStore::new(paths.runs_dir.clone(), paths.baselines_dir.clone());
    let manifest = run_store.load_manifest(run_id)?;
    let stored_plan = run_store.load_run_plan(run_id)?;
    let replay_dir = run_store.run_dir(run_id).join("replay");
    fs::create_dir_all(&replay_dir)
        .with_context(|| format!("create replay dir {}", replay_dir.display()))?;

    let template = prepare_replay_plan(&stored_plan, options);

    let mut reports = Vec::new();
    let mut change_counts = Vec::new();

    for round in 1..=options.max_replay_rounds {
        info!(round, "replay round starting");
        let round_dir = replay_dir.join(format!("round_{round}"));
        fs::create_dir_all(&round_dir)
            .with_context(|| format!("create round dir {}", round_dir.display()))?;

        let before_round = match options.mode {
            ReplayMode::Apply => compute_tree_hashes(target_root)?,
            ReplayMode::Dry => run_store.load_target_hashes_before(run_id)?,
        };

        let execution_root = match options.mode {
            ReplayMode::Apply => target_root.to_path_buf(),
            ReplayMode::Dry => {
                let rehearsal = replay_dir.join("target");
                fs::create_dir_all(&rehearsal)
                    .with_context(|| format!("create rehearsal dir {}", rehearsal.display()))?;
                rehearsal
            }
        };

        let executor = TaskExecutor::new(source_root, &execution_root, runner)?
            .with_plan_path(&round_dir.join("plan.json"));
        let outcome = executor.run_with_plan(template.clone(), &ExecutionOptions {
            limit: options.limit,
            resume: false,
            accept_semantic_risk: true,
            arbitration: None,
            flags_used: vec![format!("replay:{run_id}")],
        })?;
        info!(executed = outcome.executed, stop = ?outcome.stop, "replay round executed");

        let after_round = match options.mode {
            ReplayMode::Apply => compute_tree_hashes(target_root)?,
            ReplayMode::Dry => compute_tree_hashes(&execution_root)?,
        };

        let report = build_drift_report(
            run_id,
            round,
            options.mode,
            &manifest.decision_fingerprint,
            &before_round,
            &after_round,
            &paths,
            &run_store,
        )?;
        write_json(&round_dir.join("drift_report.json"), &report)?;
        fs::write(
            round_dir.join("drift_report.md"),
            render_drift_report(&report),
        )
        .context("write drift report rendering")?;
        write_json(&replay_dir.join("drift_report.json"), &report)?;

        change_counts.push(report.structural.change_count());
        let drifted = report.drift_detected;
        reports.push(report);

        if options.fail_on_any_drift && drifted {
            warn!(round, "drift detected with fail_on_any_drift set");
            return Ok(ReplayOutcome {
                reports,
                convergence: None,
                drift_detected: true,
            });
        }

        // Stop early once a round is structurally clean.
        if change_counts.last() == Some(&0) {
            break;
        }
    }

    let drift_detected = reports.iter().any(|r| r.drift_detected);
    let convergence = if options.max_replay_rounds > 1 {
        Some(classify_convergence(
            &change_counts,
            options.max_replay_rounds,
        ))
    } else {
        None
    };

    Ok(ReplayOutcome {
        reports,
        convergence,
        drift_detected,
    })
}

/// Filter and normalize the stored plan for re-execution: statuses reset
/// to pending, the decision fingerprint cleared (fingerprint mismatch is
/// reported as decision drift, not a staleness error), and checkpoints
/// forced to auto-continue.
fn prepare_replay_plan(stored: &Plan, options: &ReplayOptions) -> Plan {
    let mut plan = stored.clone();

    match &options.only {
        Some(ReplayFilter::Task(task_id)) => {
            plan.scaffold_tasks.retain(|t| &t.task_id == task_id);
            plan.file_tasks.retain(|t| &t.task_id == task_id);
            plan.final_sweep_tasks.retain(|t| &t.task_id == task_id);
        }
        Some(ReplayFilter::Phase(phase)) => {
            if *phase != Phase::Scaffold {
                plan.scaffold_tasks.clear();
            }
            if *phase != Phase::File {
                plan.file_tasks.clear();
            }
            if *phase != Phase::Sweep {
                plan.final_sweep_tasks.clear();
            }
        }
        None => {}
    }

    for task in plan.tasks_mut() {
        task.status = TaskStatus::Pending;
        // Filtering can orphan dependency edges; a replayed subset runs
        // unconditionally.
        if options.only.is_some() {
            task.depends_on.clear();
        }
        if let Some(engine) = options.engine_override
            && !task.engine.is_mechanical()
        {
            task.engine = engine;
        }
    }
    plan.decision_fingerprint = String::new();
    for checkpoint in &mut plan.checkpoints {
        checkpoint.auto_continue = true;
        checkpoint.status = crate::core::plan::CheckpointStatus::Pending;
    }
    plan
}

#[expect(clippy::too_many_arguments)]
fn build_drift_report(
    run_id: &str,
    round: usize,
    mode: ReplayMode,
    original_fingerprint: &str,
    before: &BTreeMap<String, String>,
    after: &BTreeMap<String, String>,
    paths: &PorterPaths,
    run_store: &RunStore,
) -> Result<DriftReport> {
    let structural = diff_hashes(before, after);

    let store = DecisionStore::open(&paths.memory_dir)?;
    let current_fingerprint = store.decision_fingerprint()?;
    let decision = DecisionDrift {
        drift_detected: current_fingerprint != original_fingerprint,
        original_fingerprint: original_fingerprint.to_string(),
        current_fingerprint,
    };

    let issues_before = load_pre_run_issues(run_store, run_id)?;
    let summary_before = load_pre_run_summary(run_store, run_id)?;
    let checker = IntegrityChecker::new(
        &paths.semantics_dir,
        crate::core::semantics::DriftThresholds::default(),
    );
    let summary_now = checker.load_summary()?;
    let new_issues: Vec<String> = store
        .open_issues()?
        .into_iter()
        .map(|issue| issue.issue_id)
        .filter(|id| !issues_before.contains(id))
        .collect();
    let semantic = SemanticDrift {
        drift_detected: !new_issues.is_empty()
            || summary_now.unresolved_warnings > summary_before.unresolved_warnings,
        new_issues,
        unresolved_warnings_before: summary_before.unresolved_warnings,
        unresolved_warnings_now: summary_now.unresolved_warnings,
    };

    let drift_detected =
        structural.drift_detected || decision.drift_detected || semantic.drift_detected;
    Ok(DriftReport {
        run_id: run_id.to_string(),
        replay_mode: mode,
        round,
        created_at: Utc::now().to_rfc3339(),
        structural,
        decision,
        semantic,
        drift_detected,
    })
}

fn load_pre_run_issues(run_store: &RunStore, run_id: &str) -> Result<Vec<String>> {
    let path = run_store.run_dir(run_id).join("open_issues_before.json");
    if !path.exists() {
        return Ok(vec![]);
    }
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

fn load_pre_run_summary(run_store: &RunStore, run_id: &str) -> Result<SemanticSummary> {
    let path = run_store.run_dir(run_id).join("semantic_summary_before.json");
    if !path.exists() {
        return Ok(SemanticSummary::default());
    }
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Diff two hash maps into added/removed/modified path lists.
pub fn diff_hashes(
    before: &BTreeMap<String, String>,
    after: &BTreeMap<String, String>,
) -> StructuralDrift {
    let mut added = Vec::new();
    let mut removed = Vec::new();
    let mut modified = Vec::new();

    for (path, hash) in after {
        match before.get(path) {
            None => added.push(path.clone()),
            Some(old_hash) if old_hash != hash => modified.push(path.clone()),
            Some(_) => {}
        }
    }
    for path in before.keys() {
        if !after.contains_key(path) {
            removed.push(path.clone());
        }
    }

    StructuralDrift {
        drift_detected: !added.is_empty() || !removed.is_empty() || !modified.is_empty(),
        added_files: added,
        removed_files: removed,
        modified_files: modified,
    }
}

/// Human-readable rendering of a drift report.
pub fn render_drift_report(report: &DriftReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Drift report for run {}\n\n", report.run_id));
    out.push_str(&format!(
        "- Mode: {:?}\n- Round: {}\n- Generated: {}\n\n",
        report.replay_mode, report.round, report.created_at
    ));

    out.push_str("## Structural drift\n");
    if report.structural.drift_detected {
        out.push_str(&format!(
            "Detected: {} added, {} removed, {} modified\n",
            report.structural.added_files.len(),
            report.structural.removed_files.len(),
            report.structural.modified_files.len()
        ));
        for file in &report.structural.added_files {
            out.push_str(&format!("- added `{file}`\n"));
        }
        for file in &report.structural.removed_files {
            out.push_str(&format!("- removed `{file}`\n"));
        }
        for file in &report.structural.modified_files {
            out.push_str(&format!("- modified `{file}`\n"));
        }
    } else {
        out.push_str("None\n");
    }

    out.push_str("\n## Decision drift\n");
    if report.decision.drift_detected {
        out.push_str(&format!(
            "Detected: fingerprint `{}` -> `{}`\n",
            report.decision.original_fingerprint, report.decision.current_fingerprint
        ));
    } else {
        out.push_str("None\n");
    }

    out.push_str("\n## Semantic drift\n");
    if report.semantic.drift_detected {
        out.push_str(&format!(
            "Detected: {} new issue(s), unresolved warnings {} -> {}\n",
            report.semantic.new_issues.len(),
            report.semantic.unresolved_warnings_before,
            report.semantic.unresolved_warnings_now
        ));
    } else {
        out.push_str("None\n");
    }

    out
}

/// Structural comparison of two recorded runs (CLI `runs diff`).
#[derive(Debug, Clone, Serialize)]
pub struct RunComparison {
    pub run_a: String,
    pub run_b: String,
    pub structural: StructuralDrift,
    pub plan_revision_match: bool,
    pub decision_fingerprint_match: bool,
}

pub fn diff_runs(target_root: &Path, run_a: &str, run_b: &str) -> Result<RunComparison> {
    let paths = PorterPaths::new(target_root);
    let run_store = RunStore::new(paths.runs_dir.clone(), paths.baselines_dir.clone());
    let manifest_a = run_store.load_manifest(run_a)?;
    let manifest_b = run_store.load_manifest(run_b)?;
    let hashes_a = run_store.load_target_hashes_before(run_a)?;
    let hashes_b = run_store.load_target_hashes_before(run_b)?;

    Ok(RunComparison {
        run_a: run_a.to_string(),
        run_b: run_b.to_string(),
        structural: diff_hashes(&hashes_a, &hashes_b),
        plan_revision_match: manifest_a.plan_revision == manifest_b.plan_revision,
        decision_fingerprint_match: manifest_a.decision_fingerprint
            == manifest_b.decision_fingerprint,
    })
}

/// Rehearsal directory used by dry replay, exposed for inspection.
pub fn rehearsal_root(target_root: &Path, run_id: &str) -> PathBuf {
    PorterPaths::new(target_root)
        .run_dir(run_id)
        .join("replay")
        .join("target")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_filter_parses_task_and_phase() {
        assert_eq!(
            "task:t-001".parse::<ReplayFilter>().expect("task"),
            ReplayFilter::Task("t-001".to_string())
        );
        assert_eq!(
            "phase:file".parse::<ReplayFilter>().expect("phase"),
            ReplayFilter::Phase(Phase::File)
        );
        assert!("bogus".parse::<ReplayFilter>().is_err());
    }

    #[test]
    fn diff_hashes_partitions_changes() {
        let mut before = BTreeMap::new();
        before.insert("keep.rs".to_string(), "h1".to_string());
        before.insert("change.rs".to_string(), "h2".to_string());
        before.insert("gone.rs".to_string(), "h3".to_string());

        let mut after = BTreeMap::new();
        after.insert("keep.rs".to_string(), "h1".to_string());
        after.insert("change.rs".to_string(), "h2-new".to_string());
        after.insert("new.rs".to_string(), "h4".to_string());

        let drift = diff_hashes(&before, &after);
        assert!(drift.drift_detected);
        assert_eq!(drift.added_files, vec!["new.rs".to_string()]);
        assert_eq!(drift.removed_files, vec!["gone.rs".to_string()]);
        assert_eq!(drift.modified_files, vec!["change.rs".to_string()]);
        assert_eq!(drift.change_count(), 3);
    }

    #[test]
    fn identical_trees_report_no_drift() {
        let mut hashes = BTreeMap::new();
        hashes.insert("a.rs".to_string(), "h1".to_string());
        let drift = diff_hashes(&hashes, &hashes.clone());
        assert!(!drift.drift_detected);
        assert_eq!(drift.change_count(), 0);
    }

    #[test]
    fn engine_override_requires_explicit_allowance() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = crate::test_support::ScriptedEngine::new(vec![]);
        let options = ReplayOptions {
            engine_override: Some(EngineKind::Claude),
            ..ReplayOptions::default()
        };

        let err = run_replay(temp.path(), temp.path(), &runner, "run-x", &options)
            .expect_err("should fail");
        assert!(err.to_string().contains("--allow-engine-change"));
    }

    #[test]
    fn render_names_each_drift_section() {
        let report = DriftReport {
            run_id: "run-1".to_string(),
            replay_mode: ReplayMode::Dry,
            round: 1,
            created_at: "now".to_string(),
            structural: StructuralDrift {
                drift_detected: true,
                added_files: vec!["a.rs".to_string()],
                removed_files: vec![],
                modified_files: vec![],
            },
            decision: DecisionDrift::default(),
            semantic: SemanticDrift::default(),
            drift_detected: true,
        };

        let rendered = render_drift_report(&report);
        assert!(rendered.contains("## Structural drift"));
        assert!(rendered.contains("added `a.rs`"));
        assert!(rendered.contains("## Decision drift"));
        assert!(rendered.contains("## Semantic drift"));
    }
}
