//! Audit artifact writers.
//!
//! Product artifacts under `.porter/` are written unconditionally for
//! every task, success or failure. They are files, not a queryable API:
//! prompts, raw engine output, action records, structured task summaries,
//! hash-diff records, and checkpoint summaries.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::core::plan::{MergeStrategy, Task, WritePolicy};
use crate::io::paths::sanitize_component;

/// Structured summary persisted for every executed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub source_files: Vec<String>,
    pub target_files: Vec<String>,
    pub created_at: String,
    pub write_policy: WritePolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_strategy: Option<MergeStrategy>,
    pub success: bool,
    pub semantic_decisions: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub hashes_before: BTreeMap<String, String>,
    pub hashes_after: BTreeMap<String, String>,
    pub diff_references: Vec<String>,
}

impl TaskSummary {
    pub fn new(task: &Task) -> Self {
        Self {
            task_id: task.task_id.clone(),
            source_files: task.source_files.clone(),
            target_files: task.target_files.clone(),
            created_at: Utc::now().to_rfc3339(),
            write_policy: task.effective_write_policy(),
            merge_strategy: task.merge_strategy,
            success: false,
            semantic_decisions: vec![],
            warnings: vec![],
            errors: vec![],
            hashes_before: BTreeMap::new(),
            hashes_after: BTreeMap::new(),
            diff_references: vec![],
        }
    }

    /// One-line rendering folded into the decision store's summary log.
    pub fn log_line(&self) -> String {
        let mut line = format!(
            "task {} processed {} target file(s), success: {}",
            self.task_id,
            self.target_files.len(),
            self.success
        );
        if !self.errors.is_empty() {
            line.push_str(&format!(", errors: {}", self.errors.len()));
        }
        if !self.warnings.is_empty() {
            line.push_str(&format!(", warnings: {}", self.warnings.len()));
        }
        line
    }
}

/// Record of a mechanical or bookkeeping action (skip, copy, merge,
/// directory creation, validation result).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub task_id: String,
    pub action: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub source_files: Vec<String>,
    #[serde(default)]
    pub target_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl ActionRecord {
    pub fn new(task_id: &str, action: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            action: action.to_string(),
            created_at: Utc::now().to_rfc3339(),
            reason: None,
            source_files: vec![],
            target_files: vec![],
            exit_code: None,
        }
    }
}

/// Checkpoint summary persisted for the reviewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub checkpoint_id: String,
    pub label: String,
    pub created_at: String,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub semantic_summary: serde_json::Value,
    pub open_issues: usize,
    pub top_risk_flags: BTreeMap<String, usize>,
    pub requires: Vec<String>,
    pub requirements_unmet: Vec<String>,
    pub auto_continue: bool,
}

/// Write the prompt text artifact for a task.
pub fn write_prompt_artifact(
    inputs_dir: &Path,
    task_id: &str,
    engine: &str,
    prompt: &str,
) -> Result<PathBuf> {
    fs::create_dir_all(inputs_dir)
        .with_context(|| format!("create inputs dir {}", inputs_dir.display()))?;
    let path = inputs_dir.join(format!(
        "task_{}_{}.txt",
        sanitize_component(task_id),
        sanitize_component(engine)
    ));
    fs::write(&path, prompt).with_context(|| format!("write prompt {}", path.display()))?;
    Ok(path)
}

/// Write raw engine stdout/stderr artifacts for a task.
pub fn write_engine_output_artifacts(
    outputs_dir: &Path,
    task_id: &str,
    engine: &str,
    stdout: &str,
    stderr: &str,
) -> Result<(PathBuf, PathBuf)> {
    fs::create_dir_all(outputs_dir)
        .with_context(|| format!("create outputs dir {}", outputs_dir.display()))?;
    let stem = format!(
        "task_{}_{}",
        sanitize_component(task_id),
        sanitize_component(engine)
    );
    let stdout_path = outputs_dir.join(format!("{stem}.stdout.txt"));
    let stderr_path = outputs_dir.join(format!("{stem}.stderr.txt"));
    fs::write(&stdout_path, stdout)
        .with_context(|| format!("write stdout {}", stdout_path.display()))?;
    fs::write(&stderr_path, stderr)
        .with_context(|| format!("write stderr {}", stderr_path.display()))?;
    Ok((stdout_path, stderr_path))
}

/// Persist a structured task summary, returning its path.
pub fn write_task_summary(outputs_dir: &Path, summary: &TaskSummary) -> Result<PathBuf> {
    let path = outputs_dir.join(format!(
        "task_{}_summary.json",
        sanitize_component(&summary.task_id)
    ));
    write_json(&path, summary)?;
    Ok(path)
}

/// Persist an action record next to the other task outputs.
pub fn write_action_record(outputs_dir: &Path, record: &ActionRecord) -> Result<PathBuf> {
    let path = outputs_dir.join(format!(
        "task_{}_{}_record.json",
        sanitize_component(&record.task_id),
        sanitize_component(&record.action)
    ));
    write_json(&path, record)?;
    Ok(path)
}

/// Record a patch-style hash-diff artifact for one changed file. Diffs are
/// recorded as hash pairs, not computed inline.
pub fn write_hash_diff(
    diffs_dir: &Path,
    task_id: &str,
    target_path: &str,
    before_hash: Option<&str>,
    after_hash: Option<&str>,
) -> Result<PathBuf> {
    fs::create_dir_all(diffs_dir)
        .with_context(|| format!("create diffs dir {}", diffs_dir.display()))?;
    let path = diffs_dir.join(format!(
        "task_{}_{}.patch",
        sanitize_component(task_id),
        sanitize_component(&target_path.replace('/', "_"))
    ));
    let body = format!(
        "# Hash diff for {target_path} by task {task_id}\n# Before: {}\n# After: {}\n",
        before_hash.unwrap_or("absent"),
        after_hash.unwrap_or("absent"),
    );
    fs::write(&path, body).with_context(|| format!("write diff {}", path.display()))?;
    Ok(path)
}

/// Persist a checkpoint summary under the checkpoint's artifact dir.
pub fn write_checkpoint_summary(
    checkpoint_dir: &Path,
    summary: &CheckpointSummary,
) -> Result<PathBuf> {
    fs::create_dir_all(checkpoint_dir)
        .with_context(|| format!("create checkpoint dir {}", checkpoint_dir.display()))?;
    let path = checkpoint_dir.join("summary.json");
    write_json(&path, summary)?;
    Ok(path)
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}
