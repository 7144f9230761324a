//! Canonical layout of the `.porter/` state directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// All pipeline state paths, rooted at the target repository.
#[derive(Debug, Clone)]
pub struct PorterPaths {
    pub porter_dir: PathBuf,
    pub plan_dir: PathBuf,
    pub plan_path: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub target_hashes_path: PathBuf,
    pub memory_dir: PathBuf,
    pub semantics_dir: PathBuf,
    pub inputs_dir: PathBuf,
    pub outputs_dir: PathBuf,
    pub snapshots_dir: PathBuf,
    pub diffs_dir: PathBuf,
    pub arbitration_dir: PathBuf,
    pub checkpoints_dir: PathBuf,
    pub runs_dir: PathBuf,
    pub baselines_dir: PathBuf,
}

impl PorterPaths {
    pub fn new(target_root: &Path) -> Self {
        let porter_dir = target_root.join(".porter");
        let plan_dir = porter_dir.join("plan");
        let state_dir = porter_dir.join("state");
        Self {
            plan_path: plan_dir.join("plan.json"),
            config_path: state_dir.join("config.toml"),
            target_hashes_path: state_dir.join("target_hashes.json"),
            memory_dir: porter_dir.join("memory"),
            semantics_dir: porter_dir.join("semantics"),
            inputs_dir: porter_dir.join("inputs"),
            outputs_dir: porter_dir.join("outputs"),
            snapshots_dir: porter_dir.join("snapshots"),
            diffs_dir: porter_dir.join("diffs"),
            arbitration_dir: porter_dir.join("arbitration"),
            checkpoints_dir: porter_dir.join("checkpoints"),
            runs_dir: porter_dir.join("runs"),
            baselines_dir: porter_dir.join("baselines"),
            plan_dir,
            state_dir,
            porter_dir,
        }
    }

    /// Create every state directory. Idempotent.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            &self.porter_dir,
            &self.plan_dir,
            &self.state_dir,
            &self.memory_dir,
            &self.semantics_dir,
            &self.inputs_dir,
            &self.outputs_dir,
            &self.snapshots_dir,
            &self.diffs_dir,
            &self.arbitration_dir,
            &self.checkpoints_dir,
            &self.runs_dir,
            &self.baselines_dir,
        ] {
            fs::create_dir_all(dir)
                .with_context(|| format!("create directory {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }

    pub fn arbitration_task_dir(&self, task_id: &str) -> PathBuf {
        self.arbitration_dir.join(sanitize_component(task_id))
    }

    pub fn checkpoint_dir(&self, checkpoint_id: &str) -> PathBuf {
        self.checkpoints_dir.join(sanitize_component(checkpoint_id))
    }
}

/// Replace characters unsafe for file names with underscores and strip
/// leading dots.
pub fn sanitize_component(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            other => other,
        })
        .collect();
    replaced.trim_start_matches('.').to_string()
}
