//! Run manifests, per-run snapshots, and durable baselines.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::plan::{EngineKind, Plan};
use crate::io::audit::write_json;
use crate::io::process::{InterruptHandle, run_command_with_timeout};
use crate::io::write_safety::{content_hash, file_hash};

/// Terminal status of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Interrupted,
}

/// One manifest per execution attempt. Created at run start, finalized
/// once at run end; immutable afterwards except for replay artifacts
/// stored alongside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub started_at: String,
    #[serde(default)]
    pub ended_at: String,
    pub pipeline_id: String,
    pub source_path: String,
    pub source_revision: String,
    pub target_path: String,
    pub target_revision_before: String,
    #[serde(default)]
    pub target_revision_after: String,
    /// Content hash of the plan document at run start.
    pub plan_revision: String,
    pub decision_fingerprint: String,
    pub engines_used: Vec<EngineKind>,
    pub flags_used: Vec<String>,
    pub status: RunStatus,
}

/// Named, durable snapshot of a run's target hash map and fingerprints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub baseline_id: String,
    pub from_run_id: String,
    pub created_at: String,
    pub target_file_hashes: BTreeMap<String, String>,
    pub plan_revision: String,
    pub decision_fingerprint: String,
}

/// Generate a run id from the wall clock, process id, and a per-process
/// counter (runs in the same second must not collide).
pub fn generate_run_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static SEQUENCE: AtomicU64 = AtomicU64::new(1);
    format!(
        "run-{}-{}-{}",
        Utc::now().format("%Y%m%d-%H%M%S"),
        std::process::id(),
        SEQUENCE.fetch_add(1, Ordering::Relaxed)
    )
}

/// Best-effort `git rev-parse HEAD`; "unknown" when git or the repository
/// is unavailable.
pub fn git_revision(repo_root: &Path) -> String {
    let mut cmd = Command::new("git");
    cmd.arg("rev-parse").arg("HEAD").current_dir(repo_root);
    match run_command_with_timeout(
        cmd,
        None,
        Duration::from_secs(5),
        4096,
        &InterruptHandle::new(),
    ) {
        Ok(output) if output.status.success() => output.stdout_utf8().trim().to_string(),
        _ => "unknown".to_string(),
    }
}

/// Content hash of the serialized plan.
pub fn plan_revision(plan: &Plan) -> Result<String> {
    let serialized = serde_json::to_string(plan).context("serialize plan for revision")?;
    Ok(content_hash(serialized.as_bytes()))
}

/// Hash every file under `root`, keyed by root-relative path. The state
/// directory and version control metadata are excluded.
pub fn compute_tree_hashes(root: &Path) -> Result<BTreeMap<String, String>> {
    let mut hashes = BTreeMap::new();
    if !root.exists() {
        return Ok(hashes);
    }
    walk_tree(root, root, &mut hashes)?;
    Ok(hashes)
}

fn walk_tree(root: &Path, dir: &Path, hashes: &mut BTreeMap<String, String>) -> Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("read directory {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let path = entry.path();
        let name = entry.file_name();
        // State dir, VCS metadata, and the advisory lock are not part of
        // the produced tree.
        if name == ".porter" || name == ".git" || name == ".porter.lock" {
            continue;
        }
        if path.is_dir() {
            walk_tree(root, &path, hashes)?;
        } else if let Some(hash) = file_hash(&path)? {
            let relative = path
                .strip_prefix(root)
                .with_context(|| format!("relativize {}", path.display()))?;
            hashes.insert(relative.to_string_lossy().into_owned(), hash);
        }
    }
    Ok(())
}

/// File-backed store of run manifests and their snapshots.
#[derive(Debug, Clone)]
pub struct RunStore {
    runs_dir: PathBuf,
    baselines_dir: PathBuf,
}

impl RunStore {
    pub fn new(runs_dir: PathBuf, baselines_dir: PathBuf) -> Self {
        Self {
            runs_dir,
            baselines_dir,
        }
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }

    fn manifest_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("manifest.json")
    }

    /// Persist the manifest plus the plan copy and target-before hash
    /// snapshot that replay diffs against.
    pub fn save_run_start(
        &self,
        manifest: &RunManifest,
        plan: &Plan,
        target_hashes_before: &BTreeMap<String, String>,
    ) -> Result<()> {
        let run_dir = self.run_dir(&manifest.run_id);
        fs::create_dir_all(&run_dir)
            .with_context(|| format!("create run dir {}", run_dir.display()))?;
        write_json(&self.manifest_path(&manifest.run_id), manifest)?;
        write_json(&run_dir.join("plan.json"), plan)?;
        write_json(
            &run_dir.join("target_hashes_before.json"),
            target_hashes_before,
        )?;
        debug!(run_id = %manifest.run_id, "run manifest captured");
        Ok(())
    }

    /// Finalize a manifest with terminal status and post-run revision.
    pub fn finalize(
        &self,
        run_id: &str,
        status: RunStatus,
        target_revision_after: &str,
    ) -> Result<()> {
        let mut manifest = self.load_manifest(run_id)?;
        manifest.status = status;
        manifest.ended_at = Utc::now().to_rfc3339();
        manifest.target_revision_after = target_revision_after.to_string();
        write_json(&self.manifest_path(run_id), &manifest)
    }

    pub fn load_manifest(&self, run_id: &str) -> Result<RunManifest> {
        let path = self.manifest_path(run_id);
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read manifest {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parse manifest {}", path.display()))
    }

    pub fn load_run_plan(&self, run_id: &str) -> Result<Plan> {
        let path = self.run_dir(run_id).join("plan.json");
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read run plan {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parse run plan {}", path.display()))
    }

    pub fn load_target_hashes_before(&self, run_id: &str) -> Result<BTreeMap<String, String>> {
        let path = self.run_dir(run_id).join("target_hashes_before.json");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("read before snapshot {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parse before snapshot {}", path.display()))
    }

    /// All manifests, newest first.
    pub fn list_runs(&self) -> Result<Vec<RunManifest>> {
        let mut manifests = Vec::new();
        if !self.runs_dir.exists() {
            return Ok(manifests);
        }
        for entry in fs::read_dir(&self.runs_dir)
            .with_context(|| format!("read runs dir {}", self.runs_dir.display()))?
        {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let run_id = entry.file_name().to_string_lossy().into_owned();
            if let Ok(manifest) = self.load_manifest(&run_id) {
                manifests.push(manifest);
            }
        }
        manifests.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(manifests)
    }

    /// Create a named durable baseline from a finished run.
    pub fn create_baseline(&self, run_id: &str, name: Option<&str>) -> Result<Baseline> {
        let manifest = self.load_manifest(run_id)?;
        let target_root = PathBuf::from(&manifest.target_path);
        let baseline = Baseline {
            baseline_id: name
                .map(str::to_string)
                .unwrap_or_else(|| format!("baseline-{run_id}")),
            from_run_id: run_id.to_string(),
            created_at: Utc::now().to_rfc3339(),
            target_file_hashes: compute_tree_hashes(&target_root)?,
            plan_revision: manifest.plan_revision.clone(),
            decision_fingerprint: manifest.decision_fingerprint.clone(),
        };
        fs::create_dir_all(&self.baselines_dir)
            .with_context(|| format!("create baselines dir {}", self.baselines_dir.display()))?;
        let path = self
            .baselines_dir
            .join(format!("{}.json", baseline.baseline_id));
        write_json(&path, &baseline)?;
        Ok(baseline)
    }

    pub fn load_baseline(&self, baseline_id: &str) -> Result<Baseline> {
        let path = self.baselines_dir.join(format!("{baseline_id}.json"));
        if !path.exists() {
            return Err(anyhow!("baseline '{baseline_id}' not found"));
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read baseline {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("parse baseline {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::Phase;
    use crate::test_support::{plan_with_tasks, task};

    fn manifest(run_id: &str) -> RunManifest {
        RunManifest {
            run_id: run_id.to_string(),
            started_at: Utc::now().to_rfc3339(),
            ended_at: String::new(),
            pipeline_id: "p".to_string(),
            source_path: "/src".to_string(),
            source_revision: "unknown".to_string(),
            target_path: "/dst".to_string(),
            target_revision_before: "unknown".to_string(),
            target_revision_after: String::new(),
            plan_revision: "abc".to_string(),
            decision_fingerprint: "def".to_string(),
            engines_used: vec![EngineKind::Claude],
            flags_used: vec!["--limit 2".to_string()],
            status: RunStatus::Running,
        }
    }

    #[test]
    fn save_finalize_and_reload_manifest() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RunStore::new(temp.path().join("runs"), temp.path().join("baselines"));
        let plan = plan_with_tasks(vec![task("s1", Phase::Scaffold)], vec![], vec![]);

        store
            .save_run_start(&manifest("run-1"), &plan, &BTreeMap::new())
            .expect("save");
        store
            .finalize("run-1", RunStatus::Completed, "rev-after")
            .expect("finalize");

        let loaded = store.load_manifest("run-1").expect("load");
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.target_revision_after, "rev-after");
        assert!(!loaded.ended_at.is_empty());

        let run_plan = store.load_run_plan("run-1").expect("run plan");
        assert_eq!(run_plan, plan);
    }

    #[test]
    fn list_runs_orders_newest_first() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = RunStore::new(temp.path().join("runs"), temp.path().join("baselines"));
        let plan = plan_with_tasks(vec![], vec![], vec![]);

        let mut first = manifest("run-a");
        first.started_at = "2026-01-01T00:00:00Z".to_string();
        let mut second = manifest("run-b");
        second.started_at = "2026-02-01T00:00:00Z".to_string();
        store
            .save_run_start(&first, &plan, &BTreeMap::new())
            .expect("save a");
        store
            .save_run_start(&second, &plan, &BTreeMap::new())
            .expect("save b");

        let runs = store.list_runs().expect("list");
        assert_eq!(runs[0].run_id, "run-b");
        assert_eq!(runs[1].run_id, "run-a");
    }

    #[test]
    fn tree_hashes_exclude_state_and_git() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join(".porter/state")).expect("mkdir");
        fs::create_dir_all(temp.path().join(".git")).expect("mkdir");
        fs::create_dir_all(temp.path().join("src")).expect("mkdir");
        fs::write(temp.path().join(".porter/state/x.json"), "{}").expect("seed");
        fs::write(temp.path().join(".git/HEAD"), "ref").expect("seed");
        fs::write(temp.path().join("src/main.rs"), "fn main() {}").expect("seed");

        let hashes = compute_tree_hashes(temp.path()).expect("hashes");
        assert_eq!(hashes.len(), 1);
        assert!(hashes.contains_key("src/main.rs"));
    }

    #[test]
    fn baseline_captures_hashes_and_fingerprints() {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("target");
        fs::create_dir_all(&target).expect("mkdir");
        fs::write(target.join("a.txt"), "content").expect("seed");

        let store = RunStore::new(temp.path().join("runs"), temp.path().join("baselines"));
        let plan = plan_with_tasks(vec![], vec![], vec![]);
        let mut m = manifest("run-1");
        m.target_path = target.display().to_string();
        store
            .save_run_start(&m, &plan, &BTreeMap::new())
            .expect("save");

        let baseline = store.create_baseline("run-1", Some("golden")).expect("baseline");
        assert_eq!(baseline.baseline_id, "golden");
        assert!(baseline.target_file_hashes.contains_key("a.txt"));

        let loaded = store.load_baseline("golden").expect("load");
        assert_eq!(loaded, baseline);
    }
}
