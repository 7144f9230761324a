//! Plan document data model.
//!
//! A plan groups tasks into three phases executed strictly in order:
//! scaffold, file, sweep. These types are the stable contract between the
//! planner, the executor, and replay; they carry no behavior beyond
//! lookups and status bookkeeping.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Execution phase a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Scaffold,
    File,
    Sweep,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Scaffold => "scaffold",
            Phase::File => "file",
            Phase::Sweep => "sweep",
        }
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scaffold" => Ok(Phase::Scaffold),
            "file" => Ok(Phase::File),
            "sweep" => Ok(Phase::Sweep),
            other => Err(format!("unknown phase '{other}'")),
        }
    }
}

/// Engine that realizes a task: an external AI process or a mechanical
/// action performed by the runner itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Qwen,
    Gemini,
    Claude,
    Codex,
    FileCopy,
    DirectoryCreate,
}

impl EngineKind {
    /// Mechanical engines are executed in-process, never spawned.
    pub fn is_mechanical(self) -> bool {
        matches!(self, EngineKind::FileCopy | EngineKind::DirectoryCreate)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::Qwen => "qwen",
            EngineKind::Gemini => "gemini",
            EngineKind::Claude => "claude",
            EngineKind::Codex => "codex",
            EngineKind::FileCopy => "file_copy",
            EngineKind::DirectoryCreate => "directory_create",
        }
    }
}

impl std::str::FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "qwen" => Ok(EngineKind::Qwen),
            "gemini" => Ok(EngineKind::Gemini),
            "claude" => Ok(EngineKind::Claude),
            "codex" => Ok(EngineKind::Codex),
            "file_copy" => Ok(EngineKind::FileCopy),
            "directory_create" => Ok(EngineKind::DirectoryCreate),
            other => Err(format!("unknown engine '{other}'")),
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task lifecycle status. Mutated only by the executor and arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Interrupted,
    PausedForReview,
    Invalidated,
    Skipped,
}

impl TaskStatus {
    /// Terminal statuses are never re-attempted on resume.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Skipped
                | TaskStatus::Invalidated
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Interrupted => "interrupted",
            TaskStatus::PausedForReview => "paused_for_review",
            TaskStatus::Invalidated => "invalidated",
            TaskStatus::Skipped => "skipped",
        }
    }
}

/// Conflict-resolution rule when a target path already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    Overwrite,
    Merge,
    SkipIfExists,
    FailIfExists,
}

/// Content transform applied when a task merges into an existing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    AppendSection,
    ReplaceSectionByMarker,
    JsonMerge,
    TomlMerge,
}

/// Marker pair delimiting the span replaced by
/// [`MergeStrategy::ReplaceSectionByMarker`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeMarkers {
    pub begin: String,
    pub end: String,
}

/// Task-level strategy for applying the task's effect to the target tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RealizationAction {
    #[default]
    Convert,
    Copy,
    Merge,
    Skip,
}

/// A single unit of work in the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub phase: Phase,
    #[serde(default)]
    pub title: String,
    pub engine: EngineKind,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_ref: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub deliverables: Vec<String>,
    #[serde(default)]
    pub source_files: Vec<String>,
    #[serde(default)]
    pub target_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_policy: Option<WritePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_strategy: Option<MergeStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_markers: Option<MergeMarkers>,
    #[serde(default)]
    pub realization_action: RealizationAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_cmd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub engine_args: Vec<String>,
}

impl Task {
    /// Effective write policy: explicit value, else the phase default.
    ///
    /// Scaffold and sweep tasks must not keep rewriting project files, so
    /// they default to skipping existing targets.
    pub fn effective_write_policy(&self) -> WritePolicy {
        if let Some(policy) = self.write_policy {
            return policy;
        }
        match self.phase {
            Phase::Scaffold | Phase::Sweep => WritePolicy::SkipIfExists,
            Phase::File => WritePolicy::Overwrite,
        }
    }

    /// Joined acceptance criteria used as the conversion summary for
    /// prompt building and semantic checks.
    pub fn criteria_text(&self) -> String {
        self.acceptance_criteria.join("\n")
    }
}

/// Checkpoint lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    Overridden,
    Completed,
}

/// A declared point where automatic progress halts pending disposition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    #[serde(default)]
    pub label: String,
    pub after_tasks: Vec<String>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub auto_continue: bool,
    #[serde(default)]
    pub status: CheckpointStatus,
}

/// Persisted plan document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_version: String,
    pub pipeline_id: String,
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub decision_fingerprint: String,
    #[serde(default)]
    pub source_inventory_fingerprint: String,
    #[serde(default)]
    pub target_inventory_fingerprint: String,
    pub scaffold_tasks: Vec<Task>,
    pub file_tasks: Vec<Task>,
    pub final_sweep_tasks: Vec<Task>,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
}

impl Plan {
    /// Phases in execution order with their task lists.
    pub fn phases(&self) -> [(Phase, &[Task]); 3] {
        [
            (Phase::Scaffold, self.scaffold_tasks.as_slice()),
            (Phase::File, self.file_tasks.as_slice()),
            (Phase::Sweep, self.final_sweep_tasks.as_slice()),
        ]
    }

    /// All tasks in phase order, then list order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.scaffold_tasks
            .iter()
            .chain(self.file_tasks.iter())
            .chain(self.final_sweep_tasks.iter())
    }

    pub fn tasks_mut(&mut self) -> impl Iterator<Item = &mut Task> {
        self.scaffold_tasks
            .iter_mut()
            .chain(self.file_tasks.iter_mut())
            .chain(self.final_sweep_tasks.iter_mut())
    }

    pub fn find_task(&self, task_id: &str) -> Option<&Task> {
        self.tasks().find(|task| task.task_id == task_id)
    }

    pub fn find_task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks_mut().find(|task| task.task_id == task_id)
    }

    /// Set a task's status. Returns false when the id is unknown.
    pub fn set_task_status(&mut self, task_id: &str, status: TaskStatus) -> bool {
        match self.find_task_mut(task_id) {
            Some(task) => {
                task.status = status;
                true
            }
            None => false,
        }
    }

    pub fn task_ids(&self) -> BTreeSet<String> {
        self.tasks().map(|task| task.task_id.clone()).collect()
    }

    pub fn find_checkpoint_mut(&mut self, checkpoint_id: &str) -> Option<&mut Checkpoint> {
        self.checkpoints
            .iter_mut()
            .find(|cp| cp.checkpoint_id == checkpoint_id)
    }

    /// A checkpoint is reached once every task in `after_tasks` is terminal.
    pub fn reached_pending_checkpoint(&self, just_finished: &str) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|cp| {
            cp.status == CheckpointStatus::Pending
                && cp.after_tasks.iter().any(|id| id == just_finished)
                && cp.after_tasks.iter().all(|id| {
                    self.find_task(id)
                        .is_some_and(|task| task.status.is_terminal())
                })
        })
    }
}

/// Inventory document produced by an external scanner. Consumed read-only
/// as the coverage oracle for plan validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    pub files: Vec<InventoryFile>,
    #[serde(default)]
    pub total_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryFile {
    pub path: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{plan_with_tasks, task};

    #[test]
    fn effective_write_policy_defaults_by_phase() {
        let mut scaffold = task("t1", Phase::Scaffold);
        assert_eq!(
            scaffold.effective_write_policy(),
            WritePolicy::SkipIfExists
        );

        let file = task("t2", Phase::File);
        assert_eq!(file.effective_write_policy(), WritePolicy::Overwrite);

        scaffold.write_policy = Some(WritePolicy::FailIfExists);
        assert_eq!(
            scaffold.effective_write_policy(),
            WritePolicy::FailIfExists
        );
    }

    #[test]
    fn tasks_iterate_in_phase_order() {
        let plan = plan_with_tasks(
            vec![task("s1", Phase::Scaffold)],
            vec![task("f1", Phase::File), task("f2", Phase::File)],
            vec![task("w1", Phase::Sweep)],
        );

        let ids: Vec<&str> = plan.tasks().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "f1", "f2", "w1"]);
    }

    #[test]
    fn checkpoint_reached_only_when_after_tasks_terminal() {
        let mut plan = plan_with_tasks(
            vec![task("s1", Phase::Scaffold)],
            vec![task("f1", Phase::File)],
            vec![],
        );
        plan.checkpoints.push(Checkpoint {
            checkpoint_id: "cp1".to_string(),
            label: "after scaffold".to_string(),
            after_tasks: vec!["s1".to_string(), "f1".to_string()],
            requires: vec![],
            auto_continue: false,
            status: CheckpointStatus::Pending,
        });

        plan.set_task_status("s1", TaskStatus::Completed);
        assert!(plan.reached_pending_checkpoint("s1").is_none());

        plan.set_task_status("f1", TaskStatus::Failed);
        let reached = plan.reached_pending_checkpoint("f1").expect("checkpoint");
        assert_eq!(reached.checkpoint_id, "cp1");
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::PausedForReview).expect("serialize");
        assert_eq!(json, "\"paused_for_review\"");
        assert!(!TaskStatus::PausedForReview.is_terminal());
        assert!(TaskStatus::Invalidated.is_terminal());
    }
}
