//! Phase-ordered, dependency-respecting plan execution.
//!
//! The executor drives the task state machine: compliance gate, dispatch
//! by realization action, semantic gating for file-phase tasks, checkpoint
//! gating, and cooperative interruption. Every task leaves a structured
//! summary behind, success or failure, and genuine errors become open
//! issues in the decision store.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::arbitration::{ArbitrationEngine, ArbitrationOptions};
use crate::core::plan::{
    Checkpoint, CheckpointStatus, EngineKind, Phase, Plan, RealizationAction, Task, TaskStatus,
    WritePolicy,
};
use crate::core::protocol::parse_engine_output;
use crate::core::semantics::{RiskLevel, classify_risk_level};
use crate::core::types::Severity;
use crate::integrity::IntegrityChecker;
use crate::io::audit::{
    ActionRecord, CheckpointSummary, TaskSummary, write_action_record, write_checkpoint_summary,
    write_engine_output_artifacts, write_hash_diff, write_json, write_prompt_artifact,
    write_task_summary,
};
use crate::io::config::{PorterConfig, load_config};
use crate::io::decision_store::DecisionStore;
use crate::io::engine::{EngineRequest, EngineRunner};
use crate::io::hash_store::{TargetHashStore, load_target_hashes, save_target_hashes};
use crate::io::lock::RepoLock;
use crate::io::paths::{PorterPaths, sanitize_component};
use crate::io::plan_store::{load_plan, write_plan};
use crate::io::process::{InterruptHandle, run_command_with_timeout};
use crate::io::prompt::{ConvertPromptInputs, PromptBuilder};
use crate::io::run_store::{
    RunManifest, RunStatus, RunStore, compute_tree_hashes, generate_run_id, git_revision,
    plan_revision,
};
use crate::io::write_safety::{
    WriteAction, WriteReport, WriteSafetyViolation, confine_path, file_hash, merge_and_write,
    safe_write,
};

/// Options for one execution invocation.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    pub limit: Option<usize>,
    pub resume: bool,
    pub accept_semantic_risk: bool,
    pub arbitration: Option<ArbitrationOptions>,
    /// CLI flags recorded verbatim in the run manifest.
    pub flags_used: Vec<String>,
}

/// Why execution stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStop {
    /// All runnable tasks were processed.
    Completed,
    /// The `--limit` budget was spent.
    LimitReached,
    /// A non-auto checkpoint was reached; awaiting disposition.
    CheckpointPending { checkpoint_id: String },
    /// A task was paused for semantic review.
    PausedForReview { task_id: String },
    /// Pipeline-wide block: semantic threshold, cross-file inconsistency,
    /// or a blocking task classification.
    Blocked { reason: String },
    /// Cooperative interrupt; resumable.
    Interrupted { task_id: Option<String> },
}

/// Summary of one execution invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub run_id: String,
    pub executed: usize,
    pub stop: RunStop,
}

/// Owned, shareable view of the running execution: current task pointer
/// plus the cooperative stop flag. Lifecycle is bound to one execution
/// invocation, not a global singleton.
#[derive(Debug, Clone, Default)]
pub struct ExecutionState {
    interrupt: InterruptHandle,
    current_task: Arc<Mutex<Option<String>>>,
}

impl ExecutionState {
    pub fn request_stop(&self) {
        self.interrupt.request_stop();
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub fn current_task(&self) -> Option<String> {
        self.current_task.lock().expect("state lock poisoned").clone()
    }

    fn set_current(&self, task_id: Option<&str>) {
        *self.current_task.lock().expect("state lock poisoned") = task_id.map(str::to_string);
    }
}

enum TaskDisposition {
    Done,
    Halt(RunStop),
}

/// Plan executor bound to one source/target pair and an injected engine
/// runner.
pub struct TaskExecutor<'a> {
    source_root: PathBuf,
    target_root: PathBuf,
    /// Where task-status mutations persist. Defaults to the plan under
    /// `.porter/plan/`; replay points this into the run directory.
    plan_path: PathBuf,
    config: PorterConfig,
    runner: &'a dyn EngineRunner,
    state: ExecutionState,
}

impl<'a> TaskExecutor<'a> {
    pub fn new(source_root: &Path, target_root: &Path, runner: &'a dyn EngineRunner) -> Result<Self> {
        let paths = PorterPaths::new(target_root);
        let config = load_config(&paths.config_path)?;
        Ok(Self {
            source_root: source_root.to_path_buf(),
            target_root: target_root.to_path_buf(),
            plan_path: paths.plan_path,
            config,
            runner,
            state: ExecutionState::default(),
        })
    }

    /// Persist task-status mutations to an alternate plan file (replay).
    pub fn with_plan_path(mut self, plan_path: &Path) -> Self {
        self.plan_path = plan_path.to_path_buf();
        self
    }

    pub fn state(&self) -> ExecutionState {
        self.state.clone()
    }

    pub fn config(&self) -> &PorterConfig {
        &self.config
    }

    /// Execute the plan stored at the configured plan path.
    pub fn run(&self, options: &ExecutionOptions) -> Result<RunOutcome> {
        let plan = load_plan(&self.plan_path)?;
        self.run_with_plan(plan, options)
    }

    /// Execute an already-loaded plan.
    #[instrument(skip_all, fields(target = %self.target_root.display()))]
    pub fn run_with_plan(&self, mut plan: Plan, options: &ExecutionOptions) -> Result<RunOutcome> {
        let paths = PorterPaths::new(&self.target_root);
        paths.ensure_layout()?;

        let store = DecisionStore::open(&paths.memory_dir)?;
        self.ensure_plan_fresh(&plan, &store)?;
        self.ensure_no_rejected_checkpoint(&plan)?;

        let run_id = generate_run_id();
        let _target_lock = RepoLock::acquire(&self.target_root, &run_id)?;
        let _source_lock = if self.source_root != self.target_root {
            Some(RepoLock::acquire(&self.source_root, &run_id)?)
        } else {
            None
        };

        let run_store = RunStore::new(paths.runs_dir.clone(), paths.baselines_dir.clone());
        let manifest = self.capture_manifest(&run_id, &plan, &store, options)?;
        let hashes_before = compute_tree_hashes(&self.target_root)?;
        run_store.save_run_start(&manifest, &plan, &hashes_before)?;

        let checker = IntegrityChecker::new(&paths.semantics_dir, self.config.thresholds.clone());
        let issue_ids: Vec<String> = store
            .open_issues()?
            .into_iter()
            .map(|issue| issue.issue_id)
            .collect();
        write_json(
            &run_store.run_dir(&run_id).join("open_issues_before.json"),
            &issue_ids,
        )?;
        write_json(
            &run_store.run_dir(&run_id).join("semantic_summary_before.json"),
            &checker.load_summary()?,
        )?;

        let outcome = self.run_tasks(&paths, &mut plan, &store, &checker, options, &run_id);
        let run_status = match &outcome {
            Ok(outcome) => match outcome.stop {
                RunStop::Completed | RunStop::LimitReached => RunStatus::Completed,
                RunStop::Blocked { .. } => RunStatus::Failed,
                RunStop::Interrupted { .. }
                | RunStop::CheckpointPending { .. }
                | RunStop::PausedForReview { .. } => RunStatus::Interrupted,
            },
            Err(_) => RunStatus::Failed,
        };
        run_store.finalize(&run_id, run_status, &git_revision(&self.target_root))?;

        outcome
    }

    fn run_tasks(
        &self,
        paths: &PorterPaths,
        plan: &mut Plan,
        store: &DecisionStore,
        checker: &IntegrityChecker,
        options: &ExecutionOptions,
        run_id: &str,
    ) -> Result<RunOutcome> {
        let mut executed = 0usize;

        let phase_ids: Vec<(Phase, Vec<String>)> = plan
            .phases()
            .iter()
            .map(|(phase, tasks)| (*phase, tasks.iter().map(|t| t.task_id.clone()).collect()))
            .collect();

        for (phase, task_ids) in phase_ids {
            for task_id in task_ids {
                if self.state.interrupt.is_stop_requested() {
                    info!("stop requested between tasks");
                    return Ok(RunOutcome {
                        run_id: run_id.to_string(),
                        executed,
                        stop: RunStop::Interrupted { task_id: None },
                    });
                }
                if let Some(limit) = options.limit
                    && executed >= limit
                {
                    info!(limit, "execution limit reached");
                    return Ok(RunOutcome {
                        run_id: run_id.to_string(),
                        executed,
                        stop: RunStop::LimitReached,
                    });
                }

                let task = plan
                    .find_task(&task_id)
                    .ok_or_else(|| anyhow!("task '{task_id}' vanished from plan"))?
                    .clone();

                if task.status.is_terminal() {
                    debug!(
                        task_id = %task.task_id,
                        status = task.status.as_str(),
                        "skipping terminal task"
                    );
                    continue;
                }
                if !self.dependencies_met(plan, &task) {
                    info!(task_id = %task.task_id, "skipping task this pass: unmet dependencies");
                    continue;
                }

                self.state.set_current(Some(&task.task_id));
                executed += 1;
                let disposition =
                    self.execute_task(paths, plan, store, checker, options, phase, &task);
                self.state.set_current(None);

                match disposition {
                    Ok(TaskDisposition::Done) => {}
                    Ok(TaskDisposition::Halt(stop)) => {
                        return Ok(RunOutcome {
                            run_id: run_id.to_string(),
                            executed,
                            stop,
                        });
                    }
                    Err(err) => {
                        // Write-safety violations abort the run outright.
                        if err.downcast_ref::<WriteSafetyViolation>().is_some() {
                            return Err(err);
                        }
                        self.record_task_failure(plan, store, paths, &task, &err)?;
                    }
                }

                if let Some(stop) = self.handle_checkpoints(paths, plan, store, checker, &task)? {
                    return Ok(RunOutcome {
                        run_id: run_id.to_string(),
                        executed,
                        stop,
                    });
                }
            }
        }

        Ok(RunOutcome {
            run_id: run_id.to_string(),
            executed,
            stop: RunStop::Completed,
        })
    }

    fn dependencies_met(&self, plan: &Plan, task: &Task) -> bool {
        task.depends_on.iter().all(|dep| {
            plan.find_task(dep)
                .is_some_and(|dep_task| dep_task.status == TaskStatus::Completed)
        })
    }

    /// Run one task end to end. Returns `Halt` for pipeline-stopping
    /// conditions; plain errors mark the task failed at the call site.
    #[instrument(skip_all, fields(task_id = %task.task_id, phase = phase.as_str()))]
    fn execute_task(
        &self,
        paths: &PorterPaths,
        plan: &mut Plan,
        store: &DecisionStore,
        checker: &IntegrityChecker,
        options: &ExecutionOptions,
        phase: Phase,
        task: &Task,
    ) -> Result<TaskDisposition> {
        let violations = store.check_task_compliance(task)?;
        if !violations.is_empty() {
            warn!(task_id = %task.task_id, "task violates active decisions");
            self.set_status(paths, plan, &task.task_id, TaskStatus::Failed)?;
            let mut summary = TaskSummary::new(task);
            summary.errors = violations.clone();
            self.persist_summary(paths, store, &summary)?;
            store.add_issue(
                Severity::High,
                &format!(
                    "task {} blocked by compliance violations: {}",
                    task.task_id,
                    violations.join("; ")
                ),
                std::slice::from_ref(&task.task_id),
            )?;
            return Ok(TaskDisposition::Done);
        }

        let mut summary = TaskSummary::new(task);
        for source in &task.source_files {
            if let Some(hash) = file_hash(&self.source_root.join(source))? {
                summary.hashes_before.insert(source.clone(), hash);
            }
        }

        self.set_status(paths, plan, &task.task_id, TaskStatus::Running)?;

        match self.dispatch(paths, store, options, task, &mut summary) {
            Ok(TaskDisposition::Halt(stop)) => {
                // Engine-level interruption: partial summary, resumable state.
                if let RunStop::Interrupted { .. } = stop {
                    self.set_status(paths, plan, &task.task_id, TaskStatus::Interrupted)?;
                    summary
                        .warnings
                        .push("task interrupted before completion".to_string());
                    self.capture_after_hashes(task, &mut summary)?;
                    self.persist_summary(paths, store, &summary)?;
                }
                Ok(TaskDisposition::Halt(stop))
            }
            Ok(TaskDisposition::Done) => {
                let terminal_status = if task.realization_action == RealizationAction::Skip {
                    TaskStatus::Skipped
                } else {
                    TaskStatus::Completed
                };
                self.set_status(paths, plan, &task.task_id, terminal_status)?;
                summary.success = true;
                self.capture_after_hashes(task, &mut summary)?;
                self.persist_summary(paths, store, &summary)?;
                info!(task_id = %task.task_id, "task completed");

                // The gate judges transformed content; byte-preserving
                // copies have nothing to lose semantically.
                let transforms_content = matches!(
                    task.realization_action,
                    RealizationAction::Convert | RealizationAction::Merge
                );
                if phase == Phase::File
                    && terminal_status == TaskStatus::Completed
                    && transforms_content
                {
                    return self.apply_semantic_gate(paths, plan, store, checker, options, task);
                }
                Ok(TaskDisposition::Done)
            }
            Err(err) => {
                if err.downcast_ref::<WriteSafetyViolation>().is_some() {
                    return Err(err);
                }
                self.set_status(paths, plan, &task.task_id, TaskStatus::Failed)?;
                summary.errors.push(format!("{err:#}"));
                self.capture_after_hashes(task, &mut summary)?;
                self.persist_summary(paths, store, &summary)?;
                store.add_issue(
                    Severity::High,
                    &format!("error during task {}: {err:#}", task.task_id),
                    std::slice::from_ref(&task.task_id),
                )?;
                warn!(task_id = %task.task_id, err = %err, "task failed");
                Ok(TaskDisposition::Done)
            }
        }
    }

    /// Dispatch by realization action and engine kind.
    fn dispatch(
        &self,
        paths: &PorterPaths,
        store: &DecisionStore,
        options: &ExecutionOptions,
        task: &Task,
        summary: &mut TaskSummary,
    ) -> Result<TaskDisposition> {
        match task.realization_action {
            RealizationAction::Skip => {
                let mut record = ActionRecord::new(&task.task_id, "skip");
                record.reason = Some(
                    task.skip_reason
                        .clone()
                        .unwrap_or_else(|| "no reason provided".to_string()),
                );
                write_action_record(&paths.outputs_dir, &record)?;
                summary
                    .semantic_decisions
                    .push("task skipped by plan".to_string());
                Ok(TaskDisposition::Done)
            }
            RealizationAction::Copy => {
                self.copy_action(paths, task, summary)?;
                Ok(TaskDisposition::Done)
            }
            RealizationAction::Merge => {
                self.merge_action(paths, task, summary)?;
                Ok(TaskDisposition::Done)
            }
            RealizationAction::Convert => match task.engine {
                EngineKind::FileCopy => {
                    self.copy_action(paths, task, summary)?;
                    Ok(TaskDisposition::Done)
                }
                EngineKind::DirectoryCreate => {
                    self.directory_create_action(task)?;
                    Ok(TaskDisposition::Done)
                }
                _ => self.convert_action(paths, store, options, task, summary),
            },
        }
    }

    fn copy_action(
        &self,
        paths: &PorterPaths,
        task: &Task,
        summary: &mut TaskSummary,
    ) -> Result<()> {
        let mut ledger = self.load_ledger(paths)?;
        let policy = task.effective_write_policy();

        for (index, source_file) in task.source_files.iter().enumerate() {
            let target_file = task.target_files.get(index).unwrap_or(source_file).clone();
            let source_path = self.source_root.join(source_file);
            let content = fs::read_to_string(&source_path)
                .with_context(|| format!("read source {}", source_path.display()))?;

            let report = safe_write(
                &target_file,
                &content,
                &self.target_root,
                &task.task_id,
                policy,
                &mut ledger,
            )?;
            self.record_write(paths, task, &target_file, &report, summary)?;
        }

        self.save_ledger(paths, &ledger)?;
        let mut record = ActionRecord::new(&task.task_id, "copy");
        record.source_files = task.source_files.clone();
        record.target_files = task.target_files.clone();
        write_action_record(&paths.outputs_dir, &record)?;
        Ok(())
    }

    fn merge_action(
        &self,
        paths: &PorterPaths,
        task: &Task,
        summary: &mut TaskSummary,
    ) -> Result<()> {
        let strategy = task
            .merge_strategy
            .ok_or_else(|| anyhow!("merge task '{}' has no merge_strategy", task.task_id))?;
        let target_file = task
            .target_files
            .first()
            .ok_or_else(|| anyhow!("merge task '{}' has no target_files", task.task_id))?;

        let mut incoming = String::new();
        for source_file in &task.source_files {
            let source_path = self.source_root.join(source_file);
            let content = fs::read_to_string(&source_path)
                .with_context(|| format!("read merge source {}", source_path.display()))?;
            incoming.push_str(&content);
            incoming.push('\n');
        }

        let mut ledger = self.load_ledger(paths)?;
        let report = merge_and_write(
            target_file,
            &incoming,
            strategy,
            task.merge_markers.as_ref(),
            &self.target_root,
            &task.task_id,
            &mut ledger,
        )?;
        self.save_ledger(paths, &ledger)?;
        self.record_write(paths, task, target_file, &report, summary)?;

        let mut record = ActionRecord::new(&task.task_id, "merge");
        record.source_files = task.source_files.clone();
        record.target_files = vec![target_file.clone()];
        write_action_record(&paths.outputs_dir, &record)?;
        Ok(())
    }

    fn directory_create_action(&self, task: &Task) -> Result<()> {
        for target in &task.target_files {
            let is_directory = target.ends_with('/')
                || Path::new(target)
                    .file_name()
                    .is_some_and(|name| !name.to_string_lossy().contains('.'));
            if !is_directory {
                continue;
            }
            let confined = confine_path(target.trim_end_matches('/'), &self.target_root)?;
            fs::create_dir_all(&confined)
                .with_context(|| format!("create directory {}", confined.display()))?;
        }
        Ok(())
    }

    /// Convert via an AI engine, or via arbitration when enabled for
    /// file-phase tasks.
    fn convert_action(
        &self,
        paths: &PorterPaths,
        store: &DecisionStore,
        options: &ExecutionOptions,
        task: &Task,
        summary: &mut TaskSummary,
    ) -> Result<TaskDisposition> {
        if task.phase == Phase::File
            && let Some(arbitration_options) = &options.arbitration
        {
            let engine = ArbitrationEngine::new(
                &self.source_root,
                &self.target_root,
                paths,
                &self.config,
                self.runner,
                self.state.interrupt_handle(),
            );
            let applied = engine.arbitrate_task(task, store, arbitration_options)?;
            if applied.interrupted {
                return Ok(TaskDisposition::Halt(RunStop::Interrupted {
                    task_id: Some(task.task_id.clone()),
                }));
            }
            summary
                .semantic_decisions
                .push(format!("arbitration winner: {}", applied.winner_engine));
            for (target, report) in &applied.writes {
                self.record_write(paths, task, target, report, summary)?;
            }
            return Ok(TaskDisposition::Done);
        }

        let inputs = ConvertPromptInputs::gather(
            task,
            &self.source_root,
            &self.target_root,
            &paths.snapshots_dir,
            self.config.inline_source_limit_bytes,
        )?;
        let prompt = PromptBuilder::new(self.config.prompt_budget_bytes).build_convert(&inputs);
        write_prompt_artifact(&paths.inputs_dir, &task.task_id, task.engine.as_str(), &prompt)?;

        let timeout =
            Duration::from_secs(task.timeout_secs.unwrap_or(self.config.engine_timeout_secs));
        let response = self.runner.invoke(&EngineRequest {
            engine: task.engine,
            prompt,
            workdir: self.source_root.clone(),
            timeout,
            output_limit_bytes: self.config.output_limit_bytes,
            extra_args: task.engine_args.clone(),
            interrupt: self.state.interrupt_handle(),
        })?;
        write_engine_output_artifacts(
            &paths.outputs_dir,
            &task.task_id,
            task.engine.as_str(),
            &response.stdout,
            &response.stderr,
        )?;

        if response.interrupted {
            return Ok(TaskDisposition::Halt(RunStop::Interrupted {
                task_id: Some(task.task_id.clone()),
            }));
        }
        if response.timed_out {
            return Err(anyhow!(
                "engine {} timed out after {}s",
                task.engine,
                timeout.as_secs()
            ));
        }
        if !response.succeeded() {
            return Err(anyhow!(
                "engine {} exited with {:?}: {}",
                task.engine,
                response.exit_code,
                response.stderr.trim()
            ));
        }

        let output = parse_engine_output(&response.stdout)?;
        write_json(
            &paths.outputs_dir.join(format!(
                "task_{}_{}.parsed.json",
                sanitize_component(&task.task_id),
                task.engine.as_str()
            )),
            &output,
        )?;

        let policy = task.effective_write_policy();
        let mut ledger = self.load_ledger(paths)?;
        for file in &output.files {
            let report = if policy == WritePolicy::Merge {
                let strategy = task.merge_strategy.ok_or_else(|| {
                    anyhow!(
                        "merge policy requires merge_strategy for task '{}'",
                        task.task_id
                    )
                })?;
                merge_and_write(
                    &file.path,
                    &file.content,
                    strategy,
                    task.merge_markers.as_ref(),
                    &self.target_root,
                    &task.task_id,
                    &mut ledger,
                )?
            } else {
                safe_write(
                    &file.path,
                    &file.content,
                    &self.target_root,
                    &task.task_id,
                    policy,
                    &mut ledger,
                )?
            };
            self.record_write(paths, task, &file.path, &report, summary)?;
        }
        self.save_ledger(paths, &ledger)?;

        if let Some(validation_cmd) = &task.validation_cmd {
            self.run_validation(paths, task, validation_cmd, summary)?;
        }

        Ok(TaskDisposition::Done)
    }

    /// Run the task's validation command in the target root. A nonzero
    /// exit is recorded as a warning, not a task failure.
    fn run_validation(
        &self,
        paths: &PorterPaths,
        task: &Task,
        validation_cmd: &str,
        summary: &mut TaskSummary,
    ) -> Result<()> {
        let mut cmd = std::process::Command::new("sh");
        cmd.arg("-c")
            .arg(validation_cmd)
            .current_dir(&self.target_root);
        let output = run_command_with_timeout(
            cmd,
            None,
            Duration::from_secs(self.config.validation_timeout_secs),
            self.config.output_limit_bytes,
            &self.state.interrupt_handle(),
        )?;

        let mut record = ActionRecord::new(&task.task_id, "validation");
        record.reason = Some(validation_cmd.to_string());
        record.exit_code = output.status.code();
        write_action_record(&paths.outputs_dir, &record)?;

        if !output.status.success() {
            summary.warnings.push(format!(
                "validation command exited with {:?}",
                output.status.code()
            ));
        }
        Ok(())
    }

    /// Post-write semantic gate for file-phase tasks.
    fn apply_semantic_gate(
        &self,
        paths: &PorterPaths,
        plan: &mut Plan,
        store: &DecisionStore,
        checker: &IntegrityChecker,
        options: &ExecutionOptions,
        task: &Task,
    ) -> Result<TaskDisposition> {
        let result = checker.run_check(task, &self.target_root, store)?;
        match classify_risk_level(&result, options.accept_semantic_risk) {
            RiskLevel::Block => {
                warn!(task_id = %task.task_id, "blocking: low semantic equivalence");
                self.set_status(paths, plan, &task.task_id, TaskStatus::Failed)?;
                store.add_issue(
                    Severity::High,
                    &format!("task {} blocked on low semantic equivalence", task.task_id),
                    std::slice::from_ref(&task.task_id),
                )?;
                return Ok(TaskDisposition::Halt(RunStop::Blocked {
                    reason: format!("task {} has low semantic equivalence", task.task_id),
                }));
            }
            RiskLevel::Pause => {
                warn!(task_id = %task.task_id, "pausing for semantic review");
                self.set_status(paths, plan, &task.task_id, TaskStatus::PausedForReview)?;
                return Ok(TaskDisposition::Halt(RunStop::PausedForReview {
                    task_id: task.task_id.clone(),
                }));
            }
            RiskLevel::Escalate => {
                store.add_issue(
                    Severity::Medium,
                    &format!(
                        "task {} has semantic risks: {:?}",
                        task.task_id, result.risk_flags
                    ),
                    std::slice::from_ref(&task.task_id),
                )?;
            }
            RiskLevel::Continue => {}
        }

        let exceeded = checker.exceeded_thresholds()?;
        if !exceeded.is_empty() {
            warn!("semantic drift thresholds exceeded");
            return Ok(TaskDisposition::Halt(RunStop::Blocked {
                reason: format!("semantic drift thresholds exceeded: {}", exceeded.join("; ")),
            }));
        }

        let inconsistencies = checker.cross_file_inconsistencies(store)?;
        let mut high = Vec::new();
        for inconsistency in &inconsistencies {
            store.add_issue(
                inconsistency.severity,
                &inconsistency.description,
                &inconsistency.affected_tasks,
            )?;
            if inconsistency.severity == Severity::High {
                high.push(inconsistency.description.clone());
            }
        }
        if !high.is_empty() {
            return Ok(TaskDisposition::Halt(RunStop::Blocked {
                reason: format!("cross-file semantic inconsistencies: {}", high.join("; ")),
            }));
        }

        Ok(TaskDisposition::Done)
    }

    /// After a terminal task, surface a reached checkpoint. Auto-continue
    /// checkpoints complete in place; others suspend the run.
    fn handle_checkpoints(
        &self,
        paths: &PorterPaths,
        plan: &mut Plan,
        store: &DecisionStore,
        checker: &IntegrityChecker,
        task: &Task,
    ) -> Result<Option<RunStop>> {
        let Some(checkpoint) = plan.reached_pending_checkpoint(&task.task_id).cloned() else {
            return Ok(None);
        };

        info!(checkpoint_id = %checkpoint.checkpoint_id, "checkpoint reached");
        let summary = self.checkpoint_summary(plan, store, checker, &checkpoint)?;
        write_checkpoint_summary(&paths.checkpoint_dir(&checkpoint.checkpoint_id), &summary)?;

        if checkpoint.auto_continue {
            if let Some(stored) = plan.find_checkpoint_mut(&checkpoint.checkpoint_id) {
                stored.status = CheckpointStatus::Completed;
            }
            write_plan(&self.plan_path, plan)?;
            return Ok(None);
        }

        write_plan(&self.plan_path, plan)?;
        Ok(Some(RunStop::CheckpointPending {
            checkpoint_id: checkpoint.checkpoint_id,
        }))
    }

    fn checkpoint_summary(
        &self,
        plan: &Plan,
        store: &DecisionStore,
        checker: &IntegrityChecker,
        checkpoint: &Checkpoint,
    ) -> Result<CheckpointSummary> {
        let semantic_summary = checker.load_summary()?;
        let mut requirements_unmet = Vec::new();
        for requirement in &checkpoint.requires {
            match requirement.as_str() {
                "semantic_ok" => {
                    if semantic_summary.unresolved_warnings > 0 {
                        requirements_unmet.push(format!(
                            "semantic_ok: {} unresolved semantic warnings",
                            semantic_summary.unresolved_warnings
                        ));
                    }
                }
                other => {
                    debug!(requirement = other, "requirement needs manual verification");
                }
            }
        }

        Ok(CheckpointSummary {
            checkpoint_id: checkpoint.checkpoint_id.clone(),
            label: checkpoint.label.clone(),
            created_at: chrono::Utc::now().to_rfc3339(),
            tasks_completed: plan
                .tasks()
                .filter(|t| t.status == TaskStatus::Completed)
                .count(),
            tasks_failed: plan
                .tasks()
                .filter(|t| t.status == TaskStatus::Failed)
                .count(),
            semantic_summary: serde_json::to_value(&semantic_summary)?,
            open_issues: store.open_issues()?.len(),
            top_risk_flags: semantic_summary.cumulative_risk_flags.clone(),
            requires: checkpoint.requires.clone(),
            requirements_unmet,
            auto_continue: checkpoint.auto_continue,
        })
    }

    fn capture_manifest(
        &self,
        run_id: &str,
        plan: &Plan,
        store: &DecisionStore,
        options: &ExecutionOptions,
    ) -> Result<RunManifest> {
        let mut engines: Vec<EngineKind> = plan.tasks().map(|t| t.engine).collect();
        if let Some(arbitration) = &options.arbitration {
            engines.extend(arbitration.engines.iter().copied());
            engines.push(arbitration.judge_engine);
        }
        engines.sort();
        engines.dedup();

        Ok(RunManifest {
            run_id: run_id.to_string(),
            started_at: chrono::Utc::now().to_rfc3339(),
            ended_at: String::new(),
            pipeline_id: plan.pipeline_id.clone(),
            source_path: self.source_root.display().to_string(),
            source_revision: git_revision(&self.source_root),
            target_path: self.target_root.display().to_string(),
            target_revision_before: git_revision(&self.target_root),
            target_revision_after: String::new(),
            plan_revision: plan_revision(plan)?,
            decision_fingerprint: store.decision_fingerprint()?,
            engines_used: engines,
            flags_used: options.flags_used.clone(),
            status: RunStatus::Running,
        })
    }

    fn ensure_plan_fresh(&self, plan: &Plan, store: &DecisionStore) -> Result<()> {
        if plan.decision_fingerprint.is_empty() {
            return Ok(());
        }
        let current = store.decision_fingerprint()?;
        if current != plan.decision_fingerprint {
            return Err(anyhow!(
                "plan is stale: decision fingerprint changed since planning \
                 (plan {}, current {}); re-run `porter plan`",
                plan.decision_fingerprint,
                current
            ));
        }
        Ok(())
    }

    fn ensure_no_rejected_checkpoint(&self, plan: &Plan) -> Result<()> {
        if let Some(rejected) = plan
            .checkpoints
            .iter()
            .find(|cp| cp.status == CheckpointStatus::Rejected)
        {
            return Err(anyhow!(
                "checkpoint '{}' was rejected; resolve it before resuming",
                rejected.checkpoint_id
            ));
        }
        Ok(())
    }

    fn record_task_failure(
        &self,
        plan: &mut Plan,
        store: &DecisionStore,
        paths: &PorterPaths,
        task: &Task,
        err: &anyhow::Error,
    ) -> Result<()> {
        self.set_status(paths, plan, &task.task_id, TaskStatus::Failed)?;
        let mut summary = TaskSummary::new(task);
        summary.errors.push(format!("{err:#}"));
        self.persist_summary(paths, store, &summary)?;
        store.add_issue(
            Severity::High,
            &format!("error during task {}: {err:#}", task.task_id),
            std::slice::from_ref(&task.task_id),
        )?;
        Ok(())
    }

    fn record_write(
        &self,
        paths: &PorterPaths,
        task: &Task,
        target_path: &str,
        report: &WriteReport,
        summary: &mut TaskSummary,
    ) -> Result<()> {
        debug!(
            target = target_path,
            action = ?report.action,
            changed = report.changed,
            "write applied"
        );
        if report.changed {
            let diff = write_hash_diff(
                &paths.diffs_dir,
                &task.task_id,
                target_path,
                report.before_hash.as_deref(),
                report.after_hash.as_deref(),
            )?;
            summary.diff_references.push(diff.display().to_string());
        } else if report.action == WriteAction::Skipped {
            summary
                .warnings
                .push(format!("{target_path}: skipped by write policy"));
        }
        Ok(())
    }

    fn capture_after_hashes(&self, task: &Task, summary: &mut TaskSummary) -> Result<()> {
        for target in &task.target_files {
            if let Some(hash) = file_hash(&self.target_root.join(target))? {
                summary.hashes_after.insert(target.clone(), hash);
            }
        }
        Ok(())
    }

    fn persist_summary(
        &self,
        paths: &PorterPaths,
        store: &DecisionStore,
        summary: &TaskSummary,
    ) -> Result<()> {
        write_task_summary(&paths.outputs_dir, summary)?;
        store.add_summary_entry(&summary.task_id, &summary.log_line())?;
        Ok(())
    }

    fn set_status(
        &self,
        _paths: &PorterPaths,
        plan: &mut Plan,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<()> {
        if !plan.set_task_status(task_id, status) {
            return Err(anyhow!("task '{task_id}' not found in plan"));
        }
        write_plan(&self.plan_path, plan)
    }

    fn load_ledger(&self, paths: &PorterPaths) -> Result<TargetHashStore> {
        load_target_hashes(&paths.target_hashes_path)
    }

    fn save_ledger(&self, paths: &PorterPaths, ledger: &TargetHashStore) -> Result<()> {
        save_target_hashes(&paths.target_hashes_path, ledger)
    }
}
