//! Multi-candidate arbitration: run several engines on one task, score and
//! semantically filter their outputs, optionally escalate to a judge, and
//! apply exactly one winner through the write layer.
//!
//! Losing candidates are never written to the target tree; their outputs,
//! scorecards, and semantic results are retained as audit artifacts under
//! `.porter/arbitration/<task-id>/`.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::core::plan::{EngineKind, Task, WritePolicy};
use crate::core::protocol::{EngineOutput, JudgeVerdict, parse_engine_output, parse_judge_verdict};
use crate::core::scoring::{
    RankedCandidate, Scorecard, Selection, composite_score, is_eligible, score_candidate,
    select_winner,
};
use crate::core::semantics::SemanticCheckResult;
use crate::integrity::IntegrityChecker;
use crate::io::audit::write_json;
use crate::io::config::PorterConfig;
use crate::io::decision_store::DecisionStore;
use crate::io::engine::{EngineRequest, EngineRunner};
use crate::io::hash_store::{load_target_hashes, save_target_hashes};
use crate::io::paths::PorterPaths;
use crate::io::process::{InterruptHandle, run_command_with_timeout};
use crate::io::prompt::{ConvertPromptInputs, JudgeCandidate, PromptBuilder};
use crate::io::write_safety::{WriteReport, merge_and_write, safe_write};

/// Arbitration parameters for one run.
#[derive(Debug, Clone)]
pub struct ArbitrationOptions {
    pub engines: Vec<EngineKind>,
    pub judge_engine: EngineKind,
    pub max_candidates: usize,
    pub use_judge: bool,
}

impl ArbitrationOptions {
    pub fn from_config(config: &PorterConfig) -> Self {
        Self {
            engines: config.arbitration.engines.clone(),
            judge_engine: config.arbitration.judge_engine,
            max_candidates: config.arbitration.max_candidates,
            use_judge: config.arbitration.use_judge,
        }
    }
}

/// One candidate's full record in the persisted decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub engine: EngineKind,
    pub scorecard: Scorecard,
    pub semantic: SemanticCheckResult,
    pub score: f64,
    pub eligible: bool,
}

/// Persisted arbitration decision for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrationDecision {
    pub task_id: String,
    pub winner_engine: EngineKind,
    pub candidates: Vec<CandidateRecord>,
    pub used_judge: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_engine: Option<EngineKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_verdict: Option<JudgeVerdict>,
}

/// Outcome handed back to the executor after the winner is applied.
#[derive(Debug, Clone)]
pub struct AppliedArbitration {
    pub winner_engine: EngineKind,
    pub writes: Vec<(String, WriteReport)>,
    pub interrupted: bool,
}

struct Candidate {
    engine: EngineKind,
    output: EngineOutput,
    scorecard: Scorecard,
    semantic: SemanticCheckResult,
}

/// Arbitration engine bound to one source/target pair.
pub struct ArbitrationEngine<'a> {
    source_root: &'a Path,
    target_root: &'a Path,
    paths: &'a PorterPaths,
    config: &'a PorterConfig,
    runner: &'a dyn EngineRunner,
    interrupt: InterruptHandle,
}

impl<'a> ArbitrationEngine<'a> {
    pub fn new(
        source_root: &'a Path,
        target_root: &'a Path,
        paths: &'a PorterPaths,
        config: &'a PorterConfig,
        runner: &'a dyn EngineRunner,
        interrupt: InterruptHandle,
    ) -> Self {
        Self {
            source_root,
            target_root,
            paths,
            config,
            runner,
            interrupt,
        }
    }

    /// Run arbitration for one task and apply the winner.
    #[instrument(skip_all, fields(task_id = %task.task_id))]
    pub fn arbitrate_task(
        &self,
        task: &Task,
        store: &DecisionStore,
        options: &ArbitrationOptions,
    ) -> Result<AppliedArbitration> {
        let task_dir = self.paths.arbitration_task_dir(&task.task_id);
        fs::create_dir_all(&task_dir)
            .with_context(|| format!("create arbitration dir {}", task_dir.display()))?;

        let inputs = ConvertPromptInputs::gather(
            task,
            self.source_root,
            self.target_root,
            &self.paths.snapshots_dir,
            self.config.inline_source_limit_bytes,
        )?;
        let prompt = PromptBuilder::new(self.config.prompt_budget_bytes).build_convert(&inputs);

        let checker = IntegrityChecker::new(
            &self.paths.semantics_dir,
            self.config.thresholds.clone(),
        );

        let mut candidates: Vec<Candidate> = Vec::new();
        for engine in options.engines.iter().take(options.max_candidates) {
            match self.generate_candidate(task, store, &checker, &task_dir, &prompt, *engine)? {
                CandidateOutcome::Candidate(candidate) => candidates.push(candidate),
                CandidateOutcome::Dropped => {}
                CandidateOutcome::Interrupted => {
                    return Ok(AppliedArbitration {
                        winner_engine: *engine,
                        writes: vec![],
                        interrupted: true,
                    });
                }
            }
        }

        if candidates.is_empty() {
            return Err(anyhow!(
                "no candidates generated for task '{}'",
                task.task_id
            ));
        }

        let ranked: Vec<RankedCandidate> = candidates
            .iter()
            .filter(|c| is_eligible(&c.semantic))
            .map(|c| RankedCandidate {
                engine: c.engine,
                score: composite_score(&c.scorecard, &c.semantic),
                confidence: c.semantic.confidence,
            })
            .collect();

        let (winner, used_judge, judge_verdict) =
            match select_winner(&ranked, options.use_judge) {
                Selection::NoneEligible => {
                    return Err(anyhow!(
                        "no candidates survived semantic filtering for task '{}'",
                        task.task_id
                    ));
                }
                Selection::Winner(engine) => (engine, false, None),
                Selection::NeedsJudge { leader } => {
                    match self.consult_judge(task, &candidates, &ranked, &task_dir, options)? {
                        JudgeOutcome::Winner(engine, verdict) => (engine, true, Some(verdict)),
                        JudgeOutcome::Fallback => {
                            warn!("judge unusable, falling back to heuristic leader");
                            (leader, true, None)
                        }
                        JudgeOutcome::Interrupted => {
                            return Ok(AppliedArbitration {
                                winner_engine: leader,
                                writes: vec![],
                                interrupted: true,
                            });
                        }
                    }
                }
            };

        info!(winner = %winner, used_judge, "arbitration winner selected");
        let winning = candidates
            .iter()
            .find(|c| c.engine == winner)
            .ok_or_else(|| anyhow!("winner engine '{winner}' has no candidate"))?;

        let writes = self.apply_winner(task, &winning.output)?;

        let decision = ArbitrationDecision {
            task_id: task.task_id.clone(),
            winner_engine: winner,
            candidates: candidates
                .iter()
                .map(|c| CandidateRecord {
                    engine: c.engine,
                    scorecard: c.scorecard.clone(),
                    semantic: c.semantic.clone(),
                    score: composite_score(&c.scorecard, &c.semantic),
                    eligible: is_eligible(&c.semantic),
                })
                .collect(),
            used_judge,
            judge_engine: used_judge.then_some(options.judge_engine),
            judge_verdict,
        };
        write_json(&task_dir.join("decision.json"), &decision)?;

        Ok(AppliedArbitration {
            winner_engine: winner,
            writes,
            interrupted: false,
        })
    }

    fn generate_candidate(
        &self,
        task: &Task,
        store: &DecisionStore,
        checker: &IntegrityChecker,
        task_dir: &Path,
        prompt: &str,
        engine: EngineKind,
    ) -> Result<CandidateOutcome> {
        info!(engine = %engine, "generating candidate");
        fs::write(
            task_dir.join(format!("prompt_{engine}.txt")),
            prompt,
        )
        .with_context(|| format!("write candidate prompt for {engine}"))?;

        let timeout =
            Duration::from_secs(task.timeout_secs.unwrap_or(self.config.engine_timeout_secs));
        let response = self.runner.invoke(&EngineRequest {
            engine,
            prompt: prompt.to_string(),
            workdir: self.source_root.to_path_buf(),
            timeout,
            output_limit_bytes: self.config.output_limit_bytes,
            extra_args: task.engine_args.clone(),
            interrupt: self.interrupt.clone(),
        })?;

        fs::write(
            task_dir.join(format!("candidate_{engine}.stdout.txt")),
            &response.stdout,
        )?;
        fs::write(
            task_dir.join(format!("candidate_{engine}.stderr.txt")),
            &response.stderr,
        )?;

        if response.interrupted {
            return Ok(CandidateOutcome::Interrupted);
        }
        if !response.succeeded() {
            // A failing candidate is dropped, not retried.
            warn!(engine = %engine, exit_code = ?response.exit_code, "candidate engine failed");
            return Ok(CandidateOutcome::Dropped);
        }

        let output = match parse_engine_output(&response.stdout) {
            Ok(output) => output,
            Err(err) => {
                warn!(engine = %engine, err = %err, "candidate output unparsable");
                return Ok(CandidateOutcome::Dropped);
            }
        };
        write_json(&task_dir.join(format!("candidate_{engine}.json")), &output)?;

        let mut scorecard = score_candidate(&output, &task.target_files);
        if let Some(validation_cmd) = &task.validation_cmd {
            scorecard.validation_passed =
                Some(self.validate_in_sandbox(&output, validation_cmd)?);
        }

        let combined: String = output
            .files
            .iter()
            .map(|f| f.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let semantic = checker.analyze_content(&combined, &task.criteria_text(), store)?;

        write_json(&task_dir.join(format!("scorecard_{engine}.json")), &scorecard)?;
        write_json(&task_dir.join(format!("semantic_{engine}.json")), &semantic)?;

        Ok(CandidateOutcome::Candidate(Candidate {
            engine,
            output,
            scorecard,
            semantic,
        }))
    }

    /// Run the task's validation command against a throwaway copy of the
    /// candidate's files.
    fn validate_in_sandbox(&self, output: &EngineOutput, validation_cmd: &str) -> Result<bool> {
        let sandbox = tempfile::tempdir().context("create validation sandbox")?;
        for file in &output.files {
            let path = sandbox
                .path()
                .join(file.path.trim_start_matches(['/', '\\']));
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create sandbox dir {}", parent.display()))?;
            }
            fs::write(&path, &file.content)
                .with_context(|| format!("write sandbox file {}", path.display()))?;
        }

        let mut cmd = std::process::Command::new("sh");
        cmd.arg("-c").arg(validation_cmd).current_dir(sandbox.path());
        let result = run_command_with_timeout(
            cmd,
            None,
            Duration::from_secs(self.config.validation_timeout_secs),
            self.config.output_limit_bytes,
            &self.interrupt,
        )?;
        Ok(result.status.success())
    }

    fn consult_judge(
        &self,
        task: &Task,
        candidates: &[Candidate],
        ranked: &[RankedCandidate],
        task_dir: &Path,
        options: &ArbitrationOptions,
    ) -> Result<JudgeOutcome> {
        info!(judge = %options.judge_engine, "consulting judge engine");
        let judge_inputs: Vec<JudgeCandidate> = candidates
            .iter()
            .filter(|c| ranked.iter().any(|r| r.engine == c.engine))
            .map(|c| JudgeCandidate {
                engine: c.engine.as_str().to_string(),
                deliverables_ok: c.scorecard.deliverables_ok,
                equivalence: c.semantic.semantic_equivalence.as_str().to_string(),
                confidence: c.semantic.confidence,
                placeholder_penalty: c.scorecard.placeholder_penalty,
                validation: match c.scorecard.validation_passed {
                    Some(true) => "passed".to_string(),
                    Some(false) => "failed".to_string(),
                    None => "not run".to_string(),
                },
                output_json: serde_json::to_string_pretty(&c.output).unwrap_or_default(),
            })
            .collect();

        let prompt = PromptBuilder::new(self.config.prompt_budget_bytes)
            .build_judge(&task.criteria_text(), &judge_inputs);

        let response = self.runner.invoke(&EngineRequest {
            engine: options.judge_engine,
            prompt,
            workdir: self.source_root.to_path_buf(),
            timeout: Duration::from_secs(self.config.engine_timeout_secs),
            output_limit_bytes: self.config.output_limit_bytes,
            extra_args: vec![],
            interrupt: self.interrupt.clone(),
        })?;

        if response.interrupted {
            return Ok(JudgeOutcome::Interrupted);
        }
        if !response.succeeded() {
            warn!(exit_code = ?response.exit_code, "judge engine failed");
            return Ok(JudgeOutcome::Fallback);
        }

        let verdict = match parse_judge_verdict(&response.stdout) {
            Ok(verdict) => verdict,
            Err(err) => {
                warn!(err = %err, "judge output malformed");
                return Ok(JudgeOutcome::Fallback);
            }
        };
        write_json(&task_dir.join("judge.json"), &verdict)?;

        let Ok(winner) = EngineKind::from_str(&verdict.winner_engine) else {
            warn!(named = %verdict.winner_engine, "judge named an unknown engine");
            return Ok(JudgeOutcome::Fallback);
        };
        if !ranked.iter().any(|r| r.engine == winner) {
            warn!(named = %winner, "judge named an engine outside the eligible set");
            return Ok(JudgeOutcome::Fallback);
        }
        Ok(JudgeOutcome::Winner(winner, verdict))
    }

    /// Write only the winner's files, honoring the task's write policy and
    /// deferring to merge logic where applicable.
    fn apply_winner(&self, task: &Task, output: &EngineOutput) -> Result<Vec<(String, WriteReport)>> {
        let policy = task.effective_write_policy();
        let mut ledger = load_target_hashes(&self.paths.target_hashes_path)?;
        let mut writes = Vec::new();

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
                    self.target_root,
                    &task.task_id,
                    &mut ledger,
                )?
            } else {
                safe_write(
                    &file.path,
                    &file.content,
                    self.target_root,
                    &task.task_id,
                    policy,
                    &mut ledger,
                )?
            };
            writes.push((file.path.clone(), report));
        }

        save_target_hashes(&self.paths.target_hashes_path, &ledger)?;
        Ok(writes)
    }
}

enum CandidateOutcome {
    Candidate(Candidate),
    Dropped,
    Interrupted,
}

enum JudgeOutcome {
    Winner(EngineKind, JudgeVerdict),
    Fallback,
    Interrupted,
}

/// Load a persisted arbitration decision (CLI `arbitration show`).
pub fn load_decision(paths: &PorterPaths, task_id: &str) -> Result<ArbitrationDecision> {
    let path: PathBuf = paths.arbitration_task_dir(task_id).join("decision.json");
    if !path.exists() {
        return Err(anyhow!("no arbitration decision recorded for '{task_id}'"));
    }
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read decision {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse decision {}", path.display()))
}
