//! Porter CLI: plan, validate, run, replay, and inspect conversion
//! pipelines.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};

use porter::arbitration::{ArbitrationOptions, load_decision};
use porter::core::convergence::Convergence;
use porter::core::plan::{CheckpointStatus, EngineKind};
use porter::executor::{ExecutionOptions, RunStop, TaskExecutor};
use porter::exit_codes;
use porter::io::config::{load_config, write_config};
use porter::io::decision_store::DecisionStore;
use porter::io::engine::ProcessEngineRunner;
use porter::io::paths::PorterPaths;
use porter::io::plan_store::{load_plan, write_plan};
use porter::io::run_store::RunStore;
use porter::planner::{generate_plan, load_inventory};
use porter::replay::{ReplayFilter, ReplayMode, ReplayOptions, diff_runs, run_replay};
use porter::validate::validate_pipeline;

#[derive(Parser)]
#[command(name = "porter", version, about = "Source-tree conversion pipeline runner")]
struct Cli {
    /// Source repository root.
    #[arg(long, default_value = ".", global = true)]
    source: PathBuf,

    /// Target repository root.
    #[arg(long, default_value = ".", global = true)]
    target: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the `.porter/` layout and a default config.
    Init,
    /// Generate a plan from an inventory document.
    Plan {
        /// Inventory JSON produced by the source scanner.
        #[arg(long)]
        inventory: PathBuf,
        /// Pipeline identifier recorded in the plan.
        #[arg(long, default_value = "default")]
        pipeline_id: String,
    },
    /// Check the plan against schema, invariants, and coverage.
    Validate {
        #[arg(long)]
        inventory: Option<PathBuf>,
    },
    /// Execute the plan.
    Run {
        /// Stop after N tasks.
        #[arg(long)]
        limit: Option<usize>,
        /// Resume from the first non-terminal task.
        #[arg(long)]
        resume: bool,
        /// Continue past tasks flagged for semantic review.
        #[arg(long)]
        accept_semantic_risk: bool,
        /// Run file tasks through multi-engine arbitration.
        #[arg(long)]
        arbitrate: bool,
        /// Comma-separated candidate engines.
        #[arg(long)]
        arbitrate_engines: Option<String>,
        #[arg(long)]
        judge_engine: Option<EngineKind>,
        #[arg(long)]
        max_candidates: Option<usize>,
        /// Disable judge escalation.
        #[arg(long)]
        no_judge: bool,
    },
    /// Approve, reject, or override a pending checkpoint.
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
    /// Replay a recorded run and report drift.
    Replay {
        run_id: String,
        /// Re-execute into a rehearsal directory (default).
        #[arg(long, conflicts_with = "apply")]
        dry: bool,
        /// Re-execute against the real target.
        #[arg(long)]
        apply: bool,
        /// Narrow to `task:<id>` or `phase:<name>`.
        #[arg(long)]
        only: Option<ReplayFilter>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 1)]
        max_replay_rounds: usize,
        /// Fail the moment any round reports drift.
        #[arg(long)]
        fail_on_any_drift: bool,
        /// Permit deviating from the recorded engines.
        #[arg(long)]
        allow_engine_change: bool,
        /// Replace the recorded engines (requires --allow-engine-change).
        #[arg(long)]
        engine: Option<EngineKind>,
    },
    /// Inspect recorded runs.
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },
    /// Manage durable baselines.
    Baseline {
        #[command(subcommand)]
        action: BaselineAction,
    },
    /// Inspect arbitration decisions.
    Arbitration {
        #[command(subcommand)]
        action: ArbitrationAction,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    Approve { checkpoint_id: String },
    Reject { checkpoint_id: String },
    Override { checkpoint_id: String },
}

#[derive(Subcommand)]
enum RunsAction {
    List,
    Show { run_id: String },
    Diff { run_a: String, run_b: String },
}

#[derive(Subcommand)]
enum BaselineAction {
    Create {
        run_id: String,
        #[arg(long)]
        name: Option<String>,
    },
}

#[derive(Subcommand)]
enum ArbitrationAction {
    Show { task_id: String },
}

fn main() -> ExitCode {
    porter::logging::init();
    match run() {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(u8::try_from(exit_codes::INVALID).unwrap_or(1))
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init => cmd_init(&cli.target),
        Command::Plan {
            ref inventory,
            ref pipeline_id,
        } => cmd_plan(&cli.target, inventory, pipeline_id),
        Command::Validate { ref inventory } => cmd_validate(&cli.target, inventory.as_deref()),
        Command::Run {
            limit,
            resume,
            accept_semantic_risk,
            arbitrate,
            ref arbitrate_engines,
            judge_engine,
            max_candidates,
            no_judge,
        } => cmd_run(
            &cli,
            RunArgs {
                limit,
                resume,
                accept_semantic_risk,
                arbitrate,
                arbitrate_engines: arbitrate_engines.clone(),
                judge_engine,
                max_candidates,
                no_judge,
            },
        ),
        Command::Checkpoint { ref action } => cmd_checkpoint(&cli.target, action),
        Command::Replay {
            ref run_id,
            dry: _,
            apply,
            ref only,
            limit,
            max_replay_rounds,
            fail_on_any_drift,
            allow_engine_change,
            engine,
        } => cmd_replay(
            &cli,
            run_id,
            ReplayOptions {
                mode: if apply {
                    ReplayMode::Apply
                } else {
                    ReplayMode::Dry
                },
                only: only.clone(),
                limit,
                max_replay_rounds,
                fail_on_any_drift,
                allow_engine_change,
                engine_override: engine,
            },
        ),
        Command::Runs { ref action } => cmd_runs(&cli.target, action),
        Command::Baseline { ref action } => cmd_baseline(&cli.target, action),
        Command::Arbitration { ref action } => cmd_arbitration(&cli.target, action),
    }
}

struct RunArgs {
    limit: Option<usize>,
    resume: bool,
    accept_semantic_risk: bool,
    arbitrate: bool,
    arbitrate_engines: Option<String>,
    judge_engine: Option<EngineKind>,
    max_candidates: Option<usize>,
    no_judge: bool,
}

fn cmd_init(target: &std::path::Path) -> Result<i32> {
    let paths = PorterPaths::new(target);
    paths.ensure_layout()?;
    if !paths.config_path.exists() {
        write_config(&paths.config_path, &porter::io::config::PorterConfig::default())?;
    }
    DecisionStore::open(&paths.memory_dir)?;
    println!("initialized {}", paths.porter_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_plan(target: &std::path::Path, inventory_path: &std::path::Path, pipeline_id: &str) -> Result<i32> {
    let paths = PorterPaths::new(target);
    paths.ensure_layout()?;
    let store = DecisionStore::open(&paths.memory_dir)?;
    let inventory = load_inventory(inventory_path)?;
    let plan = generate_plan(&inventory, &store, pipeline_id)?;
    write_plan(&paths.plan_path, &plan)?;
    println!(
        "plan written to {} ({} scaffold, {} file, {} sweep tasks)",
        paths.plan_path.display(),
        plan.scaffold_tasks.len(),
        plan.file_tasks.len(),
        plan.final_sweep_tasks.len()
    );
    Ok(exit_codes::OK)
}

fn cmd_validate(target: &std::path::Path, inventory: Option<&std::path::Path>) -> Result<i32> {
    let violations = validate_pipeline(target, inventory)?;
    if violations.is_empty() {
        println!("plan is valid");
        return Ok(exit_codes::OK);
    }
    for violation in &violations {
        eprintln!("violation: {violation}");
    }
    Ok(exit_codes::INVALID)
}

fn cmd_run(cli: &Cli, args: RunArgs) -> Result<i32> {
    let mut flags_used = Vec::new();
    if let Some(limit) = args.limit {
        flags_used.push(format!("--limit {limit}"));
    }
    if args.resume {
        flags_used.push("--resume".to_string());
    }
    if args.accept_semantic_risk {
        flags_used.push("--accept-semantic-risk".to_string());
    }
    if args.arbitrate {
        flags_used.push("--arbitrate".to_string());
    }

    let arbitration = if args.arbitrate {
        let config = load_config(&PorterPaths::new(&cli.target).config_path)?;
        let mut options = ArbitrationOptions::from_config(&config);
        if let Some(engines) = &args.arbitrate_engines {
            options.engines = parse_engine_list(engines)?;
        }
        if let Some(judge) = args.judge_engine {
            options.judge_engine = judge;
        }
        if let Some(max_candidates) = args.max_candidates {
            options.max_candidates = max_candidates;
        }
        if args.no_judge {
            options.use_judge = false;
        }
        Some(options)
    } else {
        None
    };

    let runner = ProcessEngineRunner;
    let executor = TaskExecutor::new(&cli.source, &cli.target, &runner)?;
    let outcome = executor.run(&ExecutionOptions {
        limit: args.limit,
        resume: args.resume,
        accept_semantic_risk: args.accept_semantic_risk,
        arbitration,
        flags_used,
    })?;

    println!(
        "run {} executed {} task(s)",
        outcome.run_id, outcome.executed
    );
    match outcome.stop {
        RunStop::Completed => {
            println!("plan execution completed");
            Ok(exit_codes::OK)
        }
        RunStop::LimitReached => {
            println!("execution limit reached");
            Ok(exit_codes::OK)
        }
        RunStop::CheckpointPending { checkpoint_id } => {
            println!("checkpoint '{checkpoint_id}' requires disposition:");
            println!("  porter checkpoint approve {checkpoint_id}");
            println!("  porter checkpoint reject {checkpoint_id}");
            println!("  porter checkpoint override {checkpoint_id}");
            Ok(exit_codes::CHECKPOINT_PENDING)
        }
        RunStop::PausedForReview { task_id } => {
            println!(
                "task '{task_id}' paused for semantic review; re-run with --accept-semantic-risk to continue"
            );
            Ok(exit_codes::PAUSED_FOR_REVIEW)
        }
        RunStop::Blocked { reason } => {
            eprintln!("pipeline blocked: {reason}");
            Ok(exit_codes::INVALID)
        }
        RunStop::Interrupted { task_id } => {
            match task_id {
                Some(task_id) => eprintln!("interrupted during task '{task_id}'"),
                None => eprintln!("interrupted between tasks"),
            }
            eprintln!("re-run with --resume to continue");
            Ok(exit_codes::INVALID)
        }
    }
}

fn cmd_checkpoint(target: &std::path::Path, action: &CheckpointAction) -> Result<i32> {
    let (checkpoint_id, status) = match action {
        CheckpointAction::Approve { checkpoint_id } => (checkpoint_id, CheckpointStatus::Approved),
        CheckpointAction::Reject { checkpoint_id } => (checkpoint_id, CheckpointStatus::Rejected),
        CheckpointAction::Override { checkpoint_id } => {
            (checkpoint_id, CheckpointStatus::Overridden)
        }
    };

    let paths = PorterPaths::new(target);
    let mut plan = load_plan(&paths.plan_path)?;
    let checkpoint = plan
        .find_checkpoint_mut(checkpoint_id)
        .ok_or_else(|| anyhow!("checkpoint '{checkpoint_id}' not found"))?;
    checkpoint.status = status;
    write_plan(&paths.plan_path, &plan)?;
    println!("checkpoint '{checkpoint_id}' marked {status:?}");
    Ok(exit_codes::OK)
}

fn cmd_replay(cli: &Cli, run_id: &str, options: ReplayOptions) -> Result<i32> {
    let runner = ProcessEngineRunner;
    let fail_on_any_drift = options.fail_on_any_drift;
    let outcome = run_replay(&cli.source, &cli.target, &runner, run_id, &options)?;

    for report in &outcome.reports {
        println!(
            "round {}: structural changes {}, decision drift {}, semantic drift {}",
            report.round,
            report.structural.change_count(),
            report.decision.drift_detected,
            report.semantic.drift_detected
        );
    }

    if fail_on_any_drift && outcome.drift_detected {
        eprintln!("drift detected and --fail-on-any-drift is set");
        return Ok(exit_codes::INVALID);
    }

    match outcome.convergence {
        Some(Convergence::Converged) => {
            println!("replay converged");
            Ok(exit_codes::OK)
        }
        Some(Convergence::Trending) => {
            println!("replay trending toward convergence");
            Ok(exit_codes::OK)
        }
        Some(Convergence::NonConvergent { reason }) => {
            eprintln!("replay non-convergent: {reason}");
            Ok(exit_codes::INVALID)
        }
        None => {
            println!(
                "replay finished, drift {}",
                if outcome.drift_detected {
                    "detected"
                } else {
                    "not detected"
                }
            );
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_runs(target: &std::path::Path, action: &RunsAction) -> Result<i32> {
    let paths = PorterPaths::new(target);
    let run_store = RunStore::new(paths.runs_dir.clone(), paths.baselines_dir.clone());
    match action {
        RunsAction::List => {
            for manifest in run_store.list_runs()? {
                println!(
                    "{}  {}  {:?}",
                    manifest.run_id, manifest.started_at, manifest.status
                );
            }
        }
        RunsAction::Show { run_id } => {
            let manifest = run_store.load_manifest(run_id)?;
            println!("{}", serde_json::to_string_pretty(&manifest)?);
        }
        RunsAction::Diff { run_a, run_b } => {
            let comparison = diff_runs(target, run_a, run_b)?;
            println!("{}", serde_json::to_string_pretty(&comparison)?);
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_baseline(target: &std::path::Path, action: &BaselineAction) -> Result<i32> {
    let paths = PorterPaths::new(target);
    let run_store = RunStore::new(paths.runs_dir.clone(), paths.baselines_dir.clone());
    match action {
        BaselineAction::Create { run_id, name } => {
            let baseline = run_store.create_baseline(run_id, name.as_deref())?;
            println!(
                "baseline '{}' created from run {} ({} files)",
                baseline.baseline_id,
                baseline.from_run_id,
                baseline.target_file_hashes.len()
            );
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_arbitration(target: &std::path::Path, action: &ArbitrationAction) -> Result<i32> {
    let paths = PorterPaths::new(target);
    match action {
        ArbitrationAction::Show { task_id } => {
            let decision = load_decision(&paths, task_id)?;
            println!("{}", serde_json::to_string_pretty(&decision)?);
        }
    }
    Ok(exit_codes::OK)
}

fn parse_engine_list(raw: &str) -> Result<Vec<EngineKind>> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<EngineKind>()
                .map_err(|err| anyhow!(err))
                .with_context(|| format!("parse engine list '{raw}'"))
        })
        .collect()
}
