//! Replay and convergence scenarios.

use std::fs;
use std::path::PathBuf;

use porter::core::convergence::Convergence;
use porter::core::plan::{EngineKind, Phase, RealizationAction};
use porter::executor::{ExecutionOptions, RunStop, TaskExecutor};
use porter::io::paths::PorterPaths;
use porter::io::plan_store::write_plan;
use porter::replay::{ReplayMode, ReplayOptions, run_replay};
use porter::test_support::{ScriptedEngine, ScriptedResponse, plan_with_tasks, task};

struct Pipeline {
    _temp: tempfile::TempDir,
    source: PathBuf,
    target: PathBuf,
}

impl Pipeline {
    fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = temp.path().join("source");
        let target = temp.path().join("target");
        fs::create_dir_all(&source).expect("source dir");
        fs::create_dir_all(&target).expect("target dir");
        Self {
            _temp: temp,
            source,
            target,
        }
    }
}

fn copy_plan() -> porter::core::plan::Plan {
    let mut copy = task("t-copy", Phase::File);
    copy.engine = EngineKind::FileCopy;
    copy.realization_action = RealizationAction::Copy;
    copy.source_files = vec!["main.py".to_string()];
    copy.target_files = vec!["main.py".to_string()];
    plan_with_tasks(vec![], vec![copy], vec![])
}

fn record_run(pipeline: &Pipeline) -> String {
    let runner = ScriptedEngine::new(vec![]);
    let executor =
        TaskExecutor::new(&pipeline.source, &pipeline.target, &runner).expect("executor");
    let outcome = executor.run(&ExecutionOptions::default()).expect("run");
    assert_eq!(outcome.stop, RunStop::Completed);
    outcome.run_id
}

/// An idempotent plan replayed in apply mode converges immediately: the
/// re-executed writes are byte-identical, so the round reports zero
/// structural changes.
#[test]
fn idempotent_apply_replay_converges() {
    let pipeline = Pipeline::new();
    fs::write(pipeline.source.join("main.py"), "print('hello')\n").expect("seed");
    write_plan(&PorterPaths::new(&pipeline.target).plan_path, &copy_plan()).expect("plan");
    let run_id = record_run(&pipeline);

    let runner = ScriptedEngine::new(vec![]);
    let outcome = run_replay(
        &pipeline.source,
        &pipeline.target,
        &runner,
        &run_id,
        &ReplayOptions {
            mode: ReplayMode::Apply,
            max_replay_rounds: 3,
            ..ReplayOptions::default()
        },
    )
    .expect("replay");

    assert_eq!(outcome.reports.len(), 1, "clean round stops the loop");
    assert_eq!(outcome.reports[0].structural.change_count(), 0);
    assert_eq!(outcome.convergence, Some(Convergence::Converged));
    assert!(!outcome.reports[0].structural.drift_detected);
}

/// An engine that emits different content every round oscillates: each
/// round modifies the same file, so the change counts never shrink.
#[test]
fn unstable_engine_output_is_non_convergent() {
    let pipeline = Pipeline::new();
    fs::write(pipeline.source.join("widget.py"), "class Widget: pass\n").expect("seed");

    let mut convert = task("t-conv", Phase::File);
    convert.acceptance_criteria = vec!["emit widget registry build".to_string()];
    convert.source_files = vec!["widget.py".to_string()];
    convert.target_files = vec!["widget.rs".to_string()];
    let plan = plan_with_tasks(vec![], vec![convert], vec![]);
    write_plan(&PorterPaths::new(&pipeline.target).plan_path, &plan).expect("plan");

    let runner = ScriptedEngine::new(vec![ScriptedResponse::files(&[(
        "widget.rs",
        "widget registry build alpha",
    )])]);
    let executor =
        TaskExecutor::new(&pipeline.source, &pipeline.target, &runner).expect("executor");
    let outcome = executor.run(&ExecutionOptions::default()).expect("run");
    assert_eq!(outcome.stop, RunStop::Completed);
    let run_id = outcome.run_id;

    let replay_runner = ScriptedEngine::new(vec![
        ScriptedResponse::files(&[("widget.rs", "widget registry build beta")]),
        ScriptedResponse::files(&[("widget.rs", "widget registry build gamma")]),
        ScriptedResponse::files(&[("widget.rs", "widget registry build delta")]),
    ]);
    let outcome = run_replay(
        &pipeline.source,
        &pipeline.target,
        &replay_runner,
        &run_id,
        &ReplayOptions {
            mode: ReplayMode::Apply,
            max_replay_rounds: 3,
            ..ReplayOptions::default()
        },
    )
    .expect("replay");

    assert_eq!(outcome.reports.len(), 3);
    let counts: Vec<usize> = outcome
        .reports
        .iter()
        .map(|r| r.structural.change_count())
        .collect();
    assert_eq!(counts, vec![1, 1, 1]);
    assert!(matches!(
        outcome.convergence,
        Some(Convergence::NonConvergent { .. })
    ));
}

/// Dry replay re-executes into a rehearsal directory: the real target is
/// untouched, and the report diffs against the recorded before-snapshot.
#[test]
fn dry_replay_reports_drift_without_touching_target() {
    let pipeline = Pipeline::new();
    fs::write(pipeline.source.join("main.py"), "print('hello')\n").expect("seed");
    write_plan(&PorterPaths::new(&pipeline.target).plan_path, &copy_plan()).expect("plan");
    let run_id = record_run(&pipeline);

    let target_before = fs::read_to_string(pipeline.target.join("main.py")).expect("read");

    let runner = ScriptedEngine::new(vec![]);
    let outcome = run_replay(
        &pipeline.source,
        &pipeline.target,
        &runner,
        &run_id,
        &ReplayOptions::default(),
    )
    .expect("replay");

    // The original run started from an empty target, so the rehearsal
    // output shows up as added files relative to the before-snapshot.
    assert_eq!(outcome.reports.len(), 1);
    let report = &outcome.reports[0];
    assert_eq!(report.replay_mode, ReplayMode::Dry);
    assert!(report.structural.added_files.contains(&"main.py".to_string()));

    // Real target unchanged; rehearsal tree holds the replayed file.
    assert_eq!(
        fs::read_to_string(pipeline.target.join("main.py")).expect("read"),
        target_before
    );
    let rehearsal = porter::replay::rehearsal_root(&pipeline.target, &run_id);
    assert!(rehearsal.join("main.py").exists());
}

#[test]
fn fail_on_any_drift_short_circuits() {
    let pipeline = Pipeline::new();
    fs::write(pipeline.source.join("main.py"), "print('hello')\n").expect("seed");
    write_plan(&PorterPaths::new(&pipeline.target).plan_path, &copy_plan()).expect("plan");
    let run_id = record_run(&pipeline);

    let runner = ScriptedEngine::new(vec![]);
    let outcome = run_replay(
        &pipeline.source,
        &pipeline.target,
        &runner,
        &run_id,
        &ReplayOptions {
            fail_on_any_drift: true,
            ..ReplayOptions::default()
        },
    )
    .expect("replay");

    assert!(outcome.drift_detected);
    assert_eq!(outcome.reports.len(), 1);
    assert!(outcome.convergence.is_none());
}

#[test]
fn only_filter_restricts_replayed_tasks() {
    let pipeline = Pipeline::new();
    fs::write(pipeline.source.join("main.py"), "print('hello')\n").expect("seed");
    fs::write(pipeline.source.join("README.md"), "# doc\n").expect("seed");

    let mut scaffold = task("t-readme", Phase::Scaffold);
    scaffold.engine = EngineKind::FileCopy;
    scaffold.realization_action = RealizationAction::Copy;
    scaffold.source_files = vec!["README.md".to_string()];
    scaffold.target_files = vec!["README.md".to_string()];
    let mut plan = copy_plan();
    plan.scaffold_tasks.push(scaffold);
    write_plan(&PorterPaths::new(&pipeline.target).plan_path, &plan).expect("plan");
    let run_id = record_run(&pipeline);

    let runner = ScriptedEngine::new(vec![]);
    let outcome = run_replay(
        &pipeline.source,
        &pipeline.target,
        &runner,
        &run_id,
        &ReplayOptions {
            only: Some("task:t-copy".parse().expect("filter")),
            ..ReplayOptions::default()
        },
    )
    .expect("replay");

    // Rehearsal contains only the filtered task's output.
    let rehearsal = porter::replay::rehearsal_root(&pipeline.target, &run_id);
    assert!(rehearsal.join("main.py").exists());
    assert!(!rehearsal.join("README.md").exists());
    assert_eq!(outcome.reports.len(), 1);
}

#[test]
fn runs_are_listed_and_diffable() {
    let pipeline = Pipeline::new();
    fs::write(pipeline.source.join("main.py"), "print('hello')\n").expect("seed");
    write_plan(&PorterPaths::new(&pipeline.target).plan_path, &copy_plan()).expect("plan");
    let first = record_run(&pipeline);

    // A second run over the now-populated target.
    let second = record_run(&pipeline);

    let paths = PorterPaths::new(&pipeline.target);
    let run_store =
        porter::io::run_store::RunStore::new(paths.runs_dir.clone(), paths.baselines_dir.clone());
    let runs = run_store.list_runs().expect("list");
    assert_eq!(runs.len(), 2);

    let comparison = porter::replay::diff_runs(&pipeline.target, &first, &second).expect("diff");
    // The first run started from an empty tree, the second from one with
    // main.py in place.
    assert!(comparison
        .structural
        .added_files
        .contains(&"main.py".to_string()));
    assert!(comparison.decision_fingerprint_match);
}
