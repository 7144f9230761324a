//! Plan generation from an inventory document.
//!
//! The inventory itself comes from an external scanner; the planner turns
//! it into scaffold, file, and sweep tasks with fingerprints captured from
//! the decision store so staleness is detectable at run time.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;

use crate::core::plan::{
    EngineKind, Inventory, Phase, Plan, RealizationAction, Task, TaskStatus,
};
use crate::io::decision_store::DecisionStore;
use crate::io::paths::sanitize_component;
use crate::io::write_safety::content_hash;

/// Load an inventory document from disk.
pub fn load_inventory(path: &Path) -> Result<Inventory> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read inventory {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse inventory {}", path.display()))
}

/// Generate a plan covering every inventory file exactly once.
pub fn generate_plan(
    inventory: &Inventory,
    store: &DecisionStore,
    pipeline_id: &str,
) -> Result<Plan> {
    let default_engine = preferred_engine(store)?;

    let mut scaffold_tasks = Vec::new();
    let directories: BTreeSet<String> = inventory
        .files
        .iter()
        .filter_map(|file| {
            Path::new(&file.path)
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .map(|parent| format!("{}/", parent.display()))
        })
        .collect();
    if !directories.is_empty() {
        scaffold_tasks.push(Task {
            task_id: "t-scaffold-001".to_string(),
            phase: Phase::Scaffold,
            title: "Create target directory skeleton".to_string(),
            engine: EngineKind::DirectoryCreate,
            status: TaskStatus::Pending,
            prompt_ref: Some("inputs/scaffold_directories.txt".to_string()),
            depends_on: vec![],
            acceptance_criteria: vec!["Target directory layout exists".to_string()],
            deliverables: vec![],
            source_files: vec![],
            target_files: directories.into_iter().collect(),
            write_policy: None,
            merge_strategy: None,
            merge_markers: None,
            realization_action: RealizationAction::Convert,
            skip_reason: None,
            validation_cmd: None,
            timeout_secs: None,
            engine_args: vec![],
        });
    }

    let mut file_tasks = Vec::new();
    for (index, file) in inventory.files.iter().enumerate() {
        let mechanical = file
            .roles
            .iter()
            .any(|role| role == "asset" || role == "docs");
        file_tasks.push(Task {
            task_id: format!("t-file-{:03}", index + 1),
            phase: Phase::File,
            title: format!("Convert {}", file.path),
            engine: if mechanical {
                EngineKind::FileCopy
            } else {
                default_engine
            },
            status: TaskStatus::Pending,
            prompt_ref: Some(format!(
                "inputs/convert_{}.txt",
                sanitize_component(&file.path.replace('/', "_"))
            )),
            depends_on: vec![],
            acceptance_criteria: vec![format!(
                "Convert {} preserving its behavior in the target stack",
                file.path
            )],
            deliverables: vec![file.path.clone()],
            source_files: vec![file.path.clone()],
            target_files: vec![file.path.clone()],
            write_policy: None,
            merge_strategy: None,
            merge_markers: None,
            realization_action: if mechanical {
                RealizationAction::Copy
            } else {
                RealizationAction::Convert
            },
            skip_reason: None,
            validation_cmd: None,
            timeout_secs: None,
            engine_args: vec![],
        });
    }

    let final_sweep_tasks = vec![Task {
        task_id: "t-sweep-001".to_string(),
        phase: Phase::Sweep,
        title: "Verify conversion coverage".to_string(),
        engine: EngineKind::Codex,
        status: TaskStatus::Pending,
        prompt_ref: Some("inputs/verify_coverage.txt".to_string()),
        depends_on: vec![],
        acceptance_criteria: vec![
            "Every source file has a converted counterpart in the target tree".to_string(),
        ],
        deliverables: vec![".porter/outputs/coverage_report.json".to_string()],
        source_files: vec![],
        target_files: vec![],
        write_policy: None,
        merge_strategy: None,
        merge_markers: None,
        realization_action: RealizationAction::Convert,
        skip_reason: None,
        validation_cmd: None,
        timeout_secs: None,
        engine_args: vec![],
    }];

    let inventory_fingerprint = content_hash(
        serde_json::to_string(inventory)
            .context("serialize inventory for fingerprint")?
            .as_bytes(),
    );

    Ok(Plan {
        plan_version: "1.0".to_string(),
        pipeline_id: pipeline_id.to_string(),
        intent: format!("convert {} source files", inventory.files.len()),
        created_at: Utc::now().to_rfc3339(),
        decision_fingerprint: store.decision_fingerprint()?,
        source_inventory_fingerprint: inventory_fingerprint,
        target_inventory_fingerprint: String::new(),
        scaffold_tasks,
        file_tasks,
        final_sweep_tasks,
        checkpoints: vec![],
    })
}

/// Engine to use for convert tasks: an `engine_choice` decision wins,
/// otherwise claude.
fn preferred_engine(store: &DecisionStore) -> Result<EngineKind> {
    for decision in store.active_decisions()? {
        if decision.category == "engine_choice"
            && let Some(value) = decision.value.as_str()
            && let Ok(engine) = value.parse::<EngineKind>()
        {
            return Ok(engine);
        }
    }
    Ok(EngineKind::Claude)
}
