//! Plan load/save with schema and invariant validation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;

use crate::core::invariants::validate_plan_invariants;
use crate::core::plan::{Plan, TaskStatus};

const PLAN_SCHEMA: &str = include_str!("../../schemas/plan/v1.schema.json");

/// Load and validate a plan from disk (schema + invariants).
pub fn load_plan(plan_path: &Path) -> Result<Plan> {
    let contents = fs::read_to_string(plan_path)
        .with_context(|| format!("read plan {}", plan_path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse plan {}", plan_path.display()))?;
    validate_schema(&value)?;
    let plan: Plan = serde_json::from_value(value)
        .with_context(|| format!("deserialize plan {}", plan_path.display()))?;
    let errors = validate_plan_invariants(&plan);
    if !errors.is_empty() {
        return Err(anyhow!("plan invariants failed:\n- {}", errors.join("\n- ")));
    }
    Ok(plan)
}

/// Atomically write a plan to disk.
pub fn write_plan(plan_path: &Path, plan: &Plan) -> Result<()> {
    let parent = plan_path
        .parent()
        .with_context(|| format!("plan path missing parent {}", plan_path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut buf = serde_json::to_string_pretty(plan)?;
    buf.push('\n');
    let tmp_path = plan_path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write temp plan {}", tmp_path.display()))?;
    fs::rename(&tmp_path, plan_path)
        .with_context(|| format!("replace plan {}", plan_path.display()))?;
    Ok(())
}

/// Update one task's status in the persisted plan.
pub fn persist_task_status(plan_path: &Path, task_id: &str, status: TaskStatus) -> Result<()> {
    let mut plan = load_plan(plan_path)?;
    if !plan.set_task_status(task_id, status) {
        return Err(anyhow!("task '{task_id}' not found in plan"));
    }
    write_plan(plan_path, &plan)
}

fn validate_schema(plan: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(PLAN_SCHEMA).context("parse embedded plan schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid plan schema: {err}"))?;
    if !compiled.is_valid(plan) {
        let messages: Vec<String> = compiled
            .iter_errors(plan)
            .map(|err| err.to_string())
            .collect();
        return Err(anyhow!(
            "plan schema validation failed:\n- {}",
            messages.join("\n- ")
        ));
    }
    Ok(())
}
