//! Shared helpers for unit and integration tests.

use std::cell::RefCell;
use std::collections::VecDeque;

use anyhow::Result;

use crate::core::plan::{Phase, Plan, RealizationAction, Task, TaskStatus};
use crate::io::engine::{EngineRequest, EngineResponse, EngineRunner};

/// Minimal pending task for a phase.
pub fn task(task_id: &str, phase: Phase) -> Task {
    Task {
        task_id: task_id.to_string(),
        phase,
        title: format!("task {task_id}"),
        engine: crate::core::plan::EngineKind::Claude,
        status: TaskStatus::Pending,
        prompt_ref: None,
        depends_on: vec![],
        acceptance_criteria: vec![],
        deliverables: vec![],
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
    }
}

/// Plan wrapping the given phase task lists.
pub fn plan_with_tasks(
    scaffold_tasks: Vec<Task>,
    file_tasks: Vec<Task>,
    final_sweep_tasks: Vec<Task>,
) -> Plan {
    Plan {
        plan_version: "1.0".to_string(),
        pipeline_id: "test-pipeline".to_string(),
        intent: "test".to_string(),
        created_at: String::new(),
        decision_fingerprint: String::new(),
        source_inventory_fingerprint: String::new(),
        target_inventory_fingerprint: String::new(),
        scaffold_tasks,
        file_tasks,
        final_sweep_tasks,
        checkpoints: vec![],
    }
}

/// One scripted engine invocation.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub stdout: String,
    pub exit_code: i32,
}

impl ScriptedResponse {
    /// A successful response carrying the files protocol.
    pub fn files(entries: &[(&str, &str)]) -> Self {
        let files: Vec<serde_json::Value> = entries
            .iter()
            .map(|(path, content)| serde_json::json!({"path": path, "content": content}))
            .collect();
        Self {
            stdout: serde_json::json!({ "files": files }).to_string(),
            exit_code: 0,
        }
    }

    pub fn raw(stdout: &str, exit_code: i32) -> Self {
        Self {
            stdout: stdout.to_string(),
            exit_code,
        }
    }
}

/// Engine runner that replays scripted responses in order and records
/// each request's engine and prompt.
pub struct ScriptedEngine {
    responses: RefCell<VecDeque<ScriptedResponse>>,
    pub invocations: RefCell<Vec<(String, String)>>,
}

impl ScriptedEngine {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            responses: RefCell::new(responses.into()),
            invocations: RefCell::new(Vec::new()),
        }
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.borrow().len()
    }
}

impl EngineRunner for ScriptedEngine {
    fn invoke(&self, request: &EngineRequest) -> Result<EngineResponse> {
        self.invocations
            .borrow_mut()
            .push((request.engine.as_str().to_string(), request.prompt.clone()));
        let scripted = self
            .responses
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| ScriptedResponse::raw("", 1));
        Ok(EngineResponse {
            exit_code: Some(scripted.exit_code),
            stdout: scripted.stdout,
            stderr: String::new(),
            timed_out: false,
            interrupted: false,
        })
    }
}
