//! Plan invariants not expressible via JSON Schema.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::plan::{Inventory, Plan, RealizationAction};

/// Check semantic invariants of a plan:
/// - task ids unique across all three phases
/// - `depends_on` references only ids present in the plan
/// - dependency graph is acyclic
/// - `prompt_ref` values rooted under `inputs/`
/// - merge tasks declare a `merge_strategy`
pub fn validate_plan_invariants(plan: &Plan) -> Vec<String> {
    let mut errors = Vec::new();

    let mut seen = BTreeSet::new();
    for task in plan.tasks() {
        if !seen.insert(task.task_id.as_str()) {
            errors.push(format!("duplicate task id '{}'", task.task_id));
        }
    }

    for task in plan.tasks() {
        for dep in &task.depends_on {
            if !seen.contains(dep.as_str()) {
                errors.push(format!(
                    "task '{}' depends on unknown task '{}'",
                    task.task_id, dep
                ));
            }
        }
        if let Some(prompt_ref) = &task.prompt_ref
            && !prompt_ref.starts_with("inputs/")
        {
            errors.push(format!(
                "task '{}' prompt_ref '{}' is not under inputs/",
                task.task_id, prompt_ref
            ));
        }
        if task.realization_action == RealizationAction::Merge && task.merge_strategy.is_none() {
            errors.push(format!(
                "task '{}' has merge action but no merge_strategy",
                task.task_id
            ));
        }
    }

    if let Some(on_cycle) = find_dependency_cycle(plan) {
        errors.push(format!(
            "circular dependency detected involving task '{on_cycle}'"
        ));
    }

    errors
}

/// Coverage: every inventory file must appear in exactly one file task's
/// `source_files` list.
pub fn validate_coverage(plan: &Plan, inventory: &Inventory) -> Vec<String> {
    let mut errors = Vec::new();
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();

    for task in &plan.file_tasks {
        for source in &task.source_files {
            *counts.entry(source.as_str()).or_insert(0) += 1;
        }
    }

    for file in &inventory.files {
        match counts.get(file.path.as_str()).copied().unwrap_or(0) {
            0 => errors.push(format!(
                "source file '{}' is not covered by any file task",
                file.path
            )),
            1 => {}
            n => errors.push(format!(
                "source file '{}' is covered by {} file tasks",
                file.path, n
            )),
        }
    }

    errors
}

/// Depth-first cycle search over `depends_on` edges. Returns a task id on
/// the first cycle found, or `None` when the graph is acyclic.
fn find_dependency_cycle(plan: &Plan) -> Option<String> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    let edges: BTreeMap<&str, &[String]> = plan
        .tasks()
        .map(|task| (task.task_id.as_str(), task.depends_on.as_slice()))
        .collect();

    fn visit<'a>(
        id: &'a str,
        edges: &BTreeMap<&'a str, &'a [String]>,
        marks: &mut BTreeMap<&'a str, Mark>,
    ) -> Option<String> {
        match marks.get(id) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => return Some(id.to_string()),
            None => {}
        }
        marks.insert(id, Mark::Visiting);
        if let Some(deps) = edges.get(id) {
            for dep in deps.iter() {
                // Unknown deps are reported separately; skip them here.
                if edges.contains_key(dep.as_str())
                    && let Some(found) = visit(dep.as_str(), edges, marks)
                {
                    return Some(found);
                }
            }
        }
        marks.insert(id, Mark::Done);
        None
    }

    let mut marks = BTreeMap::new();
    for id in edges.keys().copied() {
        if let Some(found) = visit(id, &edges, &mut marks) {
            return Some(found);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::{InventoryFile, Phase};
    use crate::test_support::{plan_with_tasks, task};

    #[test]
    fn acyclic_plan_validates_cleanly() {
        let mut t1 = task("t1", Phase::File);
        let mut t2 = task("t2", Phase::File);
        t2.depends_on = vec!["t1".to_string()];
        t1.depends_on = vec![];

        let plan = plan_with_tasks(vec![], vec![t1, t2], vec![]);
        assert!(validate_plan_invariants(&plan).is_empty());
    }

    #[test]
    fn cycle_reports_circular_dependency_with_task_id() {
        let mut t1 = task("t1", Phase::File);
        let mut t2 = task("t2", Phase::File);
        t1.depends_on = vec!["t2".to_string()];
        t2.depends_on = vec!["t1".to_string()];

        let plan = plan_with_tasks(vec![], vec![t1, t2], vec![]);
        let errors = validate_plan_invariants(&plan);
        let cycle_error = errors
            .iter()
            .find(|err| err.contains("circular dependency"))
            .expect("cycle error");
        assert!(cycle_error.contains("t1") || cycle_error.contains("t2"));
    }

    #[test]
    fn duplicate_ids_and_unknown_deps_are_reported() {
        let t1 = task("dup", Phase::Scaffold);
        let mut t2 = task("dup", Phase::File);
        t2.depends_on = vec!["missing".to_string()];

        let plan = plan_with_tasks(vec![t1], vec![t2], vec![]);
        let errors = validate_plan_invariants(&plan);
        assert!(errors.iter().any(|err| err.contains("duplicate task id")));
        assert!(errors.iter().any(|err| err.contains("unknown task")));
    }

    #[test]
    fn prompt_ref_must_be_under_inputs() {
        let mut t1 = task("t1", Phase::File);
        t1.prompt_ref = Some("elsewhere/prompt.txt".to_string());

        let plan = plan_with_tasks(vec![], vec![t1], vec![]);
        let errors = validate_plan_invariants(&plan);
        assert!(errors.iter().any(|err| err.contains("not under inputs/")));
    }

    #[test]
    fn coverage_requires_each_source_exactly_once() {
        let mut t1 = task("t1", Phase::File);
        t1.source_files = vec!["a.py".to_string(), "b.py".to_string()];
        let mut t2 = task("t2", Phase::File);
        t2.source_files = vec!["b.py".to_string()];

        let plan = plan_with_tasks(vec![], vec![t1, t2], vec![]);
        let inventory = Inventory {
            files: vec![
                inventory_file("a.py"),
                inventory_file("b.py"),
                inventory_file("c.py"),
            ],
            total_count: 3,
        };

        let errors = validate_coverage(&plan, &inventory);
        assert!(errors.iter().any(|err| err.contains("'b.py'")));
        assert!(errors.iter().any(|err| err.contains("'c.py'")));
        assert!(!errors.iter().any(|err| err.contains("'a.py'")));
    }

    fn inventory_file(path: &str) -> InventoryFile {
        InventoryFile {
            path: path.to_string(),
            language: "python".to_string(),
            size: 1,
            hash: String::new(),
            roles: vec![],
        }
    }
}
