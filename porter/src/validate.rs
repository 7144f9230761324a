//! Validation of the persisted plan against schema, invariants, and
//! (when an inventory is available) source coverage.

use std::path::Path;

use anyhow::Result;

use crate::core::invariants::validate_coverage;
use crate::io::paths::PorterPaths;
use crate::io::plan_store::load_plan;
use crate::planner::load_inventory;

/// Validate the pipeline state under `target_root`. Returns the list of
/// violations; an empty list means the plan is valid.
///
/// Schema and structural-invariant failures surface as errors from the
/// plan store; coverage problems are returned as violations.
pub fn validate_pipeline(target_root: &Path, inventory_path: Option<&Path>) -> Result<Vec<String>> {
    let paths = PorterPaths::new(target_root);
    let plan = load_plan(&paths.plan_path)?;

    let mut violations = Vec::new();
    if let Some(inventory_path) = inventory_path {
        let inventory = load_inventory(inventory_path)?;
        violations.extend(validate_coverage(&plan, &inventory));
    }
    Ok(violations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::{Inventory, InventoryFile, Phase};
    use crate::io::audit::write_json;
    use crate::io::plan_store::write_plan;
    use crate::test_support::{plan_with_tasks, task};

    #[test]
    fn valid_plan_without_inventory_passes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = PorterPaths::new(temp.path());
        write_plan(&paths.plan_path, &plan_with_tasks(vec![], vec![], vec![])).expect("plan");

        let violations = validate_pipeline(temp.path(), None).expect("validate");
        assert!(violations.is_empty());
    }

    #[test]
    fn coverage_gaps_are_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = PorterPaths::new(temp.path());
        let mut covered = task("t-001", Phase::File);
        covered.source_files = vec!["a.py".to_string()];
        write_plan(&paths.plan_path, &plan_with_tasks(vec![], vec![covered], vec![]))
            .expect("plan");

        let inventory = Inventory {
            files: vec![
                InventoryFile {
                    path: "a.py".to_string(),
                    language: "python".to_string(),
                    size: 1,
                    hash: String::new(),
                    roles: vec![],
                },
                InventoryFile {
                    path: "b.py".to_string(),
                    language: "python".to_string(),
                    size: 1,
                    hash: String::new(),
                    roles: vec![],
                },
            ],
            total_count: 2,
        };
        let inventory_path = temp.path().join("inventory.json");
        write_json(&inventory_path, &inventory).expect("inventory");

        let violations =
            validate_pipeline(temp.path(), Some(&inventory_path)).expect("validate");
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("b.py"));
    }

    #[test]
    fn missing_plan_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(validate_pipeline(temp.path(), None).is_err());
    }
}
