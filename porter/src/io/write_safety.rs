//! Path-confined, policy-enforcing, atomic writes into the target tree.
//!
//! Every component that touches the target repository writes through this
//! layer. Confinement and denylist violations are raised immediately and
//! must never be caught and downgraded: they indicate a system-boundary
//! violation, not a recoverable condition.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::core::merge::merge_content;
use crate::core::plan::{MergeMarkers, MergeStrategy, WritePolicy};
use crate::io::hash_store::TargetHashStore;

/// Boundary violation raised by the write layer: path escape, dangerous
/// pattern, or a `fail_if_exists` hit on a foreign file. Callers must let
/// these abort the run, never downgrade them to a task failure.
#[derive(Debug)]
pub struct WriteSafetyViolation(pub String);

impl std::fmt::Display for WriteSafetyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for WriteSafetyViolation {}

fn violation(message: String) -> anyhow::Error {
    WriteSafetyViolation(message).into()
}

/// What the write layer did for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteAction {
    Written,
    Unchanged,
    Skipped,
    MergePending,
}

/// Result of one write request.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WriteReport {
    pub before_hash: Option<String>,
    pub after_hash: Option<String>,
    pub changed: bool,
    pub action: WriteAction,
}

/// SHA-256 hex digest of content.
pub fn content_hash(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// SHA-256 hex digest of a file. `None` when the path is missing or not
/// a regular file.
pub fn file_hash(path: &Path) -> Result<Option<String>> {
    if !path.is_file() {
        return Ok(None);
    }
    let contents = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    Ok(Some(content_hash(&contents)))
}

const DANGEROUS_PATTERNS: [&str; 6] = ["../", "..\\", "/etc/", "/proc/", "/sys/", "/dev/"];

/// Normalize a target-relative path and verify it stays inside the target
/// root. Rejects parent-directory segments; strips leading separators from
/// absolute paths, then re-verifies containment. Fails closed.
pub fn confine_path(target_path: &str, target_root: &Path) -> Result<PathBuf> {
    let trimmed = target_path.trim_start_matches(['/', '\\']);
    let relative = Path::new(trimmed);

    for component in relative.components() {
        match component {
            Component::ParentDir => {
                return Err(violation(format!("unsafe path '{target_path}': parent segment")));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(violation(format!(
                    "unsafe path '{target_path}': absolute component"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    let joined = target_root.join(relative);
    if !joined.starts_with(target_root) {
        return Err(violation(format!(
            "path '{}' escapes target root {}",
            target_path,
            target_root.display()
        )));
    }

    // Defense in depth on top of the component check.
    let rendered = joined.to_string_lossy();
    let suffix = rendered
        .strip_prefix(&*target_root.to_string_lossy())
        .unwrap_or(&rendered);
    for pattern in DANGEROUS_PATTERNS {
        if suffix.contains(pattern) {
            return Err(violation(format!(
                "dangerous path pattern '{pattern}' in '{target_path}'"
            )));
        }
    }

    Ok(joined)
}

/// Write `content` to `target_path` under `target_root`, enforcing the
/// write policy against the ownership ledger.
///
/// - `skip_if_exists`: existing file is left alone (`action=skipped`).
/// - `fail_if_exists`: existing foreign file is a hard error; a
///   system-owned file degrades to overwrite.
/// - `overwrite`: identical content short-circuits with no I/O
///   (`action=unchanged`); otherwise the write is atomic (sibling temp
///   file + rename) and the ledger records the new hash under `task_id`.
/// - `merge`: deferred. An existing file reports `action=merge_pending`
///   and nothing is written; callers apply merge logic and write again.
#[instrument(skip_all, fields(target_path, policy = ?policy))]
pub fn safe_write(
    target_path: &str,
    content: &str,
    target_root: &Path,
    task_id: &str,
    policy: WritePolicy,
    store: &mut TargetHashStore,
) -> Result<WriteReport> {
    let full_path = confine_path(target_path, target_root)?;
    let exists = full_path.exists();
    let before_hash = file_hash(&full_path)?;

    if exists {
        match policy {
            WritePolicy::SkipIfExists => {
                debug!("existing file skipped by policy");
                return Ok(WriteReport {
                    after_hash: before_hash.clone(),
                    before_hash,
                    changed: false,
                    action: WriteAction::Skipped,
                });
            }
            WritePolicy::FailIfExists => {
                // A system-owned file degrades to overwrite below.
                if !store.is_system_owned(target_path) {
                    return Err(violation(format!(
                        "refusing to clobber foreign file '{target_path}' under fail_if_exists"
                    )));
                }
            }
            WritePolicy::Merge => {
                debug!("merge deferred to caller");
                return Ok(WriteReport {
                    after_hash: before_hash.clone(),
                    before_hash,
                    changed: false,
                    action: WriteAction::MergePending,
                });
            }
            WritePolicy::Overwrite => {}
        }
    }

    let new_hash = content_hash(content.as_bytes());
    if before_hash.as_deref() == Some(new_hash.as_str()) {
        debug!("content identical, no write");
        return Ok(WriteReport {
            before_hash: before_hash.clone(),
            after_hash: before_hash,
            changed: false,
            action: WriteAction::Unchanged,
        });
    }

    write_atomic(&full_path, content)?;
    store.record(target_path, task_id, &new_hash);

    Ok(WriteReport {
        before_hash,
        after_hash: Some(new_hash),
        changed: true,
        action: WriteAction::Written,
    })
}

/// Read the existing target (empty if absent), apply the merge strategy,
/// then write the merged content atomically.
pub fn merge_and_write(
    target_path: &str,
    incoming: &str,
    strategy: MergeStrategy,
    markers: Option<&MergeMarkers>,
    target_root: &Path,
    task_id: &str,
    store: &mut TargetHashStore,
) -> Result<WriteReport> {
    let full_path = confine_path(target_path, target_root)?;
    let existing = if full_path.exists() {
        fs::read_to_string(&full_path)
            .with_context(|| format!("read merge target {}", full_path.display()))?
    } else {
        String::new()
    };

    let merged = merge_content(&existing, incoming, strategy, markers)?;
    safe_write(
        target_path,
        &merged,
        target_root,
        task_id,
        WritePolicy::Overwrite,
        store,
    )
}

fn write_atomic(full_path: &Path, content: &str) -> Result<()> {
    let parent = full_path
        .parent()
        .ok_or_else(|| anyhow!("target path {} has no parent", full_path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("create directory {}", parent.display()))?;

    let file_name = full_path
        .file_name()
        .ok_or_else(|| anyhow!("target path {} has no file name", full_path.display()))?;
    let tmp_path = parent.join(format!(".{}.tmp", file_name.to_string_lossy()));
    fs::write(&tmp_path, content)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, full_path)
        .with_context(|| format!("replace {}", full_path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(
        root: &Path,
        store: &mut TargetHashStore,
        path: &str,
        content: &str,
        policy: WritePolicy,
    ) -> Result<WriteReport> {
        safe_write(path, content, root, "t-001", policy, store)
    }

    #[test]
    fn parent_segments_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = TargetHashStore::default();
        let err = write(
            temp.path(),
            &mut store,
            "../outside.txt",
            "x",
            WritePolicy::Overwrite,
        )
        .expect_err("should fail");
        assert!(err.to_string().contains("parent segment"));
    }

    #[test]
    fn violations_carry_typed_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = confine_path("../outside.txt", temp.path()).expect_err("should fail");
        assert!(err.downcast_ref::<WriteSafetyViolation>().is_some());
    }

    #[test]
    fn nested_parent_segments_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = confine_path("src/../../escape.txt", temp.path()).expect_err("should fail");
        assert!(err.to_string().contains("parent segment"));
    }

    #[test]
    fn absolute_paths_are_confined_under_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let confined = confine_path("/src/main.rs", temp.path()).expect("confine");
        assert!(confined.starts_with(temp.path()));
        assert!(confined.ends_with("src/main.rs"));
    }

    /// Writing identical content twice yields changed=false and no
    /// modification the second time.
    #[test]
    fn overwrite_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = TargetHashStore::default();

        let first = write(
            temp.path(),
            &mut store,
            "src/lib.rs",
            "pub fn a() {}",
            WritePolicy::Overwrite,
        )
        .expect("first write");
        assert_eq!(first.action, WriteAction::Written);
        assert!(first.changed);

        let second = write(
            temp.path(),
            &mut store,
            "src/lib.rs",
            "pub fn a() {}",
            WritePolicy::Overwrite,
        )
        .expect("second write");
        assert_eq!(second.action, WriteAction::Unchanged);
        assert!(!second.changed);
        assert_eq!(second.before_hash, first.after_hash);
    }

    #[test]
    fn skip_if_exists_leaves_file_alone() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = TargetHashStore::default();

        write(
            temp.path(),
            &mut store,
            "a.txt",
            "original",
            WritePolicy::Overwrite,
        )
        .expect("seed");
        let report = write(
            temp.path(),
            &mut store,
            "a.txt",
            "replacement",
            WritePolicy::SkipIfExists,
        )
        .expect("skip");

        assert_eq!(report.action, WriteAction::Skipped);
        let contents = fs::read_to_string(temp.path().join("a.txt")).expect("read");
        assert_eq!(contents, "original");
    }

    #[test]
    fn fail_if_exists_refuses_foreign_file_but_overwrites_owned() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = TargetHashStore::default();

        // Pre-existing file not recorded in the ledger: foreign.
        fs::write(temp.path().join("config.json"), "{}").expect("seed foreign");
        let err = write(
            temp.path(),
            &mut store,
            "config.json",
            "{\"new\": true}",
            WritePolicy::FailIfExists,
        )
        .expect_err("should fail");
        assert!(err.to_string().contains("foreign file"));

        // Once system-owned, the same policy degrades to overwrite.
        write(
            temp.path(),
            &mut store,
            "owned.json",
            "{}",
            WritePolicy::Overwrite,
        )
        .expect("seed owned");
        let report = write(
            temp.path(),
            &mut store,
            "owned.json",
            "{\"v\": 2}",
            WritePolicy::FailIfExists,
        )
        .expect("overwrite owned");
        assert_eq!(report.action, WriteAction::Written);
    }

    #[test]
    fn merge_policy_defers_on_existing_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = TargetHashStore::default();

        fs::write(temp.path().join("notes.md"), "existing").expect("seed");
        let report = write(
            temp.path(),
            &mut store,
            "notes.md",
            "incoming",
            WritePolicy::Merge,
        )
        .expect("merge");
        assert_eq!(report.action, WriteAction::MergePending);
        assert_eq!(
            fs::read_to_string(temp.path().join("notes.md")).expect("read"),
            "existing"
        );
    }

    #[test]
    fn merge_and_write_replaces_marker_span_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = TargetHashStore::default();
        fs::write(
            temp.path().join("doc.md"),
            "intro\n<!-- begin -->\nold\n<!-- end -->\noutro\n",
        )
        .expect("seed");

        let markers = MergeMarkers {
            begin: "<!-- begin -->".to_string(),
            end: "<!-- end -->".to_string(),
        };
        let report = merge_and_write(
            "doc.md",
            "new",
            MergeStrategy::ReplaceSectionByMarker,
            Some(&markers),
            temp.path(),
            "t-001",
            &mut store,
        )
        .expect("merge");
        assert_eq!(report.action, WriteAction::Written);

        let merged = fs::read_to_string(temp.path().join("doc.md")).expect("read");
        assert!(merged.starts_with("intro\n"));
        assert!(merged.ends_with("outro\n"));
        assert!(merged.contains("<!-- begin -->\nnew\n<!-- end -->"));
        assert!(!merged.contains("old"));
    }

    #[test]
    fn successful_write_records_ownership() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = TargetHashStore::default();
        write(
            temp.path(),
            &mut store,
            "src/new.rs",
            "fn f() {}",
            WritePolicy::Overwrite,
        )
        .expect("write");
        assert!(store.is_system_owned("src/new.rs"));
    }
}
