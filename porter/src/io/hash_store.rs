//! Target-hash ledger: which files the pipeline produced, and their hashes.
//!
//! This is the sole source of truth for "was this file written by the
//! system". Entries are created or updated only on a successful write and
//! never pruned automatically.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Ownership record for one target-relative path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetHashRecord {
    pub content_hash: String,
    pub owning_task_id: String,
    pub timestamp: String,
}

/// Persisted map from target-relative path to ownership record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetHashStore {
    #[serde(flatten)]
    entries: BTreeMap<String, TargetHashRecord>,
}

impl TargetHashStore {
    pub fn get(&self, target_path: &str) -> Option<&TargetHashRecord> {
        self.entries.get(target_path)
    }

    /// True when the path was previously produced by the pipeline.
    pub fn is_system_owned(&self, target_path: &str) -> bool {
        self.entries.contains_key(target_path)
    }

    pub fn record(&mut self, target_path: &str, owning_task_id: &str, content_hash: &str) {
        self.entries.insert(
            target_path.to_string(),
            TargetHashRecord {
                content_hash: content_hash.to_string(),
                owning_task_id: owning_task_id.to_string(),
                timestamp: Utc::now().to_rfc3339(),
            },
        );
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TargetHashRecord)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Load the ledger. Missing file yields an empty store.
pub fn load_target_hashes(path: &Path) -> Result<TargetHashStore> {
    if !path.exists() {
        return Ok(TargetHashStore::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read target hashes {}", path.display()))?;
    let store: TargetHashStore = serde_json::from_str(&contents)
        .with_context(|| format!("parse target hashes {}", path.display()))?;
    debug!(entries = store.len(), "loaded target hash ledger");
    Ok(store)
}

/// Atomically write the ledger (temp file + rename).
pub fn save_target_hashes(path: &Path, store: &TargetHashStore) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("target hashes path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut buf = serde_json::to_string_pretty(store)?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp target hashes {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace target hashes {}", path.display()))?;
    Ok(())
}
