//! Named advisory lock per repository root.
//!
//! Prevents two concurrent pipeline runs from corrupting the same
//! repository. The lock is a create-exclusive file holding the run id and
//! pid; it is released unconditionally on drop.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

const LOCK_FILE_NAME: &str = ".porter.lock";

/// Held advisory lock on one repository root.
#[derive(Debug)]
pub struct RepoLock {
    path: PathBuf,
}

impl RepoLock {
    /// Acquire the lock, failing when another run holds it.
    pub fn acquire(repo_root: &Path, run_id: &str) -> Result<Self> {
        fs::create_dir_all(repo_root)
            .with_context(|| format!("create repository root {}", repo_root.display()))?;
        let path = repo_root.join(LOCK_FILE_NAME);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path).unwrap_or_default();
                return Err(anyhow!(
                    "repository {} is locked by another run ({})",
                    repo_root.display(),
                    holder.trim()
                ));
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("create lock file {}", path.display()));
            }
        };
        writeln!(file, "{run_id} pid={}", std::process::id())
            .with_context(|| format!("write lock file {}", path.display()))?;
        debug!(path = %path.display(), "repository lock acquired");
        Ok(Self { path })
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), err = %err, "failed to release repository lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_held() {
        let temp = tempfile::tempdir().expect("tempdir");
        let _held = RepoLock::acquire(temp.path(), "run-1").expect("first");

        let err = RepoLock::acquire(temp.path(), "run-2").expect_err("second should fail");
        assert!(err.to_string().contains("locked by another run"));
        assert!(err.to_string().contains("run-1"));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempfile::tempdir().expect("tempdir");
        {
            let _held = RepoLock::acquire(temp.path(), "run-1").expect("first");
        }
        RepoLock::acquire(temp.path(), "run-2").expect("reacquire after drop");
    }
}
