//! Worktree pool (C3, spec.md 4.3).
//!
//! Fixed array of `maxParallel` slot indices, each backing one isolated `git
//! worktree` checkout. Grounded in the teacher's `git::worktree::operations`
//! (`git worktree add`/`remove` shelled out via `std::process::Command`), adapted
//! from per-stage paths to per-index paths since the pool hands out a bounded set
//! of slots rather than one worktree per stage forever.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("no free worktree slot available")]
    NoSlot,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
    pub index: usize,
}

pub trait WorktreeManager: Send + Sync {
    fn acquire_index(&self) -> Result<usize, WorktreeError>;
    fn create(&self, index: usize, branch: &str, repo: &Path) -> Result<WorktreeInfo, WorktreeError>;
    fn remove(&self, path: &Path, index: usize);
    fn validate_isolation_strategy(&self, repo: &Path) -> Result<(), WorktreeError>;
    fn release_all(&self);
}

/// `git worktree`-backed pool with `max_parallel` deterministic slot paths under
/// `<repo>/.worktrees/slot-<index>`.
pub struct GitWorktreePool {
    max_parallel: usize,
    free: Mutex<Vec<bool>>,
    validated: Mutex<Option<bool>>,
    base_dir: PathBuf,
}

impl GitWorktreePool {
    pub fn new(max_parallel: usize, base_dir: PathBuf) -> Self {
        Self {
            max_parallel,
            free: Mutex::new(vec![true; max_parallel]),
            validated: Mutex::new(None),
            base_dir,
        }
    }

    fn slot_path(&self, index: usize) -> PathBuf {
        self.base_dir.join(format!("slot-{index}"))
    }
}

impl WorktreeManager for GitWorktreePool {
    fn acquire_index(&self) -> Result<usize, WorktreeError> {
        let mut free = self.free.lock().unwrap();
        match free.iter().position(|f| *f) {
            Some(idx) => {
                free[idx] = false;
                Ok(idx)
            }
            None => Err(WorktreeError::NoSlot),
        }
    }

    fn create(&self, index: usize, branch: &str, repo: &Path) -> Result<WorktreeInfo, WorktreeError> {
        let path = self.slot_path(index);
        let result = (|| -> Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            if path.exists() {
                // A previous occupant of this slot didn't clean up; remove it first
                // so `git worktree add` doesn't fail on a non-empty directory.
                let _ = Command::new("git")
                    .args(["worktree", "remove", "--force"])
                    .arg(&path)
                    .current_dir(repo)
                    .output();
                std::fs::remove_dir_all(&path).ok();
            }
            let output = Command::new("git")
                .args(["worktree", "add", "-b", branch])
                .arg(&path)
                .current_dir(repo)
                .output()
                .context("spawning git worktree add")?;
            if !output.status.success() {
                bail!(
                    "git worktree add failed: {}",
                    String::from_utf8_lossy(&output.stderr)
                );
            }
            Ok(())
        })();

        match result {
            Ok(()) => Ok(WorktreeInfo {
                path,
                branch: branch.to_string(),
                index,
            }),
            Err(e) => {
                // A failed create must release the acquired index (spec.md 4.3).
                let mut free = self.free.lock().unwrap();
                free[index] = true;
                Err(WorktreeError::Other(e))
            }
        }
    }

    fn remove(&self, path: &Path, index: usize) {
        // A failed remove must log but not throw (spec.md 4.3).
        match Command::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(path)
            .output()
        {
            Ok(out) if !out.status.success() => tracing::warn!(
                "git worktree remove reported failure for {}: {}",
                path.display(),
                String::from_utf8_lossy(&out.stderr)
            ),
            Err(e) => tracing::warn!("failed to remove worktree {}: {e}", path.display()),
            Ok(_) => {}
        }
        let mut free = self.free.lock().unwrap();
        if index < free.len() {
            free[index] = true;
        }
    }

    fn validate_isolation_strategy(&self, repo: &Path) -> Result<(), WorktreeError> {
        let mut validated = self.validated.lock().unwrap();
        if let Some(ok) = *validated {
            return if ok {
                Ok(())
            } else {
                Err(WorktreeError::Other(anyhow::anyhow!(
                    "worktree isolation strategy previously failed validation"
                )))
            };
        }
        let output = Command::new("git")
            .args(["worktree", "list"])
            .current_dir(repo)
            .output()
            .context("checking git worktree support")?;
        let ok = output.status.success();
        *validated = Some(ok);
        if ok {
            Ok(())
        } else {
            Err(WorktreeError::Other(anyhow::anyhow!(
                "git worktree unsupported in {}",
                repo.display()
            )))
        }
    }

    fn release_all(&self) {
        let mut free = self.free.lock().unwrap();
        for slot in free.iter_mut() {
            *slot = true;
        }
    }
}
