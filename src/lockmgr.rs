//! Lock manager (C2, spec.md 4.2).
//!
//! Exclusive per-stage acquisition with stale-lock recovery. Grounded in the
//! teacher's `fs::locking` (advisory `fs2` locks around frontmatter-shaped files)
//! and `process::is_process_alive` for the liveness half of the stale-lock policy.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::clock::Clock;
use crate::frontmatter::FrontmatterStore;
use crate::logger::Logger;
use crate::process::is_process_alive;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("stage {0} is already locked")]
    LockHeld(PathBuf),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Minimal shape the lock manager needs from a stage's frontmatter; kept separate
/// from `model::Stage` so the lock manager can be exercised without the rest of the
/// data model pulled in.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct LockFields {
    #[serde(default)]
    pub session_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<u32>,
    #[serde(default)]
    pub status: String,
}

pub trait LockManager: Send + Sync {
    fn acquire_lock(&self, stage_file: &Path) -> Result<(), LockError>;
    fn release_lock(&self, stage_file: &Path) -> Result<(), LockError>;
    fn is_locked(&self, stage_file: &Path) -> Result<bool, LockError>;
    fn read_status(&self, stage_file: &Path) -> Result<String, LockError>;
}

pub struct FileLockManager<F: FrontmatterStore> {
    store: F,
    stale_after: Duration,
    logger: Box<dyn Logger>,
    clock: Box<dyn Clock>,
    pid: u32,
}

impl<F: FrontmatterStore> FileLockManager<F> {
    pub fn new(
        store: F,
        stale_after: Duration,
        logger: Box<dyn Logger>,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self {
            store,
            stale_after,
            logger,
            clock,
            pid: std::process::id(),
        }
    }

    fn read_fields(&self, stage_file: &Path) -> Result<LockFields, LockError> {
        let doc = self
            .store
            .read(stage_file)
            .context("reading lock frontmatter")?;
        serde_yaml::from_value(doc.data)
            .map_err(|e| LockError::Io(anyhow::anyhow!("malformed lock frontmatter: {e}")))
    }
}

impl<F: FrontmatterStore> LockManager for FileLockManager<F> {
    fn acquire_lock(&self, stage_file: &Path) -> Result<(), LockError> {
        let mut fields = self.read_fields(stage_file)?;

        if fields.session_active {
            let stale = fields
                .locked_at
                .map(|at| Utc::now().signed_duration_since(at).to_std().unwrap_or_default() > self.stale_after)
                .unwrap_or(false);
            let owner_dead = fields
                .locked_by
                .map(|pid| !is_process_alive(pid))
                .unwrap_or(true);

            if stale && owner_dead {
                self.logger.warn(&format!(
                    "clearing stale lock on {} (owner pid {:?} dead)",
                    stage_file.display(),
                    fields.locked_by
                ));
                fields.session_active = false;
                fields.locked_at = None;
                fields.locked_by = None;
            } else {
                return Err(LockError::LockHeld(stage_file.to_path_buf()));
            }
        }

        fields.session_active = true;
        fields.locked_at = Some(Utc::now());
        fields.locked_by = Some(self.pid);
        let _ = self.clock.now_ms();

        let doc = self
            .store
            .read(stage_file)
            .context("re-reading frontmatter before lock write")?;
        let mut data = doc.data;
        merge_lock_fields(&mut data, &fields)?;
        self.store
            .write(stage_file, data, &doc.content)
            .context("writing acquired lock")?;
        Ok(())
    }

    fn release_lock(&self, stage_file: &Path) -> Result<(), LockError> {
        let doc = self
            .store
            .read(stage_file)
            .context("reading frontmatter before lock release")?;
        let mut data = doc.data;
        let cleared = LockFields {
            session_active: false,
            locked_at: None,
            locked_by: None,
            status: String::new(),
        };
        merge_lock_fields(&mut data, &cleared)?;
        self.store
            .write(stage_file, data, &doc.content)
            .context("writing released lock")?;
        Ok(())
    }

    fn is_locked(&self, stage_file: &Path) -> Result<bool, LockError> {
        Ok(self.read_fields(stage_file)?.session_active)
    }

    fn read_status(&self, stage_file: &Path) -> Result<String, LockError> {
        Ok(self.read_fields(stage_file)?.status)
    }
}

/// Merges only the lock-related keys into an existing frontmatter document,
/// leaving every other field (status, dependencies, etc.) untouched.
fn merge_lock_fields(doc: &mut serde_yaml::Value, fields: &LockFields) -> Result<(), LockError> {
    let map = doc
        .as_mapping_mut()
        .ok_or_else(|| LockError::Io(anyhow::anyhow!("frontmatter root is not a mapping")))?;
    map.insert("session_active".into(), fields.session_active.into());
    map.insert(
        "locked_at".into(),
        match fields.locked_at {
            Some(at) => at.to_rfc3339().into(),
            None => serde_yaml::Value::Null,
        },
    );
    map.insert(
        "locked_by".into(),
        match fields.locked_by {
            Some(pid) => pid.into(),
            None => serde_yaml::Value::Null,
        },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::frontmatter::MarkdownFrontmatter;
    use crate::logger::TracingLogger;

    fn write_stage(dir: &Path, name: &str, yaml: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("---\n{yaml}\n---\nbody\n")).unwrap();
        path
    }

    fn manager() -> FileLockManager<MarkdownFrontmatter> {
        FileLockManager::new(
            MarkdownFrontmatter,
            Duration::from_secs(300),
            Box::new(TracingLogger),
            Box::new(SystemClock::new()),
        )
    }

    #[test]
    fn acquire_then_release_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_stage(dir.path(), "s.md", "status: Design\nsession_active: false");
        let mgr = manager();

        mgr.acquire_lock(&path).unwrap();
        assert!(mgr.is_locked(&path).unwrap());
        mgr.release_lock(&path).unwrap();
        assert!(!mgr.is_locked(&path).unwrap());
    }

    #[test]
    fn second_acquire_fails_while_held_by_live_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_stage(dir.path(), "s.md", "status: Design\nsession_active: false");
        let mgr = manager();

        mgr.acquire_lock(&path).unwrap();
        let err = mgr.acquire_lock(&path).unwrap_err();
        assert!(matches!(err, LockError::LockHeld(_)));
    }

    #[test]
    fn stale_lock_from_dead_pid_is_forcibly_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let stale_time = (Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
        let path = write_stage(
            dir.path(),
            "s.md",
            &format!(
                "status: Design\nsession_active: true\nlocked_at: \"{stale_time}\"\nlocked_by: 999999999"
            ),
        );
        let mgr = FileLockManager::new(
            MarkdownFrontmatter,
            Duration::from_secs(60),
            Box::new(TracingLogger),
            Box::new(SystemClock::new()),
        );

        mgr.acquire_lock(&path).unwrap();
        assert!(mgr.is_locked(&path).unwrap());
    }

    #[test]
    fn read_status_reflects_frontmatter() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_stage(dir.path(), "s.md", "status: Build\nsession_active: false");
        let mgr = manager();
        assert_eq!(mgr.read_status(&path).unwrap(), "Build");
    }
}
