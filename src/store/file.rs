//! Minimal file-backed `Store` (spec.md 6's "database-like" collaborator).
//!
//! A linear scan over `<work_dir>/stages/*.md` frontmatter plus small JSON files
//! under `<work_dir>/tracking/` for the auxiliary tables. Spec.md treats the
//! database as outside the core's concern, so this favors a working default over a
//! scalable one — grounded in the teacher's `fs::locking` (advisory file locks) and
//! its convention of one markdown file per record.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::frontmatter::FrontmatterStore;
use crate::model::{CommentTrackingRow, ParentBranchTrackingRow, Stage};

use super::{Store, TrackingRowPatch};

pub struct FileStore<F: FrontmatterStore> {
    work_dir: PathBuf,
    frontmatter: F,
}

impl<F: FrontmatterStore> FileStore<F> {
    pub fn new(work_dir: PathBuf, frontmatter: F) -> Self {
        Self {
            work_dir,
            frontmatter,
        }
    }

    fn stages_dir(&self) -> PathBuf {
        self.work_dir.join("stages")
    }

    fn tracking_dir(&self) -> PathBuf {
        self.work_dir.join("tracking")
    }

    fn comment_tracking_path(&self, stage_id: &str) -> PathBuf {
        self.tracking_dir().join(format!("comment-{stage_id}.json"))
    }

    fn parent_tracking_path(&self, child_id: &str, parent_id: &str) -> PathBuf {
        self.tracking_dir()
            .join(format!("parent-{child_id}-{parent_id}.json"))
    }

    fn load_stage_file(&self, path: &Path) -> Result<Stage> {
        let doc = self.frontmatter.read(path)?;
        let mut stage: Stage = serde_yaml::from_value(doc.data)
            .with_context(|| format!("parsing stage frontmatter at {}", path.display()))?;
        stage.file_path = path.to_path_buf();
        Ok(stage)
    }

    fn all_stages(&self) -> Result<Vec<Stage>> {
        let dir = self.stages_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut stages = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("md") {
                stages.push(self.load_stage_file(&path)?);
            }
        }
        Ok(stages)
    }
}

impl<F: FrontmatterStore> Store for FileStore<F> {
    fn query_stages_in_pr_created(&self, _repo: &str, limit: usize) -> Result<Vec<Stage>> {
        let mut stages: Vec<Stage> = self
            .all_stages()?
            .into_iter()
            .filter(|s| s.status.as_str() == "PR Created")
            .collect();
        stages.truncate(limit);
        Ok(stages)
    }

    fn get_comment_tracking(&self, stage_id: &str) -> Result<Option<CommentTrackingRow>> {
        let path = self.comment_tracking_path(stage_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    fn upsert_comment_tracking(&self, row: CommentTrackingRow) -> Result<()> {
        std::fs::create_dir_all(self.tracking_dir())?;
        let path = self.comment_tracking_path(row.stage_id.as_str());
        std::fs::write(path, serde_json::to_string_pretty(&row)?)?;
        Ok(())
    }

    fn get_active_tracking_rows(&self, _repo: &str) -> Result<Vec<ParentBranchTrackingRow>> {
        let dir = self.tracking_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut rows = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let is_parent_row = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("parent-"));
            if is_parent_row {
                let raw = std::fs::read_to_string(&path)?;
                let row: ParentBranchTrackingRow = serde_json::from_str(&raw)?;
                if !row.is_merged {
                    rows.push(row);
                }
            }
        }
        Ok(rows)
    }

    fn update_tracking_row(&self, id: (&str, &str), patch: TrackingRowPatch) -> Result<()> {
        let path = self.parent_tracking_path(id.0, id.1);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("tracking row {path:?} not found"))?;
        let mut row: ParentBranchTrackingRow = serde_json::from_str(&raw)?;
        if let Some(head) = patch.last_known_head {
            row.last_known_head = Some(head);
        }
        if let Some(merged) = patch.is_merged {
            row.is_merged = merged;
        }
        if let Some(checked) = patch.last_checked {
            row.last_checked = checked;
        }
        std::fs::write(path, serde_json::to_string_pretty(&row)?)?;
        Ok(())
    }

    fn get_tracking_rows_for_child(&self, child_id: &str) -> Result<Vec<ParentBranchTrackingRow>> {
        let dir = self.tracking_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut rows = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&format!("parent-{child_id}-")))
            {
                let raw = std::fs::read_to_string(&path)?;
                rows.push(serde_json::from_str(&raw)?);
            }
        }
        Ok(rows)
    }
}
