//! MR chain manager (C10, spec.md 4.10).
//!
//! Detects parent-stage merges/advances via tracking rows and drives rebase spawn,
//! PR retargeting, and ready-for-review promotion. The rebase session launched here
//! is fire-and-forget exactly like the orchestrator's own launches (spec.md 4.10
//! step 3e): a dedicated thread runs the worker to completion and then performs the
//! same release-lock/exit-gate sequence the orchestrator loop performs for its own
//! workers.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::Result;

use crate::exitgate::ExitGateRunner;
use crate::frontmatter::FrontmatterStore;
use crate::lockmgr::LockManager;
use crate::logger::{Logger, SessionLogger};
use crate::model::ids::Status;
use crate::model::worker_info::WorkerInfo;
use crate::model::ParentBranchTrackingRow;
use crate::session::{SessionExecutor, SpawnOptions};
use crate::store::{CodeHostAdapter, Store, Sync as SyncCollaborator, TrackingRowPatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainEvent {
    NoChange,
    ParentMerged,
    ParentUpdated,
    SkippedLocked,
    SkippedConflict,
    SkippedNoFile,
}

#[derive(Debug, Clone)]
pub struct MRChainResult {
    pub child_stage_id: String,
    pub parent_stage_id: String,
    pub event: ChainEvent,
    pub rebase_spawned: bool,
    pub retargeted: bool,
    pub promoted_to_ready: bool,
}

impl MRChainResult {
    fn new(row: &ParentBranchTrackingRow, event: ChainEvent) -> Self {
        Self {
            child_stage_id: row.child_stage_id.to_string(),
            parent_stage_id: row.parent_stage_id.to_string(),
            event,
            rebase_spawned: false,
            retargeted: false,
            promoted_to_ready: false,
        }
    }
}

pub struct ChainManager<F: FrontmatterStore + 'static> {
    pub store: Arc<dyn Store>,
    pub frontmatter: Arc<F>,
    pub code_host: Option<Arc<dyn CodeHostAdapter>>,
    pub lock_manager: Arc<dyn LockManager>,
    pub session_executor: Arc<SessionExecutor>,
    pub sync: Option<Arc<dyn SyncCollaborator>>,
    pub logger: Arc<dyn Logger>,
    pub work_dir: PathBuf,
    pub log_dir: PathBuf,
    pub default_branch: String,
}

impl<F: FrontmatterStore + 'static> ChainManager<F> {
    pub fn check_parent_chains(&self, repo: &str) -> Result<Vec<MRChainResult>> {
        let Some(code_host) = self.code_host.clone() else {
            self.logger.warn("MR chain manager: no code-host adapter configured, skipping cycle");
            return Ok(Vec::new());
        };

        // Per spec.md 4.10: this query's failure is the one exception that
        // propagates to the caller rather than being caught per-row.
        let rows = self.store.get_active_tracking_rows(repo)?;

        Ok(rows
            .into_iter()
            .map(|row| self.process_row(row, code_host.as_ref(), repo))
            .collect())
    }

    fn process_row(&self, row: ParentBranchTrackingRow, code_host: &dyn CodeHostAdapter, repo: &str) -> MRChainResult {
        let event = self.detect_event(&row, code_host);
        let mut result = MRChainResult::new(&row, event);

        if matches!(event, ChainEvent::ParentMerged | ChainEvent::ParentUpdated) {
            result.event = self.attempt_rebase_spawn(&row, event, &mut result.rebase_spawned, repo);
        }

        if event == ChainEvent::ParentMerged {
            self.retarget_and_promote(&row, code_host, &mut result);
        }

        result
    }

    fn detect_event(&self, row: &ParentBranchTrackingRow, code_host: &dyn CodeHostAdapter) -> ChainEvent {
        if let Some(pr_url) = &row.parent_pr_url {
            match code_host.get_pr_status(pr_url) {
                Ok(status) if status.merged => {
                    let _ = self.store.update_tracking_row(
                        (row.child_stage_id.as_str(), row.parent_stage_id.as_str()),
                        TrackingRowPatch {
                            is_merged: Some(true),
                            last_checked: Some(chrono::Utc::now()),
                            ..Default::default()
                        },
                    );
                    return ChainEvent::ParentMerged;
                }
                Ok(_) => {}
                Err(e) => {
                    self.logger
                        .warn(&format!("chain manager: PR status fetch failed for {pr_url}: {e:#}"));
                    return ChainEvent::NoChange;
                }
            }
        }

        match code_host.get_branch_head(&row.parent_branch) {
            Ok(head) if head.is_empty() => ChainEvent::NoChange,
            Ok(head) => {
                if row.last_known_head.as_deref() != Some(head.as_str()) {
                    let _ = self.store.update_tracking_row(
                        (row.child_stage_id.as_str(), row.parent_stage_id.as_str()),
                        TrackingRowPatch {
                            last_known_head: Some(head),
                            last_checked: Some(chrono::Utc::now()),
                            ..Default::default()
                        },
                    );
                    if row.last_known_head.is_none() {
                        ChainEvent::NoChange
                    } else {
                        ChainEvent::ParentUpdated
                    }
                } else {
                    ChainEvent::NoChange
                }
            }
            Err(e) => {
                self.logger
                    .warn(&format!("chain manager: get_branch_head failed for {}: {e:#}", row.parent_branch));
                ChainEvent::NoChange
            }
        }
    }

    fn child_stage_path(&self, child_id: &str) -> Option<PathBuf> {
        let path = self.work_dir.join("stages").join(format!("{child_id}.md"));
        path.exists().then_some(path)
    }

    fn attempt_rebase_spawn(
        &self,
        row: &ParentBranchTrackingRow,
        detected: ChainEvent,
        spawned: &mut bool,
        repo: &str,
    ) -> ChainEvent {
        let child_id = row.child_stage_id.as_str();

        let Some(child_path) = self.child_stage_path(child_id) else {
            return ChainEvent::SkippedNoFile;
        };

        let rebase_conflict = self
            .frontmatter
            .read(&child_path)
            .ok()
            .and_then(|doc| doc.data.get("rebase_conflict").and_then(|v| v.as_bool()))
            .unwrap_or(false);
        if rebase_conflict {
            return ChainEvent::SkippedConflict;
        }

        if self.lock_manager.is_locked(&child_path).unwrap_or(true) {
            return ChainEvent::SkippedLocked;
        }

        if self.lock_manager.acquire_lock(&child_path).is_err() {
            return ChainEvent::SkippedLocked;
        }

        let status_before = self
            .frontmatter
            .read(&child_path)
            .ok()
            .and_then(|doc| doc.data.get("status").and_then(|v| v.as_str()).map(Status::from))
            .unwrap_or_else(|| Status::from("Unknown"));

        let logger = match SessionLogger::create(child_id, &self.log_dir) {
            Ok(l) => l,
            Err(e) => {
                self.logger.warn(&format!("chain manager: session logger create failed for {child_id}: {e:#}"));
                let _ = self.lock_manager.release_lock(&child_path);
                return detected;
            }
        };

        let worker_info = WorkerInfo {
            stage_id: row.child_stage_id.clone(),
            stage_file_path: child_path.clone(),
            worktree_path: self.work_dir.clone(),
            worktree_index: -1,
            status_before,
            start_time: std::time::Instant::now(),
        };

        let options = SpawnOptions {
            stage_id: child_id.to_string(),
            stage_file_path: child_path.clone(),
            skill_name: "rebase-child-mr".to_string(),
            worktree_path: self.work_dir.clone(),
            worktree_index: -1,
            model: None,
            workflow_env: Default::default(),
        };

        let executor = self.session_executor.clone();
        let lock_manager = self.lock_manager.clone();
        let frontmatter = self.frontmatter.clone();
        let sync = self.sync.clone();
        let logger_collab = self.logger.clone();
        let work_dir = self.work_dir.clone();
        let repo_for_thread = repo.to_string();

        thread::spawn(move || {
            let spawn_result = executor.spawn(options, logger, None);
            let status_after = frontmatter
                .read(&worker_info.stage_file_path)
                .ok()
                .and_then(|doc| doc.data.get("status").and_then(|v| v.as_str()).map(Status::from));

            lock_manager.release_lock(&worker_info.stage_file_path).ok();

            match (spawn_result, status_after) {
                (Ok(_), Some(status_after)) if status_after != worker_info.status_before => {
                    let gate = ExitGateRunner {
                        frontmatter: frontmatter.as_ref(),
                        sync: sync.as_deref(),
                        logger: logger_collab.as_ref(),
                        work_dir: &work_dir,
                    };
                    gate.run(&worker_info, &repo_for_thread, &status_after);
                }
                (Err(e), _) => {
                    logger_collab.error(&format!(
                        "chain manager: rebase session error for {} (repo {repo_for_thread}): {e:#}",
                        worker_info.stage_id
                    ));
                }
                _ => {}
            }
        });

        *spawned = true;
        detected
    }

    fn retarget_and_promote(&self, row: &ParentBranchTrackingRow, code_host: &dyn CodeHostAdapter, result: &mut MRChainResult) {
        let child_id = row.child_stage_id.as_str();
        let remaining: Vec<ParentBranchTrackingRow> = match self.store.get_tracking_rows_for_child(child_id) {
            Ok(rows) => rows.into_iter().filter(|r| !r.is_merged).collect(),
            Err(e) => {
                self.logger
                    .warn(&format!("chain manager: failed to read tracking rows for {child_id}: {e:#}"));
                return;
            }
        };

        let Some(child_path) = self.child_stage_path(child_id) else {
            return;
        };
        let Ok(doc) = self.frontmatter.read(&child_path) else {
            return;
        };
        let Some(child_pr_number) = doc.data.get("pr_number").and_then(|v| v.as_u64()) else {
            return;
        };

        let target_branch = remaining
            .first()
            .map(|r| r.parent_branch.clone())
            .unwrap_or_else(|| self.default_branch.clone());

        match code_host.edit_pr_base(child_pr_number, &target_branch) {
            Ok(()) => result.retargeted = true,
            Err(e) => self
                .logger
                .warn(&format!("chain manager: edit_pr_base failed for {child_id}: {e:#}")),
        }

        let is_draft = doc.data.get("is_draft").and_then(|v| v.as_bool()).unwrap_or(false);
        if remaining.is_empty() && is_draft {
            match code_host.mark_pr_ready(child_pr_number) {
                Ok(()) => {
                    let mut data = doc.data;
                    if let Some(map) = data.as_mapping_mut() {
                        map.insert("is_draft".into(), false.into());
                        map.insert("pending_merge_parents".into(), serde_yaml::Value::Sequence(vec![]));
                    }
                    if self.frontmatter.write(&child_path, data, &doc.content).is_ok() {
                        result.promoted_to_ready = true;
                    }
                }
                Err(e) => self
                    .logger
                    .warn(&format!("chain manager: mark_pr_ready failed for {child_id}: {e:#}")),
            }
        }
    }
}
