//! Exit-gate runner (C7, spec.md 4.7).
//!
//! Propagates a stage's status change up to its ticket and epic, then triggers a
//! resync. Never returns an error: every failure becomes a field on
//! `ExitGateResult`, matching the teacher's `merge_handler` convention of reporting
//! outcomes on a result struct rather than raising through the caller.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::frontmatter::FrontmatterStore;
use crate::logger::Logger;
use crate::model::ids::{Status, COMPLETE};
use crate::model::worker_info::WorkerInfo;
use crate::pipeline::derived_status;
use crate::store::{Sync, SyncOutcome};

#[derive(Debug, Clone)]
pub struct ExitGateResult {
    pub status_changed: bool,
    pub status_before: Status,
    pub status_after: Status,
    pub ticket_updated: bool,
    pub ticket_completed: bool,
    pub epic_updated: bool,
    pub epic_completed: bool,
    pub sync_result: Option<SyncOutcome>,
}

impl ExitGateResult {
    fn unchanged(status: Status) -> Self {
        Self {
            status_changed: false,
            status_before: status.clone(),
            status_after: status,
            ticket_updated: false,
            ticket_completed: false,
            epic_updated: false,
            epic_completed: false,
            sync_result: None,
        }
    }
}

pub struct ExitGateRunner<'a, F: FrontmatterStore> {
    pub frontmatter: &'a F,
    pub sync: Option<&'a dyn Sync>,
    pub logger: &'a dyn Logger,
    pub work_dir: &'a Path,
}

impl<'a, F: FrontmatterStore> ExitGateRunner<'a, F> {
    pub fn run(&self, worker_info: &WorkerInfo, repo: &str, status_after: &Status) -> ExitGateResult {
        if status_after == &worker_info.status_before {
            return ExitGateResult::unchanged(worker_info.status_before.clone());
        }

        let mut result = ExitGateResult {
            status_changed: true,
            status_before: worker_info.status_before.clone(),
            status_after: status_after.clone(),
            ticket_updated: false,
            ticket_completed: false,
            epic_updated: false,
            epic_completed: false,
            sync_result: None,
        };

        let stage_doc = match self.frontmatter.read(&worker_info.stage_file_path) {
            Ok(doc) => Some(doc),
            Err(e) => {
                self.logger.error(&format!(
                    "exit gate: failed to read stage {}: {e:#}",
                    worker_info.stage_file_path.display()
                ));
                None
            }
        };

        if let Some(doc) = stage_doc {
            let ticket_id = doc.data.get("ticket").and_then(|v| v.as_str()).map(String::from);
            if let Some(ticket_id) = ticket_id {
                if let Some((new_ticket_status, epic_id)) =
                    self.propagate_to_ticket(&ticket_id, &worker_info.stage_id.to_string(), status_after, &mut result)
                {
                    if let Some(epic_id) = epic_id {
                        self.propagate_to_epic(&epic_id, &ticket_id, &new_ticket_status, &mut result);
                    }
                }
            } else {
                self.logger
                    .warn(&format!("exit gate: stage {} has no ticket", worker_info.stage_id));
            }
        }

        result.sync_result = self.run_sync_with_retry(repo);
        result
    }

    fn ticket_path(&self, ticket_id: &str) -> PathBuf {
        self.work_dir.join("tickets").join(format!("{ticket_id}.md"))
    }

    fn epic_path(&self, epic_id: &str) -> PathBuf {
        self.work_dir.join("epics").join(format!("{epic_id}.md"))
    }

    /// Updates the ticket's `stage_statuses` map and recomputes its derived status.
    /// Returns `(new_ticket_status, epic_id)` when the ticket changed, so the
    /// caller can propagate further, regardless of whether the epic id was found.
    fn propagate_to_ticket(
        &self,
        ticket_id: &str,
        stage_id: &str,
        status_after: &Status,
        result: &mut ExitGateResult,
    ) -> Option<(Status, Option<String>)> {
        let path = self.ticket_path(ticket_id);
        let doc = match self.frontmatter.read(&path) {
            Ok(doc) => doc,
            Err(e) => {
                self.logger
                    .warn(&format!("exit gate: ticket {ticket_id} not found: {e:#}"));
                return None;
            }
        };

        let mut data = doc.data;
        let epic_id = data.get("epic").and_then(|v| v.as_str()).map(String::from);

        let map = data.as_mapping_mut()?;
        let stage_statuses_key = serde_yaml::Value::from("stage_statuses");
        let mut stage_statuses: HashMap<String, String> = map
            .get(&stage_statuses_key)
            .and_then(|v| serde_yaml::from_value(v.clone()).ok())
            .unwrap_or_default();
        stage_statuses.insert(stage_id.to_string(), status_after.as_str().to_string());

        let statuses: Vec<Status> = stage_statuses.values().map(|s| Status::from(s.clone())).collect();
        let new_status = derived_status(statuses.iter())?;

        map.insert(
            stage_statuses_key,
            serde_yaml::to_value(&stage_statuses).ok()?,
        );
        map.insert("status".into(), new_status.as_str().into());

        if let Err(e) = self.frontmatter.write(&path, data, &doc.content) {
            self.logger
                .warn(&format!("exit gate: failed to write ticket {ticket_id}: {e:#}"));
            return None;
        }

        result.ticket_updated = true;
        result.ticket_completed = new_status.as_str() == COMPLETE;
        Some((new_status, epic_id))
    }

    fn propagate_to_epic(&self, epic_id: &str, ticket_id: &str, new_ticket_status: &Status, result: &mut ExitGateResult) {
        let path = self.epic_path(epic_id);
        let doc = match self.frontmatter.read(&path) {
            Ok(doc) => doc,
            Err(e) => {
                self.logger.warn(&format!("exit gate: epic {epic_id} not found: {e:#}"));
                return;
            }
        };

        let mut data = doc.data;
        let Some(map) = data.as_mapping_mut() else {
            return;
        };
        let ticket_statuses_key = serde_yaml::Value::from("ticket_statuses");
        let mut ticket_statuses: HashMap<String, String> = map
            .get(&ticket_statuses_key)
            .and_then(|v| serde_yaml::from_value(v.clone()).ok())
            .unwrap_or_default();
        ticket_statuses.insert(ticket_id.to_string(), new_ticket_status.as_str().to_string());

        let statuses: Vec<Status> = ticket_statuses.values().map(|s| Status::from(s.clone())).collect();
        let Some(new_epic_status) = derived_status(statuses.iter()) else {
            return;
        };

        let Some(serialized) = serde_yaml::to_value(&ticket_statuses).ok() else {
            return;
        };
        map.insert(ticket_statuses_key, serialized);
        map.insert("status".into(), new_epic_status.as_str().into());

        if let Err(e) = self.frontmatter.write(&path, data, &doc.content) {
            self.logger
                .warn(&format!("exit gate: failed to write epic {epic_id}: {e:#}"));
            return;
        }

        result.epic_updated = true;
        result.epic_completed = new_epic_status.as_str() == COMPLETE;
    }

    fn run_sync_with_retry(&self, repo: &str) -> Option<SyncOutcome> {
        let sync = self.sync?;
        match sync.run_sync(repo) {
            Ok(outcome) if outcome.success => Some(outcome),
            Ok(outcome) => {
                self.logger
                    .warn(&format!("exit gate: sync failed ({:?}), retrying once", outcome.error));
                Some(self.retry_sync(sync, repo))
            }
            Err(e) => {
                self.logger.warn(&format!("exit gate: sync failed: {e:#}, retrying once"));
                Some(self.retry_sync(sync, repo))
            }
        }
    }

    fn retry_sync(&self, sync: &dyn Sync, repo: &str) -> SyncOutcome {
        match sync.run_sync(repo) {
            Ok(outcome) => {
                if !outcome.success {
                    self.logger
                        .warn(&format!("exit gate: sync retry also failed ({:?})", outcome.error));
                }
                outcome
            }
            Err(e) => {
                self.logger.warn(&format!("exit gate: sync retry also failed: {e:#}"));
                SyncOutcome {
                    success: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontmatter::MarkdownFrontmatter;
    use crate::logger::TracingLogger;
    use crate::model::ids::{EpicId, StageId, TicketId};
    use anyhow::Result;
    use std::cell::Cell;
    use std::sync::Mutex;

    struct CountingSync {
        calls: Mutex<Cell<u32>>,
        fail_first_n: u32,
    }

    impl Sync for CountingSync {
        fn run_sync(&self, _repo: &str) -> Result<SyncOutcome> {
            let guard = self.calls.lock().unwrap();
            let n = guard.get();
            guard.set(n + 1);
            if n < self.fail_first_n {
                Ok(SyncOutcome {
                    success: false,
                    error: Some("transient".into()),
                })
            } else {
                Ok(SyncOutcome {
                    success: true,
                    error: None,
                })
            }
        }
    }

    fn worker_info(dir: &Path, status_before: &str) -> WorkerInfo {
        WorkerInfo {
            stage_id: StageId::from("STAGE-1"),
            stage_file_path: dir.join("stages/STAGE-1.md"),
            worktree_path: dir.join("wt0"),
            worktree_index: 0,
            status_before: Status::from(status_before),
            start_time: std::time::Instant::now(),
        }
    }

    fn setup(dir: &Path) {
        std::fs::create_dir_all(dir.join("stages")).unwrap();
        std::fs::create_dir_all(dir.join("tickets")).unwrap();
        std::fs::create_dir_all(dir.join("epics")).unwrap();
        std::fs::write(
            dir.join("stages/STAGE-1.md"),
            "---\nid: STAGE-1\nticket: TICKET-1\nepic: EPIC-1\nstatus: Design\n---\n",
        )
        .unwrap();
        std::fs::write(
            dir.join("tickets/TICKET-1.md"),
            "---\nid: TICKET-1\nepic: EPIC-1\nstatus: Not Started\nstage_statuses: {}\n---\n",
        )
        .unwrap();
        std::fs::write(
            dir.join("epics/EPIC-1.md"),
            "---\nid: EPIC-1\nstatus: Not Started\nticket_statuses: {}\n---\n",
        )
        .unwrap();
    }

    #[test]
    fn no_change_returns_unchanged_without_touching_anything() {
        let dir = tempfile::tempdir().unwrap();
        setup(dir.path());
        let frontmatter = MarkdownFrontmatter;
        let logger = TracingLogger;
        let runner = ExitGateRunner {
            frontmatter: &frontmatter,
            sync: None,
            logger: &logger,
            work_dir: dir.path(),
        };
        let wi = worker_info(dir.path(), "Design");
        let result = runner.run(&wi, "repo", &Status::from("Design"));
        assert!(!result.status_changed);
    }

    #[test]
    fn status_change_propagates_to_ticket_and_epic() {
        let dir = tempfile::tempdir().unwrap();
        setup(dir.path());
        let frontmatter = MarkdownFrontmatter;
        let logger = TracingLogger;
        let sync = CountingSync {
            calls: Mutex::new(Cell::new(0)),
            fail_first_n: 0,
        };
        let runner = ExitGateRunner {
            frontmatter: &frontmatter,
            sync: Some(&sync),
            logger: &logger,
            work_dir: dir.path(),
        };
        let wi = worker_info(dir.path(), "Design");
        let result = runner.run(&wi, "repo", &Status::from("Complete"));

        assert!(result.status_changed);
        assert!(result.ticket_updated);
        assert!(result.ticket_completed);
        assert!(result.epic_updated);
        assert!(result.epic_completed);
        assert!(result.sync_result.unwrap().success);

        let ticket = frontmatter.read(&dir.path().join("tickets/TICKET-1.md")).unwrap();
        assert_eq!(ticket.data["status"].as_str(), Some("Complete"));
    }

    #[test]
    fn sync_retries_once_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        setup(dir.path());
        let frontmatter = MarkdownFrontmatter;
        let logger = TracingLogger;
        let sync = CountingSync {
            calls: Mutex::new(Cell::new(0)),
            fail_first_n: 1,
        };
        let runner = ExitGateRunner {
            frontmatter: &frontmatter,
            sync: Some(&sync),
            logger: &logger,
            work_dir: dir.path(),
        };
        let wi = worker_info(dir.path(), "Design");
        let result = runner.run(&wi, "repo", &Status::from("Build"));
        assert!(result.sync_result.unwrap().success);
        assert_eq!(sync.calls.lock().unwrap().get(), 2);
    }

    #[test]
    fn missing_ticket_file_is_a_warning_not_an_abort() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("stages")).unwrap();
        std::fs::write(
            dir.path().join("stages/STAGE-1.md"),
            "---\nid: STAGE-1\nticket: TICKET-MISSING\nepic: EPIC-1\nstatus: Design\n---\n",
        )
        .unwrap();
        let frontmatter = MarkdownFrontmatter;
        let logger = TracingLogger;
        let runner = ExitGateRunner {
            frontmatter: &frontmatter,
            sync: None,
            logger: &logger,
            work_dir: dir.path(),
        };
        let wi = worker_info(dir.path(), "Design");
        let result = runner.run(&wi, "repo", &Status::from("Build"));
        assert!(result.status_changed);
        assert!(!result.ticket_updated);
    }

    #[allow(dead_code)]
    fn epic_id_marker() -> EpicId {
        EpicId::from("EPIC-1")
    }
    #[allow(dead_code)]
    fn ticket_id_marker() -> TicketId {
        TicketId::from("TICKET-1")
    }
}
