//! PR comment poller (C9, spec.md 4.9).

use crate::exitgate::ExitGateRunner;
use crate::frontmatter::FrontmatterStore;
use crate::logger::Logger;
use crate::model::ids::Status;
use crate::model::{CommentTrackingRow, Stage, WorkerInfo};
use crate::store::{CodeHostAdapter, Store, TrackingRowPatch};
use chrono::Utc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollAction {
    Merged,
    FirstPoll,
    NewComments,
    NoChange,
    Error,
}

#[derive(Debug, Clone)]
pub struct MRPollResult {
    pub stage_id: String,
    pub pr_url: Option<String>,
    pub action: PollAction,
    pub previous_unresolved_count: Option<u64>,
    pub new_unresolved_count: Option<u64>,
}

pub struct PrCommentPoller<'a, F: FrontmatterStore> {
    pub store: &'a dyn Store,
    pub frontmatter: &'a F,
    pub code_host: Option<&'a dyn CodeHostAdapter>,
    pub logger: &'a dyn Logger,
    pub exit_gate: &'a ExitGateRunner<'a, F>,
    pub max_stages_per_cycle: usize,
}

impl<'a, F: FrontmatterStore> PrCommentPoller<'a, F> {
    pub fn poll(&self, repo: &str) -> Vec<MRPollResult> {
        let Some(code_host) = self.code_host else {
            self.logger.warn("PR comment poller: no code-host adapter configured, skipping cycle");
            return Vec::new();
        };

        let stages = match self.store.query_stages_in_pr_created(repo, self.max_stages_per_cycle) {
            Ok(s) => s,
            Err(e) => {
                self.logger.error(&format!("PR comment poller: failed to query stages: {e:#}"));
                return Vec::new();
            }
        };

        stages
            .into_iter()
            .filter_map(|stage| self.poll_one(&stage, code_host, repo))
            .collect()
    }

    fn poll_one(&self, stage: &Stage, code_host: &dyn CodeHostAdapter, repo: &str) -> Option<MRPollResult> {
        let Some(pr_url) = stage.pr_url.clone() else {
            self.logger.warn(&format!("PR comment poller: stage {} has no pr_url", stage.id));
            return None;
        };

        let pr_status = match code_host.get_pr_status(&pr_url) {
            Ok(s) => s,
            Err(e) => {
                self.logger.error(&format!("PR comment poller: fetch failed for {pr_url}: {e:#}"));
                return Some(MRPollResult {
                    stage_id: stage.id.to_string(),
                    pr_url: Some(pr_url),
                    action: PollAction::Error,
                    previous_unresolved_count: None,
                    new_unresolved_count: None,
                });
            }
        };

        let tracking = self.store.get_comment_tracking(stage.id.as_str()).ok().flatten();

        if pr_status.merged {
            let write_result = self.write_status(stage, "Done");
            let _ = self.store.upsert_comment_tracking(CommentTrackingRow {
                stage_id: stage.id.clone(),
                last_poll_timestamp: Utc::now(),
                last_known_unresolved_count: pr_status.unresolved_thread_count,
                repo_id: repo.to_string(),
            });
            return match write_result {
                Ok(()) => {
                    self.invoke_exit_gate_ignoring_failure(stage, "Done", repo);
                    Some(MRPollResult {
                        stage_id: stage.id.to_string(),
                        pr_url: Some(pr_url),
                        action: PollAction::Merged,
                        previous_unresolved_count: tracking.map(|t| t.last_known_unresolved_count),
                        new_unresolved_count: Some(pr_status.unresolved_thread_count),
                    })
                }
                Err(_) => Some(MRPollResult {
                    stage_id: stage.id.to_string(),
                    pr_url: Some(pr_url),
                    action: PollAction::Error,
                    previous_unresolved_count: None,
                    new_unresolved_count: None,
                }),
            };
        }

        match tracking {
            None => {
                let _ = self.store.upsert_comment_tracking(CommentTrackingRow {
                    stage_id: stage.id.clone(),
                    last_poll_timestamp: Utc::now(),
                    last_known_unresolved_count: pr_status.unresolved_thread_count,
                    repo_id: repo.to_string(),
                });
                Some(MRPollResult {
                    stage_id: stage.id.to_string(),
                    pr_url: Some(pr_url),
                    action: PollAction::FirstPoll,
                    previous_unresolved_count: None,
                    new_unresolved_count: Some(pr_status.unresolved_thread_count),
                })
            }
            Some(row) if pr_status.unresolved_thread_count > row.last_known_unresolved_count => {
                let write_result = self.write_status(stage, "Addressing Comments");
                let _ = self.store.upsert_comment_tracking(CommentTrackingRow {
                    stage_id: stage.id.clone(),
                    last_poll_timestamp: Utc::now(),
                    last_known_unresolved_count: pr_status.unresolved_thread_count,
                    repo_id: repo.to_string(),
                });
                match write_result {
                    Ok(()) => {
                        self.invoke_exit_gate_ignoring_failure(stage, "Addressing Comments", repo);
                        Some(MRPollResult {
                            stage_id: stage.id.to_string(),
                            pr_url: Some(pr_url),
                            action: PollAction::NewComments,
                            previous_unresolved_count: Some(row.last_known_unresolved_count),
                            new_unresolved_count: Some(pr_status.unresolved_thread_count),
                        })
                    }
                    Err(_) => Some(MRPollResult {
                        stage_id: stage.id.to_string(),
                        pr_url: Some(pr_url),
                        action: PollAction::Error,
                        previous_unresolved_count: None,
                        new_unresolved_count: None,
                    }),
                }
            }
            Some(row) => {
                let _ = self.store.upsert_comment_tracking(CommentTrackingRow {
                    stage_id: stage.id.clone(),
                    last_poll_timestamp: Utc::now(),
                    last_known_unresolved_count: row.last_known_unresolved_count,
                    repo_id: repo.to_string(),
                });
                Some(MRPollResult {
                    stage_id: stage.id.to_string(),
                    pr_url: Some(pr_url),
                    action: PollAction::NoChange,
                    previous_unresolved_count: Some(row.last_known_unresolved_count),
                    new_unresolved_count: Some(row.last_known_unresolved_count),
                })
            }
        }
    }

    fn write_status(&self, stage: &Stage, status: &str) -> anyhow::Result<()> {
        let doc = self.frontmatter.read(&stage.file_path)?;
        let mut data = doc.data;
        if let Some(map) = data.as_mapping_mut() {
            map.insert("status".into(), status.into());
        }
        self.frontmatter.write(&stage.file_path, data, &doc.content)
    }

    fn invoke_exit_gate_ignoring_failure(&self, stage: &Stage, new_status: &str, repo: &str) {
        let worker_info = WorkerInfo {
            stage_id: stage.id.clone(),
            stage_file_path: stage.file_path.clone(),
            worktree_path: Default::default(),
            worktree_index: -1,
            status_before: stage.status.clone(),
            start_time: std::time::Instant::now(),
        };
        // Exit-gate failures are logged internally and never propagated (spec.md 4.9).
        self.exit_gate.run(&worker_info, repo, &Status::from(new_status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontmatter::MarkdownFrontmatter;
    use crate::logger::TracingLogger;
    use crate::model::{ParentBranchTrackingRow, Stage};
    use crate::store::PrStatus;
    use anyhow::Result;
    use std::sync::Mutex;

    struct FakeStore {
        tracking: Mutex<Option<CommentTrackingRow>>,
    }

    impl Store for FakeStore {
        fn query_stages_in_pr_created(&self, _repo: &str, _limit: usize) -> Result<Vec<Stage>> {
            Ok(Vec::new())
        }
        fn get_comment_tracking(&self, _stage_id: &str) -> Result<Option<CommentTrackingRow>> {
            Ok(self.tracking.lock().unwrap().clone())
        }
        fn upsert_comment_tracking(&self, row: CommentTrackingRow) -> Result<()> {
            *self.tracking.lock().unwrap() = Some(row);
            Ok(())
        }
        fn get_active_tracking_rows(&self, _repo: &str) -> Result<Vec<ParentBranchTrackingRow>> {
            Ok(Vec::new())
        }
        fn update_tracking_row(&self, _id: (&str, &str), _patch: TrackingRowPatch) -> Result<()> {
            Ok(())
        }
        fn get_tracking_rows_for_child(&self, _child_id: &str) -> Result<Vec<ParentBranchTrackingRow>> {
            Ok(Vec::new())
        }
    }

    struct FakeHost {
        merged: bool,
        unresolved: u64,
    }

    impl CodeHostAdapter for FakeHost {
        fn get_pr_status(&self, _pr_url: &str) -> Result<PrStatus> {
            Ok(PrStatus {
                merged: self.merged,
                unresolved_thread_count: self.unresolved,
                ..Default::default()
            })
        }
        fn get_branch_head(&self, _branch: &str) -> Result<String> {
            Ok(String::new())
        }
        fn edit_pr_base(&self, _pr_number: u64, _target_branch: &str) -> Result<()> {
            Ok(())
        }
        fn mark_pr_ready(&self, _pr_number: u64) -> Result<()> {
            Ok(())
        }
    }

    fn stage(dir: &std::path::Path) -> Stage {
        let path = dir.join("s.md");
        std::fs::write(
            &path,
            "---\nid: STAGE-1\nticket: TICKET-1\nepic: EPIC-1\nstatus: PR Created\npr_url: /pull/1\n---\n",
        )
        .unwrap();
        Stage {
            id: "STAGE-1".into(),
            ticket_id: "TICKET-1".into(),
            epic_id: "EPIC-1".into(),
            title: "t".into(),
            status: Status::from("PR Created"),
            worktree_branch: None,
            pr_url: Some("/pull/1".into()),
            pr_number: Some(1),
            session_active: false,
            locked_at: None,
            locked_by: None,
            priority: 0,
            due_date: None,
            depends_on: vec![],
            pending_merge_parents: vec![],
            is_draft: false,
            rebase_conflict: false,
            refinement_type: vec![],
            file_path: path,
        }
    }

    #[test]
    fn first_poll_creates_tracking_row_without_transition() {
        let dir = tempfile::tempdir().unwrap();
        let frontmatter = MarkdownFrontmatter;
        let logger = TracingLogger;
        let store = FakeStore { tracking: Mutex::new(None) };
        let gate = ExitGateRunner {
            frontmatter: &frontmatter,
            sync: None,
            logger: &logger,
            work_dir: dir.path(),
        };
        let host = FakeHost { merged: false, unresolved: 2 };
        let poller = PrCommentPoller {
            store: &store,
            frontmatter: &frontmatter,
            code_host: Some(&host),
            logger: &logger,
            exit_gate: &gate,
            max_stages_per_cycle: 10,
        };
        let s = stage(dir.path());
        let result = poller.poll_one(&s, &host, "acme/repo").unwrap();
        assert_eq!(result.action, PollAction::FirstPoll);
    }

    #[test]
    fn no_code_host_adapter_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let frontmatter = MarkdownFrontmatter;
        let logger = TracingLogger;
        let store = FakeStore { tracking: Mutex::new(None) };
        let gate = ExitGateRunner {
            frontmatter: &frontmatter,
            sync: None,
            logger: &logger,
            work_dir: dir.path(),
        };
        let poller = PrCommentPoller {
            store: &store,
            frontmatter: &frontmatter,
            code_host: None,
            logger: &logger,
            exit_gate: &gate,
            max_stages_per_cycle: 10,
        };
        assert!(poller.poll("repo").is_empty());
    }
}
