//! Orchestrator loop (C6, spec.md 4.6).
//!
//! Grounded in the teacher's `orchestrator::core::orchestrator` main tick and its
//! `orchestrator::monitor` completion-handling; adapted from the teacher's
//! task-queue model to this crate's discover-then-launch cycle. Runs on a dedicated
//! OS thread when driven from `main`; worker completion is delivered back here
//! through an `mpsc` channel rather than by polling, per spec.md 5.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::Utc;

use crate::clock::Clock;
use crate::discovery::discover;
use crate::exitgate::ExitGateRunner;
use crate::frontmatter::FrontmatterStore;
use crate::lockmgr::LockManager;
use crate::logger::{Logger, SessionLogger};
use crate::model::ids::{Status, COMPLETE};
use crate::model::{Stage, WorkerInfo};
use crate::pipeline::{is_soft_satisfying, PipelineModel};
use crate::session::{SessionExecutor, SpawnOptions, SpawnResult};
use crate::store::Sync as SyncCollaborator;
use crate::worktree::WorktreeManager;

enum SessionExit {
    Completed(SpawnResult),
    Error(String),
}

pub struct OrchestratorLoop<F: FrontmatterStore + 'static> {
    pipeline: Arc<PipelineModel>,
    frontmatter: Arc<F>,
    lock_manager: Arc<dyn LockManager>,
    worktree_manager: Arc<dyn WorktreeManager>,
    session_executor: Arc<SessionExecutor>,
    logger: Arc<dyn Logger>,
    clock: Arc<dyn Clock>,
    sync: Option<Arc<dyn SyncCollaborator>>,
    max_parallel: usize,
    worker_model: Option<String>,
    work_dir: PathBuf,
    repo_path: PathBuf,
    repo_id: String,
    log_dir: PathBuf,
    crash_dir: PathBuf,
    running: AtomicBool,
    workers: Mutex<HashMap<i64, WorkerInfo>>,
    exit_tx: mpsc::Sender<(i64, SessionExit)>,
    exit_rx: Mutex<mpsc::Receiver<(i64, SessionExit)>>,
}

impl<F: FrontmatterStore + 'static> OrchestratorLoop<F> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline: Arc<PipelineModel>,
        frontmatter: Arc<F>,
        lock_manager: Arc<dyn LockManager>,
        worktree_manager: Arc<dyn WorktreeManager>,
        session_executor: Arc<SessionExecutor>,
        logger: Arc<dyn Logger>,
        clock: Arc<dyn Clock>,
        sync: Option<Arc<dyn SyncCollaborator>>,
        max_parallel: usize,
        worker_model: Option<String>,
        work_dir: PathBuf,
        repo_path: PathBuf,
        repo_id: String,
    ) -> Self {
        let (exit_tx, exit_rx) = mpsc::channel();
        Self {
            log_dir: work_dir.join("logs"),
            crash_dir: work_dir.join("crashes"),
            pipeline,
            frontmatter,
            lock_manager,
            worktree_manager,
            session_executor,
            logger,
            clock,
            sync,
            max_parallel,
            worker_model,
            work_dir,
            repo_path,
            repo_id,
            running: AtomicBool::new(false),
            workers: Mutex::new(HashMap::new()),
            exit_tx,
            exit_rx: Mutex::new(exit_rx),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn get_active_workers(&self) -> Vec<WorkerInfo> {
        self.workers.lock().unwrap().values().cloned().collect()
    }

    fn stages_dir(&self) -> PathBuf {
        self.work_dir.join("stages")
    }

    /// `start()` throws (here: returns an error) when already running, matching
    /// spec.md 4.6's re-entrancy rule.
    pub fn run(&self, once: bool) -> anyhow::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            anyhow::bail!("orchestrator loop already running");
        }

        loop {
            if !self.is_running() {
                break;
            }

            let active = self.workers.lock().unwrap().len();
            let slots = self.max_parallel.saturating_sub(active);

            if slots == 0 {
                if !once {
                    self.await_one_exit();
                    continue;
                }
            } else {
                let launched = self.discover_and_launch(slots);
                if once && launched == 0 && self.workers.lock().unwrap().is_empty() {
                    break;
                }
            }

            if once {
                if self.workers.lock().unwrap().is_empty() {
                    break;
                }
                self.await_one_exit();
            }
        }

        while once && !self.workers.lock().unwrap().is_empty() {
            self.await_one_exit();
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Runs the discovery filter/sort without launching anything (`gantry
    /// discover`). Read-only: no lock is acquired on any returned stage.
    pub fn discover_report(&self, limit: usize) -> crate::discovery::DiscoveryResult {
        let candidates = self.list_candidate_stages();
        discover(
            candidates,
            &self.pipeline,
            |stage| self.dependency_satisfied(stage),
            |stage| self.lock_manager.is_locked(&stage.file_path).unwrap_or(true),
            limit,
        )
    }

    fn discover_and_launch(&self, slots: usize) -> usize {
        let candidates = self.list_candidate_stages();
        let result = discover(
            candidates,
            &self.pipeline,
            |stage| self.dependency_satisfied(stage),
            |stage| self.lock_manager.is_locked(&stage.file_path).unwrap_or(true),
            slots,
        );

        let mut launched = 0;
        for stage in result.ready_stages {
            if self.launch(stage) {
                launched += 1;
            }
        }
        launched
    }

    fn list_candidate_stages(&self) -> Vec<Stage> {
        let dir = self.stages_dir();
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut stages = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            if let Ok(doc) = self.frontmatter.read(&path) {
                if let Ok(mut stage) = serde_yaml::from_value::<Stage>(doc.data) {
                    stage.file_path = path;
                    stages.push(stage);
                }
            }
        }
        stages
    }

    /// A dependency (at any level) is satisfied for scheduling if the target is
    /// `Complete` (hard) or soft-resolved (spec.md 4.10).
    fn dependency_satisfied(&self, stage: &Stage) -> bool {
        stage.depends_on.iter().all(|id| {
            self.resolve_status_by_id(id)
                .map(|status| status.as_str() == COMPLETE || is_soft_satisfying(&status))
                .unwrap_or(false)
        })
    }

    fn resolve_status_by_id(&self, id: &str) -> Option<Status> {
        let subdir = if id.starts_with("EPIC-") {
            "epics"
        } else if id.starts_with("TICKET-") {
            "tickets"
        } else {
            "stages"
        };
        let path = self.work_dir.join(subdir).join(format!("{id}.md"));
        let doc = self.frontmatter.read(&path).ok()?;
        doc.data.get("status")?.as_str().map(Status::from)
    }

    /// Steps 1-9 of the tick algorithm (spec.md 4.6).
    fn launch(&self, stage: Stage) -> bool {
        if self.lock_manager.acquire_lock(&stage.file_path).is_err() {
            return false;
        }

        let status = match self.lock_manager.read_status(&stage.file_path) {
            Ok(s) => Status::from(s),
            Err(_) => {
                let _ = self.lock_manager.release_lock(&stage.file_path);
                return false;
            }
        };

        let Some(skill_name) = self.pipeline.skill_for(&status).map(str::to_string) else {
            let _ = self.lock_manager.release_lock(&stage.file_path);
            return false;
        };

        if self.worktree_manager.validate_isolation_strategy(&self.repo_path).is_err() {
            let _ = self.lock_manager.release_lock(&stage.file_path);
            return false;
        }

        let index = match self.worktree_manager.acquire_index() {
            Ok(i) => i,
            Err(_) => {
                let _ = self.lock_manager.release_lock(&stage.file_path);
                return false;
            }
        };

        let branch = stage
            .worktree_branch
            .clone()
            .unwrap_or_else(|| format!("gantry/{}", stage.id));

        let worktree = match self.worktree_manager.create(index, &branch, &self.repo_path) {
            Ok(w) => w,
            Err(e) => {
                // A failed `create` already released the acquired index itself
                // (spec.md 4.3) — nothing further to tear down here.
                self.logger.warn(&format!("worktree create failed for {}: {e:#}", stage.id));
                let _ = self.lock_manager.release_lock(&stage.file_path);
                return false;
            }
        };

        let logger = match SessionLogger::create(stage.id.as_str(), &self.log_dir) {
            Ok(l) => l,
            Err(e) => {
                self.logger.warn(&format!("session logger create failed for {}: {e:#}", stage.id));
                self.worktree_manager.remove(&worktree.path, index);
                let _ = self.lock_manager.release_lock(&stage.file_path);
                return false;
            }
        };

        let worker_info = WorkerInfo {
            stage_id: stage.id.clone(),
            stage_file_path: stage.file_path.clone(),
            worktree_path: worktree.path.clone(),
            worktree_index: index as i64,
            status_before: status,
            start_time: std::time::Instant::now(),
        };
        self.workers.lock().unwrap().insert(index as i64, worker_info);

        let options = SpawnOptions {
            stage_id: stage.id.to_string(),
            stage_file_path: stage.file_path.clone(),
            skill_name,
            worktree_path: worktree.path,
            worktree_index: index as i64,
            model: self.worker_model.clone(),
            workflow_env: HashMap::new(),
        };

        let executor = self.session_executor.clone();
        let tx = self.exit_tx.clone();
        let idx = index as i64;
        thread::spawn(move || {
            let outcome = match executor.spawn(options, logger, None) {
                Ok(result) => SessionExit::Completed(result),
                Err(e) => SessionExit::Error(e.to_string()),
            };
            let _ = tx.send((idx, outcome));
        });

        true
    }

    fn await_one_exit(&self) {
        let received = {
            let rx = self.exit_rx.lock().unwrap();
            rx.recv()
        };
        if let Ok((index, outcome)) = received {
            self.handle_session_exit(index, outcome);
        }
    }

    /// spec.md 4.6: unconditionally release the lock, remove the worktree, and
    /// remove the worker entry regardless of how the session ended.
    fn handle_session_exit(&self, index: i64, outcome: SessionExit) {
        let Some(info) = self.workers.lock().unwrap().remove(&index) else {
            return;
        };

        let status_after = self
            .frontmatter
            .read(&info.stage_file_path)
            .ok()
            .and_then(|doc| doc.data.get("status").and_then(|v| v.as_str()).map(Status::from));

        self.lock_manager.release_lock(&info.stage_file_path).ok();
        self.worktree_manager.remove(&info.worktree_path, index as usize);

        match outcome {
            SessionExit::Completed(result) => {
                let Some(status_after) = status_after else {
                    self.logger
                        .warn(&format!("session exit: could not re-read status for {}", info.stage_id));
                    return;
                };

                if status_after == info.status_before && result.exit_code != 0 {
                    self.logger.error(&format!("Session crashed: {}", info.stage_id));
                    self.write_crash_report(&info, result.exit_code);
                } else if status_after == info.status_before {
                    self.logger
                        .info(&format!("Session completed without status change: {}", info.stage_id));
                } else {
                    let gate = ExitGateRunner {
                        frontmatter: self.frontmatter.as_ref(),
                        sync: self.sync.as_deref(),
                        logger: self.logger.as_ref(),
                        work_dir: &self.work_dir,
                    };
                    gate.run(&info, &self.repo_id, &status_after);
                    self.logger.info(&format!(
                        "Session completed: {} {} -> {} ({}ms)",
                        info.stage_id, info.status_before, status_after, result.duration_ms
                    ));
                }
            }
            SessionExit::Error(e) => {
                self.logger.error(&format!("Session error for {}: {e}", info.stage_id));
            }
        }
    }

    fn write_crash_report(&self, info: &WorkerInfo, exit_code: i32) {
        let log_path = self.log_dir.join(format!("{}.log", info.stage_id));
        let tail = std::fs::read_to_string(&log_path)
            .map(|s| s.chars().rev().take(4000).collect::<String>().chars().rev().collect::<String>())
            .unwrap_or_default();

        let report = format!(
            "# Crash report\n\n- timestamp: {}\n- stage: {}\n- exit_code: {exit_code}\n\n## Session log tail\n\n```\n{tail}\n```\n",
            Utc::now().to_rfc3339(),
            info.stage_id,
        );

        if std::fs::create_dir_all(&self.crash_dir).is_ok() {
            let path = self
                .crash_dir
                .join(format!("{}-{}.md", Utc::now().timestamp(), info.stage_id));
            if let Err(e) = std::fs::write(&path, report) {
                self.logger.warn(&format!("failed to write crash report: {e}"));
            }
        }
    }
}
