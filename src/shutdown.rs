//! Shutdown coordinator (spec.md 7).
//!
//! SIGINT/SIGTERM drain the orchestrator: stop accepting new work, wait for active
//! workers to finish on their own, then escalate to SIGTERM and finally SIGKILL.
//! Grounded in the teacher's `orchestrator::signals` module, which wires `ctrlc`
//! the same way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::lockmgr::LockManager;
use crate::logger::Logger;
use crate::model::WorkerInfo;
use crate::process::is_process_alive;
use crate::session::SessionExecutor;
use crate::worktree::WorktreeManager;

pub struct ShutdownConfig {
    pub drain_timeout: Duration,
    pub graceful_kill_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(30),
            graceful_kill_timeout: Duration::from_secs(10),
        }
    }
}

pub struct ShutdownCoordinator {
    running: Arc<AtomicBool>,
    session_executor: Arc<SessionExecutor>,
    lock_manager: Arc<dyn LockManager>,
    worktree_manager: Arc<dyn WorktreeManager>,
    logger: Arc<dyn Logger>,
    config: ShutdownConfig,
    in_progress: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new(
        running: Arc<AtomicBool>,
        session_executor: Arc<SessionExecutor>,
        lock_manager: Arc<dyn LockManager>,
        worktree_manager: Arc<dyn WorktreeManager>,
        logger: Arc<dyn Logger>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            running,
            session_executor,
            lock_manager,
            worktree_manager,
            logger,
            config,
            in_progress: AtomicBool::new(false),
        }
    }

    /// Installs SIGINT/SIGTERM handlers that call `shutdown`. `get_workers` is
    /// polled while draining to observe the orchestrator's live worker map.
    pub fn install(self: &Arc<Self>, get_workers: impl Fn() -> Vec<WorkerInfo> + Send + 'static) -> anyhow::Result<()> {
        let coordinator = self.clone();
        ctrlc::set_handler(move || {
            coordinator.shutdown(&get_workers);
            std::process::exit(0);
        })?;
        Ok(())
    }

    /// A second signal during shutdown is a no-op (spec.md 7's re-entrancy guard).
    pub fn shutdown(&self, get_workers: &impl Fn() -> Vec<WorkerInfo>) {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            return;
        }

        self.logger.info("shutdown: draining active workers");
        self.running.store(false, Ordering::SeqCst);

        let deadline = Instant::now() + self.config.drain_timeout;
        while Instant::now() < deadline && !get_workers().is_empty() {
            std::thread::sleep(Duration::from_millis(100));
        }

        if !get_workers().is_empty() {
            self.logger.warn("shutdown: drain timed out, escalating to SIGTERM");
            self.session_executor.kill_all(libc::SIGTERM);

            let kill_deadline = Instant::now() + self.config.graceful_kill_timeout;
            while Instant::now() < kill_deadline
                && get_workers()
                    .iter()
                    .any(|w| pid_still_active(&self.session_executor, w))
            {
                std::thread::sleep(Duration::from_millis(100));
            }

            if get_workers()
                .iter()
                .any(|w| pid_still_active(&self.session_executor, w))
            {
                self.logger.warn("shutdown: SIGTERM timed out, escalating to SIGKILL");
                self.session_executor.kill_all(libc::SIGKILL);
            }
        }

        for worker in get_workers() {
            if let Err(e) = self.lock_manager.release_lock(&worker.stage_file_path) {
                self.logger
                    .warn(&format!("shutdown: failed to release lock for {}: {e}", worker.stage_id));
            }
            self.worktree_manager
                .remove(&worker.worktree_path, worker.worktree_index.max(0) as usize);
        }

        self.worktree_manager.release_all();
        self.logger.info("shutdown: complete");
    }
}

fn pid_still_active(executor: &SessionExecutor, worker: &WorkerInfo) -> bool {
    executor
        .get_active_sessions()
        .iter()
        .any(|s| s.worktree_index == worker.worktree_index && is_process_alive(s.pid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::frontmatter::MarkdownFrontmatter;
    use crate::lockmgr::FileLockManager;
    use crate::logger::TracingLogger;
    use crate::worktree::GitWorktreePool;

    #[test]
    fn second_shutdown_call_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let running = Arc::new(AtomicBool::new(true));
        let clock = Arc::new(SystemClock::new());
        let coordinator = ShutdownCoordinator::new(
            running.clone(),
            Arc::new(SessionExecutor::new("definitely-not-a-real-binary".into(), clock)),
            Arc::new(FileLockManager::new(
                MarkdownFrontmatter,
                Duration::from_secs(300),
                Box::new(TracingLogger),
                Box::new(SystemClock::new()),
            )),
            Arc::new(GitWorktreePool::new(1, dir.path().to_path_buf())),
            Arc::new(TracingLogger),
            ShutdownConfig {
                drain_timeout: Duration::from_millis(10),
                graceful_kill_timeout: Duration::from_millis(10),
            },
        );

        coordinator.shutdown(&Vec::new);
        assert!(!running.load(Ordering::SeqCst));
        // Running flag stays false; a second call returns immediately rather than
        // re-running the drain sequence.
        coordinator.shutdown(&Vec::new);
    }
}
