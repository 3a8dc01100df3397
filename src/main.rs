//! `gantry` binary: a thin `clap` entry point over the orchestration core.
//!
//! CLI argument parsing is a named non-goal collaborator — this module loads
//! config, wires the concrete collaborators, and dispatches to the library; it
//! carries no orchestration logic of its own.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use gantry::chain::ChainManager;
use gantry::clock::{Clock, SystemClock};
use gantry::config::load_pipeline;
use gantry::exitgate::ExitGateRunner;
use gantry::frontmatter::MarkdownFrontmatter;
use gantry::lockmgr::{FileLockManager, LockManager};
use gantry::logger::TracingLogger;
use gantry::orchestrator::OrchestratorLoop;
use gantry::poller::PrCommentPoller;
use gantry::resolver::ResolverRunner;
use gantry::session::SessionExecutor;
use gantry::shutdown::{ShutdownConfig, ShutdownCoordinator};
use gantry::store::{file::FileStore, CodeHostAdapter, ResolverContext, ResolverRegistry, Store};
use gantry::worktree::{GitWorktreePool, WorktreeManager};

#[derive(Parser)]
#[command(name = "gantry", about = "Work-orchestration daemon")]
struct Cli {
    /// Directory holding stages/, tickets/, epics/, tracking/, and workflow.yaml.
    #[arg(long, global = true, default_value = "work")]
    work_dir: PathBuf,

    /// Git repository the orchestrator checks worktrees out of.
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    /// Logical repo identifier used by sync and the reconciliation loops.
    #[arg(long, global = true, default_value = "default")]
    repo_id: String,

    /// Maximum concurrent worker subprocesses.
    #[arg(long, global = true, default_value_t = 4)]
    max_parallel: usize,

    /// Path to the worker subprocess binary.
    #[arg(long, global = true, default_value = "gantry-worker")]
    worker_bin: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the orchestrator loop until shutdown (or once, with `--once`).
    Run {
        #[arg(long)]
        once: bool,
    },
    /// Report which stages are ready to launch, without launching them.
    Discover {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Run the resolver runner once over all stage files.
    Resolve,
    /// Run the PR comment poller once.
    Poll,
    /// Run the MR chain manager once.
    Chain,
}

/// No external PR host is wired into this binary; `resolve`/`poll`/`chain`
/// still run their file-local logic (e.g. the `testing-router` resolver) and
/// log a warning for anything that needs a code host.
struct NoCodeHost;

impl ResolverContext for NoCodeHost {
    fn code_host(&self) -> Option<&dyn CodeHostAdapter> {
        None
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let pipeline = Arc::new(load_pipeline(&cli.work_dir.join("workflow.yaml")).context("loading workflow.yaml")?);
    let frontmatter = Arc::new(MarkdownFrontmatter);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let logger = Arc::new(TracingLogger);
    let lock_manager: Arc<dyn LockManager> = Arc::new(FileLockManager::new(
        MarkdownFrontmatter,
        Duration::from_secs(300),
        Box::new(TracingLogger),
        Box::new(SystemClock::new()),
    ));
    let worktree_manager: Arc<dyn WorktreeManager> =
        Arc::new(GitWorktreePool::new(cli.max_parallel, cli.work_dir.join(".worktrees")));
    let session_executor = Arc::new(SessionExecutor::new(cli.worker_bin.clone(), clock.clone()));
    let store: Arc<dyn Store> = Arc::new(FileStore::new(cli.work_dir.clone(), MarkdownFrontmatter));

    match cli.command {
        Command::Run { once } => {
            let orchestrator = Arc::new(OrchestratorLoop::new(
                pipeline,
                frontmatter,
                lock_manager.clone(),
                worktree_manager.clone(),
                session_executor.clone(),
                logger.clone(),
                clock,
                None,
                cli.max_parallel,
                None,
                cli.work_dir.clone(),
                cli.repo.clone(),
                cli.repo_id.clone(),
            ));

            if !once {
                let running = Arc::new(AtomicBool::new(true));
                let coordinator = Arc::new(ShutdownCoordinator::new(
                    running,
                    session_executor,
                    lock_manager,
                    worktree_manager,
                    logger,
                    ShutdownConfig::default(),
                ));
                let orchestrator_for_signal = orchestrator.clone();
                coordinator.install(move || orchestrator_for_signal.get_active_workers())?;
            }

            orchestrator.run(once)
        }
        Command::Discover { limit } => {
            let orchestrator = OrchestratorLoop::new(
                pipeline,
                frontmatter,
                lock_manager,
                worktree_manager,
                session_executor,
                logger,
                clock,
                None,
                cli.max_parallel,
                None,
                cli.work_dir.clone(),
                cli.repo.clone(),
                cli.repo_id.clone(),
            );
            let result = orchestrator.discover_report(limit);
            for stage in &result.ready_stages {
                println!("ready: {}", stage.id);
            }
            println!(
                "blocked={} in_progress={} to_convert={}",
                result.blocked_count, result.in_progress_count, result.to_convert_count
            );
            Ok(())
        }
        Command::Resolve => {
            let registry = ResolverRegistry::with_builtins();
            let runner = ResolverRunner {
                frontmatter: frontmatter.as_ref(),
                pipeline: &pipeline,
                registry: &registry,
                logger: logger.as_ref(),
            };
            let gate = ExitGateRunner {
                frontmatter: frontmatter.as_ref(),
                sync: None,
                logger: logger.as_ref(),
                work_dir: &cli.work_dir,
            };
            let results = runner.check_all(&cli.work_dir.join("stages"), &NoCodeHost, &gate, &cli.repo_id);
            for result in &results {
                println!(
                    "{}: {} -> {:?} (propagated={})",
                    result.stage_id, result.previous_status, result.new_status, result.propagated
                );
            }
            Ok(())
        }
        Command::Poll => {
            let gate = ExitGateRunner {
                frontmatter: frontmatter.as_ref(),
                sync: None,
                logger: logger.as_ref(),
                work_dir: &cli.work_dir,
            };
            let poller = PrCommentPoller {
                store: store.as_ref(),
                frontmatter: frontmatter.as_ref(),
                code_host: None,
                logger: logger.as_ref(),
                exit_gate: &gate,
                max_stages_per_cycle: 50,
            };
            let results = poller.poll(&cli.repo_id);
            for result in &results {
                println!("{}: {:?}", result.stage_id, result.action);
            }
            Ok(())
        }
        Command::Chain => {
            let chain_manager = ChainManager {
                store,
                frontmatter,
                code_host: None,
                lock_manager,
                session_executor,
                sync: None,
                logger,
                work_dir: cli.work_dir.clone(),
                log_dir: cli.work_dir.join("logs"),
                default_branch: "main".to_string(),
            };
            let results = chain_manager.check_parent_chains(&cli.repo_id)?;
            for result in &results {
                println!("{} <- {}: {:?}", result.child_stage_id, result.parent_stage_id, result.event);
            }
            Ok(())
        }
    }
}
