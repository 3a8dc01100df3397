//! Session executor (C4, spec.md 4.4).
//!
//! Spawns the worker subprocess, assembles its stdin prompt, forwards every byte of
//! its stdout/stderr to a logger, and watches a copy of the stdout bytes for a
//! `session_id` field without interrupting that forwarding (spec.md 9). Grounded in
//! the teacher's subprocess-spawning idiom (`std::process::Command` plus a reader
//! thread per stream) and its `process::is_process_alive` for liveness checks.

use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::Result;

use crate::clock::Clock;
use crate::logger::SessionLogger;
use crate::process::is_process_alive;

#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub stage_id: String,
    pub stage_file_path: PathBuf,
    pub skill_name: String,
    pub worktree_path: PathBuf,
    pub worktree_index: i64,
    pub model: Option<String>,
    pub workflow_env: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy)]
pub struct SpawnResult {
    pub exit_code: i32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub pid: u32,
    pub stage_id: String,
    pub worktree_index: i64,
}

/// Builds the deterministic textual prompt piped to the worker's stdin: stage id,
/// file path, worktree path and index, skill name, then `workflow_env` entries
/// sorted alphabetically by key (spec.md 4.4).
pub fn build_prompt(options: &SpawnOptions) -> String {
    let mut lines = vec![
        format!("stage_id: {}", options.stage_id),
        format!("stage_file_path: {}", options.stage_file_path.display()),
        format!("worktree_path: {}", options.worktree_path.display()),
        format!("worktree_index: {}", options.worktree_index),
        format!("skill_name: {}", options.skill_name),
    ];
    if let Some(model) = &options.model {
        lines.push(format!("model: {model}"));
    }
    let sorted: BTreeMap<&String, &String> = options.workflow_env.iter().collect();
    for (k, v) in sorted {
        lines.push(format!("env.{k}: {v}"));
    }
    lines.join("\n")
}

struct LiveChild {
    stage_id: String,
    worktree_index: i64,
}

/// The binary invoked for every worker; fixed here rather than in `SpawnOptions`
/// because every stage in a pipeline shares one worker program (spec.md 4.4 treats
/// it as "an opaque program").
pub struct SessionExecutor {
    worker_bin: String,
    live: Arc<Mutex<HashMap<u32, LiveChild>>>,
    clock: Arc<dyn Clock>,
}

impl SessionExecutor {
    pub fn new(worker_bin: String, clock: Arc<dyn Clock>) -> Self {
        Self {
            worker_bin,
            live: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    /// Spawns the worker, pipes the prompt to stdin, streams stdout/stderr to
    /// `logger` verbatim, and invokes `on_session_id` at most once when a JSON line
    /// on stdout carries a `session_id` field.
    pub fn spawn(
        &self,
        options: SpawnOptions,
        logger: SessionLogger,
        mut on_session_id: Option<Box<dyn FnMut(String) + Send>>,
    ) -> Result<SpawnResult> {
        let start_ms = self.clock.now_ms();
        let prompt = build_prompt(&options);

        let mut command = Command::new(&self.worker_bin);
        command
            .current_dir(&options.worktree_path)
            .env("WORKTREE_INDEX", options.worktree_index.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (k, v) in &options.workflow_env {
            command.env(k, v);
        }

        let mut child = match command.spawn() {
            Ok(c) => c,
            // Cannot be spawned: not registered, stdin not written (spec.md 4.4).
            Err(_) => {
                return Ok(SpawnResult {
                    exit_code: -1,
                    duration_ms: self.clock.now_ms().saturating_sub(start_ms),
                })
            }
        };
        let pid = child.id();

        let stdin_failed = {
            let mut stdin = child.stdin.take();
            match stdin.as_mut().map(|s| s.write_all(prompt.as_bytes())) {
                Some(Ok(())) => {
                    drop(stdin); // closes stdin
                    false
                }
                _ => true,
            }
        };

        if stdin_failed {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(SpawnResult {
                exit_code: -1,
                duration_ms: self.clock.now_ms().saturating_sub(start_ms),
            });
        }

        self.live.lock().unwrap().insert(
            pid,
            LiveChild {
                stage_id: options.stage_id.clone(),
                worktree_index: options.worktree_index,
            },
        );

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let logger = Arc::new(Mutex::new(logger));

        let stdout_logger = logger.clone();
        let stdout_handle = thread::spawn(move || {
            forward_stdout(stdout, stdout_logger, &mut on_session_id);
        });

        let stderr_logger = logger.clone();
        let stderr_handle = thread::spawn(move || {
            forward_raw(stderr, stderr_logger);
        });

        let status = child.wait()?;
        let _ = stdout_handle.join();
        let _ = stderr_handle.join();

        self.live.lock().unwrap().remove(&pid);

        // Both forwarder threads have exited and dropped their clones, so this is
        // the sole remaining reference.
        if let Ok(mutex) = Arc::try_unwrap(logger) {
            mutex.into_inner().unwrap().close();
        }

        Ok(SpawnResult {
            exit_code: status.code().unwrap_or(-1),
            duration_ms: self.clock.now_ms().saturating_sub(start_ms),
        })
    }

    pub fn get_active_sessions(&self) -> Vec<ActiveSession> {
        self.live
            .lock()
            .unwrap()
            .iter()
            .map(|(pid, lc)| ActiveSession {
                pid: *pid,
                stage_id: lc.stage_id.clone(),
                worktree_index: lc.worktree_index,
            })
            .collect()
    }

    /// Signals every live child with `signal` (default `SIGTERM`).
    pub fn kill_all(&self, signal: i32) {
        let live = self.live.lock().unwrap();
        for pid in live.keys() {
            if is_process_alive(*pid) {
                unsafe {
                    libc::kill(*pid as i32, signal);
                }
            }
        }
    }
}

fn forward_raw(mut stream: impl Read, logger: Arc<Mutex<SessionLogger>>) {
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let _ = logger.lock().unwrap().write(&buf[..n]);
            }
        }
    }
}

/// Forwards stdout verbatim while a side-path parser observes a copy of each line
/// for a `session_id` field (spec.md 9: "never interrupt verbatim byte forwarding").
fn forward_stdout(
    stream: impl Read,
    logger: Arc<Mutex<SessionLogger>>,
    on_session_id: &mut Option<Box<dyn FnMut(String) + Send>>,
) {
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let Ok(line) = line else { break };
        let _ = logger.lock().unwrap().write(line.as_bytes());
        let _ = logger.lock().unwrap().write(b"\n");

        if on_session_id.is_some() {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) {
                if let Some(session_id) = value.get("session_id").and_then(|v| v.as_str()) {
                    if let Some(cb) = on_session_id.take() {
                        let mut cb = cb;
                        cb(session_id.to_string());
                        // Keep the slot empty: invoked exactly once (spec.md 4.4).
                        *on_session_id = None;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_lists_env_alphabetically() {
        let mut env = HashMap::new();
        env.insert("ZETA".to_string(), "1".to_string());
        env.insert("ALPHA".to_string(), "2".to_string());
        let options = SpawnOptions {
            stage_id: "STAGE-1".into(),
            stage_file_path: "/work/s.md".into(),
            skill_name: "design".into(),
            worktree_path: "/wt/0".into(),
            worktree_index: 0,
            model: None,
            workflow_env: env,
        };
        let prompt = build_prompt(&options);
        let alpha_pos = prompt.find("env.ALPHA").unwrap();
        let zeta_pos = prompt.find("env.ZETA").unwrap();
        assert!(alpha_pos < zeta_pos);
    }

    #[test]
    fn spawn_of_missing_binary_does_not_register_session() {
        let clock: Arc<dyn Clock> = Arc::new(crate::clock::SystemClock::new());
        let executor = SessionExecutor::new("definitely-not-a-real-binary".into(), clock);
        let dir = tempfile::tempdir().unwrap();
        let logger = SessionLogger::create("STAGE-1", dir.path()).unwrap();
        let options = SpawnOptions {
            stage_id: "STAGE-1".into(),
            stage_file_path: dir.path().join("s.md"),
            skill_name: "design".into(),
            worktree_path: dir.path().to_path_buf(),
            worktree_index: 0,
            model: None,
            workflow_env: HashMap::new(),
        };
        let result = executor.spawn(options, logger, None).unwrap();
        assert_ne!(result.exit_code, 0);
        assert!(executor.get_active_sessions().is_empty());
    }
}
