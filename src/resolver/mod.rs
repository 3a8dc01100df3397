//! Resolver runner (C8, spec.md 4.8).

pub mod builtins;

use std::path::{Path, PathBuf};

use crate::exitgate::{ExitGateRunner, ExitGateResult};
use crate::frontmatter::FrontmatterStore;
use crate::logger::Logger;
use crate::model::ids::Status;
use crate::model::worker_info::WorkerInfo;
use crate::pipeline::PipelineModel;
use crate::store::{ResolverContext, ResolverRegistry, ResolverStageInput};

#[derive(Debug, Clone)]
pub struct ResolverResult {
    pub stage_id: String,
    pub resolver_name: String,
    pub previous_status: String,
    pub new_status: Option<String>,
    pub propagated: bool,
}

pub struct ResolverRunner<'a, F: FrontmatterStore> {
    pub frontmatter: &'a F,
    pub pipeline: &'a PipelineModel,
    pub registry: &'a ResolverRegistry,
    pub logger: &'a dyn Logger,
}

impl<'a, F: FrontmatterStore> ResolverRunner<'a, F> {
    /// Discovers stage files under `stages_dir`, evaluating each one whose status
    /// has a bound resolver and which isn't session-locked.
    pub fn check_all(
        &self,
        stages_dir: &Path,
        context: &dyn ResolverContext,
        exit_gate: &ExitGateRunner<'_, F>,
        repo: &str,
    ) -> Vec<ResolverResult> {
        let mut results = Vec::new();
        let entries = match std::fs::read_dir(stages_dir) {
            Ok(e) => e,
            Err(e) => {
                self.logger
                    .warn(&format!("resolver runner: cannot read {}: {e}", stages_dir.display()));
                return results;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            if let Some(result) = self.check_one(&path, context, exit_gate, repo) {
                results.push(result);
            }
        }
        results
    }

    fn check_one(
        &self,
        path: &Path,
        context: &dyn ResolverContext,
        exit_gate: &ExitGateRunner<'_, F>,
        repo: &str,
    ) -> Option<ResolverResult> {
        let doc = match self.frontmatter.read(path) {
            Ok(d) => d,
            Err(e) => {
                self.logger.warn(&format!("resolver runner: skipping {}: {e}", path.display()));
                return None;
            }
        };

        let id = doc.data.get("id")?.as_str()?.to_string();
        let status_str = doc.data.get("status")?.as_str()?.to_string();
        let session_active = doc
            .data
            .get("session_active")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if session_active {
            return None;
        }

        let status = Status::from(status_str.clone());
        let resolver_name = self.pipeline.resolver_for(&status)?.to_string();
        let resolver = self.registry.get(&resolver_name)?;

        let input = ResolverStageInput {
            id: id.clone(),
            status: status_str.clone(),
            ticket_id: str_field(&doc.data, "ticket"),
            epic_id: str_field(&doc.data, "epic"),
            pr_url: doc.data.get("pr_url").and_then(|v| v.as_str()).map(String::from),
            pr_number: doc.data.get("pr_number").and_then(|v| v.as_u64()),
            worktree_branch: doc
                .data
                .get("worktree_branch")
                .and_then(|v| v.as_str())
                .map(String::from),
            refinement_type: doc
                .data
                .get("refinement_type")
                .and_then(|v| v.as_sequence())
                .map(|seq| seq.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                .unwrap_or_default(),
        };

        let new_status = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| resolver(&input, context)))
            .unwrap_or_else(|_| {
                self.logger
                    .error(&format!("resolver '{resolver_name}' panicked for stage {id}"));
                None
            });

        let Some(new_status) = new_status else {
            return Some(ResolverResult {
                stage_id: id,
                resolver_name,
                previous_status: status_str,
                new_status: None,
                propagated: false,
            });
        };

        let mut data = doc.data.clone();
        if let Some(map) = data.as_mapping_mut() {
            map.insert("status".into(), new_status.clone().into());
        }
        if let Err(e) = self.frontmatter.write(path, data, &doc.content) {
            self.logger
                .warn(&format!("resolver runner: failed to write {}: {e}", path.display()));
            return Some(ResolverResult {
                stage_id: id,
                resolver_name,
                previous_status: status_str,
                new_status: Some(new_status),
                propagated: false,
            });
        }

        let worker_info = WorkerInfo {
            stage_id: id.clone().into(),
            stage_file_path: path.to_path_buf(),
            worktree_path: PathBuf::new(),
            worktree_index: -1,
            status_before: status,
            start_time: std::time::Instant::now(),
        };

        let gate_result: ExitGateResult = exit_gate.run(&worker_info, repo, &Status::from(new_status.clone()));

        Some(ResolverResult {
            stage_id: id,
            resolver_name,
            previous_status: status_str,
            new_status: Some(new_status),
            propagated: gate_result.status_changed,
        })
    }
}

fn str_field(data: &serde_yaml::Value, key: &str) -> String {
    data.get(key).and_then(|v| v.as_str()).unwrap_or_default().to_string()
}
