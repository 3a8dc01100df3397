use std::path::PathBuf;
use std::time::Instant;

use super::ids::{Status, StageId};

/// Per active session, in-memory only (spec.md 3). Keyed by `worktree_index` in the
/// orchestrator loop's worker map.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub stage_id: StageId,
    pub stage_file_path: PathBuf,
    pub worktree_path: PathBuf,
    pub worktree_index: i64,
    pub status_before: Status,
    pub start_time: Instant,
}
