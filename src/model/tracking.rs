use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::StageId;

/// Per (child stage, parent stage) pair (spec.md 3). Authoritative source for the
/// MR chain manager (C10); created when a child PR opens against a parent branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentBranchTrackingRow {
    pub child_stage_id: StageId,
    pub parent_stage_id: StageId,
    pub parent_branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_known_head: Option<String>,
    #[serde(default)]
    pub is_merged: bool,
    pub last_checked: DateTime<Utc>,
}

/// Per child-in-review stage (spec.md 3). Garbage-collected when the child stage
/// reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentTrackingRow {
    pub stage_id: StageId,
    pub last_poll_timestamp: DateTime<Utc>,
    pub last_known_unresolved_count: u64,
    pub repo_id: String,
}
