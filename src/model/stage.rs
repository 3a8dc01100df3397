use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{EpicId, StageId, Status, TicketId};

/// A soft-resolved parent the stage's PR is currently stacked on top of
/// (spec.md 3, "Stage" field `pending_merge_parents`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMergeParent {
    pub stage_id: StageId,
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
}

/// The atomic unit of work (spec.md 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: StageId,
    #[serde(rename = "ticket")]
    pub ticket_id: TicketId,
    #[serde(rename = "epic")]
    pub epic_id: EpicId,
    pub title: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(default)]
    pub session_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<u32>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub pending_merge_parents: Vec<PendingMergeParent>,
    #[serde(default)]
    pub is_draft: bool,
    #[serde(default)]
    pub rebase_conflict: bool,
    #[serde(default)]
    pub refinement_type: Vec<String>,
    #[serde(skip)]
    pub file_path: std::path::PathBuf,
}

impl Stage {
    /// Invariant from spec.md 3: `is_draft` iff `pending_merge_parents` non-empty.
    pub fn is_draft_consistent(&self) -> bool {
        self.is_draft == !self.pending_merge_parents.is_empty()
    }

    pub fn clear_pending_merge_parents(&mut self) {
        self.pending_merge_parents.clear();
        self.is_draft = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage() -> Stage {
        Stage {
            id: StageId::from("STAGE-001-001-001"),
            ticket_id: TicketId::from("TICKET-001-001"),
            epic_id: EpicId::from("EPIC-001"),
            title: "do thing".into(),
            status: Status::from("Design"),
            worktree_branch: None,
            pr_url: None,
            pr_number: None,
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
            file_path: Default::default(),
        }
    }

    #[test]
    fn draft_invariant_holds_when_cleared() {
        let mut s = stage();
        s.is_draft = true;
        s.pending_merge_parents.push(PendingMergeParent {
            stage_id: StageId::from("STAGE-000-000-000"),
            branch: "feat/p".into(),
            pr_url: None,
            pr_number: None,
        });
        assert!(s.is_draft_consistent());
        s.clear_pending_merge_parents();
        assert!(s.is_draft_consistent());
        assert!(!s.is_draft);
    }

    #[test]
    fn draft_invariant_detects_violation() {
        let mut s = stage();
        s.is_draft = true;
        assert!(!s.is_draft_consistent());
    }
}
