//! External collaborator contracts (spec.md 6): Store, Sync, Code-host adapter,
//! Resolver registry. Implementations besides the minimal file-backed `Store`
//! below are explicitly out of scope (spec.md 1) — the core depends only on these
//! traits.

pub mod file;

use anyhow::Result;

use crate::model::{CommentTrackingRow, ParentBranchTrackingRow};

pub trait Store: Send + std::marker::Sync {
    fn query_stages_in_pr_created(&self, repo: &str, limit: usize) -> Result<Vec<crate::model::Stage>>;
    fn get_comment_tracking(&self, stage_id: &str) -> Result<Option<CommentTrackingRow>>;
    fn upsert_comment_tracking(&self, row: CommentTrackingRow) -> Result<()>;
    fn get_active_tracking_rows(&self, repo: &str) -> Result<Vec<ParentBranchTrackingRow>>;
    fn update_tracking_row(&self, id: (&str, &str), patch: TrackingRowPatch) -> Result<()>;
    fn get_tracking_rows_for_child(&self, child_id: &str) -> Result<Vec<ParentBranchTrackingRow>>;
}

#[derive(Debug, Clone, Default)]
pub struct TrackingRowPatch {
    pub last_known_head: Option<String>,
    pub is_merged: Option<bool>,
    pub last_checked: Option<chrono::DateTime<chrono::Utc>>,
}

/// `runSync(repo) -> {success, error?}`. Must be idempotent (spec.md 6).
pub trait Sync: Send + std::marker::Sync {
    fn run_sync(&self, repo: &str) -> Result<SyncOutcome>;
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PrStatus {
    pub merged: bool,
    pub has_unresolved_comments: bool,
    pub unresolved_thread_count: u64,
    pub state: String,
}

/// Optional external system hosting pull requests and branches (spec.md 6). Any
/// method may error; `get_branch_head` returning `""` is treated as "unchanged".
pub trait CodeHostAdapter: Send + std::marker::Sync {
    fn get_pr_status(&self, pr_url: &str) -> Result<PrStatus>;
    fn get_branch_head(&self, branch: &str) -> Result<String>;
    fn edit_pr_base(&self, pr_number: u64, target_branch: &str) -> Result<()>;
    fn mark_pr_ready(&self, pr_number: u64) -> Result<()>;
}

/// Input exposed to a resolver (spec.md 4.8).
#[derive(Debug, Clone)]
pub struct ResolverStageInput {
    pub id: String,
    pub status: String,
    pub ticket_id: String,
    pub epic_id: String,
    pub pr_url: Option<String>,
    pub pr_number: Option<u64>,
    pub worktree_branch: Option<String>,
    pub refinement_type: Vec<String>,
}

pub trait ResolverContext: Send + std::marker::Sync {
    fn code_host(&self) -> Option<&dyn CodeHostAdapter>;
}

pub type ResolverFn = dyn Fn(&ResolverStageInput, &dyn ResolverContext) -> Option<String> + Send + std::marker::Sync;

/// Map `name -> resolver` (spec.md 6). Dynamic dispatch via a string-keyed map is
/// intentional (spec.md 9): the core has no compile-time knowledge of the set of
/// resolvers.
#[derive(Default)]
pub struct ResolverRegistry {
    resolvers: std::collections::HashMap<String, Box<ResolverFn>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, resolver: Box<ResolverFn>) {
        self.resolvers.insert(name.into(), resolver);
    }

    pub fn get(&self, name: &str) -> Option<&ResolverFn> {
        self.resolvers.get(name).map(|b| b.as_ref())
    }

    /// The two built-in resolvers required by spec.md 6.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("pr-status", Box::new(crate::resolver::builtins::pr_status));
        registry.register(
            "testing-router",
            Box::new(crate::resolver::builtins::testing_router),
        );
        registry
    }
}
