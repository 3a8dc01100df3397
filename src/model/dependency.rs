use serde::{Deserialize, Serialize};

/// A directed edge `from -> to` at any hierarchy level (spec.md 3). The core reads
/// these and may mark them resolved; it never creates or deletes them — that is the
/// sync collaborator's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    pub from: String,
    pub to: String,
    pub resolved: bool,
}
