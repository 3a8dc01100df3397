pub mod dependency;
pub mod epic;
pub mod ids;
pub mod stage;
pub mod ticket;
pub mod tracking;
pub mod worker_info;

pub use dependency::Dependency;
pub use epic::Epic;
pub use stage::{PendingMergeParent, Stage};
pub use ticket::Ticket;
pub use tracking::{CommentTrackingRow, ParentBranchTrackingRow};
pub use worker_info::WorkerInfo;
