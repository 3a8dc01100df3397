use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::ids::{EpicId, Status, TicketId};

/// Groups stages (spec.md 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    #[serde(rename = "epic")]
    pub epic_id: EpicId,
    pub title: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jira_key: Option<String>,
    #[serde(default)]
    pub stage_statuses: HashMap<String, Status>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(skip)]
    pub file_path: std::path::PathBuf,
}
