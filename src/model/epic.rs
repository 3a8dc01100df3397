use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::ids::{EpicId, Status};

/// Groups tickets (spec.md 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epic {
    pub id: EpicId,
    pub title: String,
    pub status: Status,
    #[serde(default)]
    pub ticket_statuses: HashMap<String, Status>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(skip)]
    pub file_path: std::path::PathBuf,
}
