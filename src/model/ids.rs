//! Opaque hierarchy identifiers.
//!
//! `EPIC-nnn`, `TICKET-nnn-mmm`, `STAGE-nnn-mmm-kkk` are treated as opaque strings
//! by every collaborator; the newtypes here exist only so the compiler rejects
//! passing a `TicketId` where a `StageId` is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

opaque_id!(StageId);
opaque_id!(TicketId);
opaque_id!(EpicId);

/// A status token, e.g. `"Design"`, `"PR Created"`, `"Complete"`. Stored as-written
/// in frontmatter; the pipeline model is the only thing that assigns meaning to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Status(pub String);

impl Status {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Status {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Status {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Reserved statuses that exist outside any phase declaration (spec.md 4.1).
pub const NOT_STARTED: &str = "Not Started";
pub const COMPLETE: &str = "Complete";
pub const SKIPPED: &str = "Skipped";
pub const IN_PROGRESS: &str = "In Progress";
pub const DONE: &str = "Done";
