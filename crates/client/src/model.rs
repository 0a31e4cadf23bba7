//! Canonical in-memory shapes for concerns and their comment threads, plus
//! the defensive normalization applied to raw snapshot records.

use concern_protocol::{CommentRecord, ConcernRecord, COMPANY_SENDER};
use serde::{Deserialize, Serialize};

use crate::ids;

/// One message in a concern's thread. Once appended the identifier and
/// authorship never change; the timestamp never reorders the thread.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Comment {
    pub id: String,
    pub text: String,
    pub author: String,
    pub timestamp: String,
}

impl Comment {
    /// Whether this comment was written by the organization party.
    #[must_use]
    pub fn is_company(&self) -> bool {
        self.author == COMPANY_SENDER
    }
}

/// A submitted issue with its comment thread. Comment order is arrival
/// order at this client, append-only.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Concern {
    pub id: String,
    pub title: Option<String>,
    pub organization: Option<String>,
    pub status: Option<String>,
    pub date: Option<String>,
    pub comments: Vec<Comment>,
}

impl Concern {
    #[must_use]
    pub fn status_kind(&self) -> StatusKind {
        StatusKind::classify(self.status.as_deref())
    }

    #[must_use]
    pub fn comment_count(&self) -> usize {
        self.comments.len()
    }

    /// Timestamp of the most recent comment, for list displays.
    #[must_use]
    pub fn last_update(&self) -> Option<&str> {
        self.comments.last().map(|c| c.timestamp.as_str())
    }

    /// Title, falling back to the organization name, falling back to a
    /// generic label.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.title
            .as_deref()
            .or(self.organization.as_deref())
            .filter(|s| !s.is_empty())
            .unwrap_or("Unnamed Concern")
    }

    #[must_use]
    pub fn contains_comment(&self, comment_id: &str) -> bool {
        self.comments.iter().any(|c| c.id == comment_id)
    }
}

/// Classification of the free-form status label. Recognized values drive
/// presentation only; everything else is neutral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Open,
    Pending,
    Unknown,
}

impl StatusKind {
    #[must_use]
    pub fn classify(label: Option<&str>) -> Self {
        match label {
            Some("Open") => Self::Open,
            Some("Pending") => Self::Pending,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "Open",
            Self::Pending => "Pending",
            Self::Unknown => "Unknown",
        }
    }
}

/// Normalize one raw snapshot record: generate any missing identifiers and
/// default any missing comment timestamps to the time of observation. The
/// record is never rejected, whatever shape it arrived in.
#[must_use]
pub fn normalize_concern(record: ConcernRecord) -> Concern {
    Concern {
        id: record.id.filter(|id| !id.is_empty()).unwrap_or_else(ids::new_id),
        title: record.title,
        organization: record.organization,
        status: record.status,
        date: record.date,
        comments: record.comments.into_iter().map(normalize_comment).collect(),
    }
}

fn normalize_comment(record: CommentRecord) -> Comment {
    Comment {
        id: record.id.filter(|id| !id.is_empty()).unwrap_or_else(ids::new_id),
        text: record.text,
        author: record.author,
        timestamp: record
            .timestamp
            .filter(|ts| !ts.is_empty())
            .unwrap_or_else(crate::time::now_iso8601),
    }
}
