use serde::{Deserialize, Serialize};

/// Lifecycle of a document version as seen by the audit log subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Pending,
    Imported,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::Pending => "pending",
            VersionStatus::Imported => "imported",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(VersionStatus::Pending),
            "imported" => Some(VersionStatus::Imported),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentVersion {
    pub version_id: i64,
    pub document_guid: String,
    pub status: VersionStatus,
    pub root_digest: Option<String>,
}

/// One node of a document's audit log tree as returned by the recursive query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeRow {
    pub entry_id: i64,
    pub entry_hash: String,
    pub parent_entry_hash: String,
    pub depth: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionPointerRow {
    pub version_id: i64,
    pub entry_id: i64,
}
