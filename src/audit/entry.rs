//! Hash Chain Entry
//!
//! One change-log record of a document's audit log. Each entry carries the
//! hash declared by the editing tool; the hash is recomputed here from the
//! entry content and, for sequential logs, from the parent entry's hash.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::audit::tree::NULL_SENTINEL;

/// Documents at or above this format version chain each entry hash to its parent.
pub const SEQUENTIAL_HASH_MIN_FORMAT: f64 = 20.21;

/// Seconds between 1601-01-01 (Windows file time epoch) and the Unix epoch.
const FILE_TIME_EPOCH_OFFSET: i64 = 11_644_473_600;

const HASH_PREFIX: &str = "sha256:";

/// A single message attached to an audit log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogMessage {
    pub order_number: i64,
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub en_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expanded_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditLogMessage {
    pub fn new(order_number: i64, message_type: impl Into<String>, en_text: impl Into<String>) -> Self {
        Self {
            order_number,
            message_type: message_type.into(),
            en_text: Some(en_text.into()),
            expanded_text: None,
            reason: None,
        }
    }

    /// Text contributed to the entry hash: English text, else expanded text, else the type.
    pub fn hashing_text(&self) -> &str {
        self.en_text
            .as_deref()
            .or(self.expanded_text.as_deref())
            .unwrap_or(&self.message_type)
    }
}

/// Audit log entry with its place in the hash chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashChainEntry {
    #[serde(skip)]
    pub entry_id: Option<i64>,
    #[serde(skip)]
    pub document_guid: Option<Uuid>,
    #[serde(skip)]
    pub version_id: Option<i64>,
    pub create_timestamp: DateTime<FixedOffset>,
    pub user_name: String,
    pub format_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_info: Option<String>,
    #[serde(default)]
    pub messages: Vec<AuditLogMessage>,
    #[serde(default)]
    pub entry_hash: String,
    #[serde(skip)]
    pub parent_entry_hash: Option<String>,
    #[serde(skip)]
    pub document_format_version: Option<f64>,
}

impl HashChainEntry {
    /// Create a new entry chained to `parent_entry_hash` and seal its hash.
    pub fn new(
        user_name: impl Into<String>,
        format_version: impl Into<String>,
        create_timestamp: DateTime<FixedOffset>,
        parent_entry_hash: Option<String>,
        messages: Vec<AuditLogMessage>,
    ) -> Self {
        let mut entry = Self {
            entry_id: None,
            document_guid: None,
            version_id: None,
            create_timestamp,
            user_name: user_name.into(),
            format_version: format_version.into(),
            reason: None,
            extra_info: None,
            messages,
            entry_hash: String::new(),
            parent_entry_hash,
            document_format_version: None,
        };
        entry.seal();
        entry
    }

    /// Recompute and store this entry's hash.
    pub fn seal(&mut self) {
        self.entry_hash = self.calculate_hash();
    }

    /// Whether the parent hash participates in this entry's hash.
    pub fn is_sequential(&self) -> bool {
        self.document_format_version
            .map_or(true, |v| v >= SEQUENTIAL_HASH_MIN_FORMAT)
    }

    pub fn has_declared_hash(&self) -> bool {
        !self.entry_hash.trim().is_empty()
    }

    /// Legacy entries without a declared hash take the calculated one as identity.
    pub fn adopt_calculated_hash(&mut self) {
        self.entry_hash = self.calculate_hash();
    }

    /// Parent hash as stored: the sentinel for the first entry of a chain.
    pub fn stored_parent_hash(&self) -> &str {
        self.parent_entry_hash.as_deref().unwrap_or(NULL_SENTINEL)
    }

    /// Windows file time in seconds, 8 bytes little-endian.
    pub fn timestamp_hashing_bytes(&self) -> [u8; 8] {
        let file_time = self.create_timestamp.timestamp() + FILE_TIME_EPOCH_OFFSET;
        file_time.to_le_bytes()
    }

    /// Timezone offset in hours with at most one decimal ("-5", "5.5", "0").
    pub fn timezone_hashing_bytes(&self) -> Vec<u8> {
        let minutes = self.create_timestamp.offset().local_minus_utc() / 60;
        format_offset_hours(minutes).into_bytes()
    }

    pub fn timezone_offset_minutes(&self) -> i32 {
        self.create_timestamp.offset().local_minus_utc() / 60
    }

    /// Calculate the SHA256 hash of this entry
    pub fn calculate_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.user_name.as_bytes());
        if let Some(extra_info) = &self.extra_info {
            hasher.update(extra_info.as_bytes());
        }
        if let Some(reason) = &self.reason {
            hasher.update(reason.as_bytes());
        }
        for message in &self.messages {
            hasher.update(message.hashing_text().as_bytes());
        }
        hasher.update(self.format_version.as_bytes());
        hasher.update(self.timestamp_hashing_bytes());
        hasher.update(self.timezone_hashing_bytes());

        if self.is_sequential() {
            if let Some(parent) = self
                .parent_entry_hash
                .as_deref()
                .filter(|p| *p != NULL_SENTINEL)
            {
                hasher.update(hash_bytes(parent));
            }
        }

        format!("{}{}", HASH_PREFIX, hex::encode(hasher.finalize()))
    }

    /// Verify this entry's declared hash
    pub fn verify_hash(&self) -> bool {
        self.entry_hash == self.calculate_hash()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} by {} at {} ({} messages)",
            short_hash(&self.entry_hash),
            self.user_name,
            self.create_timestamp.to_rfc3339(),
            self.messages.len()
        )
    }
}

/// Link entries (oldest first) into a chain and seal every hash.
pub fn link_chain(entries: &mut [HashChainEntry]) {
    let mut previous: Option<String> = None;
    for entry in entries.iter_mut() {
        entry.parent_entry_hash = previous.take();
        entry.seal();
        previous = Some(entry.entry_hash.clone());
    }
}

/// Raw digest bytes of an encoded hash; undecodable values hash as their text.
pub fn hash_bytes(hash: &str) -> Vec<u8> {
    let body = hash.strip_prefix(HASH_PREFIX).unwrap_or(hash);
    hex::decode(body).unwrap_or_else(|_| hash.as_bytes().to_vec())
}

pub fn short_hash(hash: &str) -> &str {
    let body = hash.strip_prefix(HASH_PREFIX).unwrap_or(hash);
    body.char_indices()
        .nth(12)
        .map(|(idx, _)| &body[..idx])
        .unwrap_or(body)
}

fn format_offset_hours(offset_minutes: i32) -> String {
    let hours = (offset_minutes as f64 / 60.0 * 10.0).round() / 10.0;
    if hours.fract() == 0.0 {
        format!("{}", hours as i64)
    } else {
        format!("{:.1}", hours)
    }
}
