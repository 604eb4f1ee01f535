//! Audit Log Sources
//!
//! The importer pulls entries from a [`LogSource`]: a single-pass,
//! newest-first stream that reveals the file's declared root digest once it
//! is exhausted. [`JsonLogReader`] reads the JSON-lines log format written by
//! [`LogFileWriter`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::audit::entry::{AuditLogMessage, HashChainEntry};
use crate::audit::verify::RootDigest;
use crate::error::AuditLogError;

/// Error produced while pulling an entry from a log source.
#[derive(Error, Debug)]
pub enum SourceError {
    /// One entry could not be interpreted; the rest of the stream is usable.
    #[error("Malformed log entry: {0}")]
    Malformed(String),

    /// The stream itself failed; nothing after this point can be trusted.
    #[error(transparent)]
    Stream(#[from] AuditLogError),
}

/// Newest-first, single-pass stream of audit log entries.
pub trait LogSource {
    fn next_entry(&mut self) -> Option<Result<HashChainEntry, SourceError>>;

    /// Root digest declared by the source. Only meaningful once exhausted.
    fn declared_root_digest(&self) -> Option<&str>;
}

/// In-memory source, mostly for callers that already hold parsed entries.
pub struct MemoryLogSource {
    entries: VecDeque<Result<HashChainEntry, SourceError>>,
    root_digest: Option<String>,
}

impl MemoryLogSource {
    /// Entries are given newest first, the way a log file lists them.
    pub fn new(entries: Vec<HashChainEntry>, root_digest: Option<String>) -> Self {
        Self {
            entries: entries.into_iter().map(Ok).collect(),
            root_digest,
        }
    }

    pub fn from_results(
        entries: Vec<Result<HashChainEntry, SourceError>>,
        root_digest: Option<String>,
    ) -> Self {
        Self {
            entries: entries.into(),
            root_digest,
        }
    }
}

impl LogSource for MemoryLogSource {
    fn next_entry(&mut self) -> Option<Result<HashChainEntry, SourceError>> {
        self.entries.pop_front()
    }

    fn declared_root_digest(&self) -> Option<&str> {
        self.root_digest.as_deref()
    }
}

#[derive(Debug, Deserialize)]
struct HeaderLine {
    #[serde(default)]
    document_format_version: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct FooterLine {
    #[serde(default)]
    root_hash: Option<String>,
}

/// Entry line as found in the file. Required fields are optional here so that
/// a missing one is reported as a malformed entry rather than a broken stream.
#[derive(Debug, Deserialize)]
struct EntryLine {
    #[serde(default)]
    create_timestamp: Option<String>,
    #[serde(default)]
    user_name: Option<String>,
    #[serde(default)]
    format_version: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    extra_info: Option<String>,
    #[serde(default)]
    messages: Vec<AuditLogMessage>,
    #[serde(default)]
    entry_hash: Option<String>,
}

impl EntryLine {
    fn into_entry(self, document_format_version: Option<f64>) -> Result<HashChainEntry, String> {
        let user_name = self
            .user_name
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| "entry has no user name".to_string())?;
        let timestamp = self
            .create_timestamp
            .ok_or_else(|| "entry has no timestamp".to_string())?;
        let create_timestamp = chrono::DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|e| format!("invalid timestamp {}: {}", timestamp, e))?;

        Ok(HashChainEntry {
            entry_id: None,
            document_guid: None,
            version_id: None,
            create_timestamp,
            user_name,
            format_version: self.format_version.unwrap_or_default(),
            reason: self.reason,
            extra_info: self.extra_info,
            messages: self.messages,
            entry_hash: self.entry_hash.unwrap_or_default(),
            parent_entry_hash: None,
            document_format_version,
        })
    }
}

/// Reader for JSON-lines audit log files.
///
/// Each line carries a `kind`: an optional `header` with the document format
/// version, one `entry` per change (newest first) and a `footer` with the
/// root digest.
pub struct JsonLogReader {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    line_number: usize,
    document_format_version: Option<f64>,
    root_digest: Option<String>,
}

impl JsonLogReader {
    pub fn open(path: &Path) -> Result<Self, AuditLogError> {
        let file = File::open(path).map_err(|e| {
            AuditLogError::IoError(format!("Failed to open audit log {}: {}", path.display(), e))
        })?;
        debug!("Opened audit log {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            lines: BufReader::new(file).lines(),
            line_number: 0,
            document_format_version: None,
            root_digest: None,
        })
    }

    pub fn document_format_version(&self) -> Option<f64> {
        self.document_format_version
    }

    fn parse_line(&mut self, line: &str) -> Result<Option<HashChainEntry>, SourceError> {
        let value: Value = serde_json::from_str(line).map_err(|e| {
            AuditLogError::Parse(format!(
                "{} line {}: {}",
                self.path.display(),
                self.line_number,
                e
            ))
        })?;
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or("entry")
            .to_string();

        match kind.as_str() {
            "header" => {
                let header: HeaderLine = serde_json::from_value(value).map_err(AuditLogError::from)?;
                self.document_format_version = header.document_format_version;
                Ok(None)
            }
            "footer" => {
                let footer: FooterLine = serde_json::from_value(value).map_err(AuditLogError::from)?;
                self.root_digest = footer.root_hash;
                Ok(None)
            }
            "entry" => {
                let line: EntryLine = serde_json::from_value(value).map_err(|e| {
                    SourceError::Malformed(format!("line {}: {}", self.line_number, e))
                })?;
                line.into_entry(self.document_format_version)
                    .map(Some)
                    .map_err(|reason| {
                        SourceError::Malformed(format!("line {}: {}", self.line_number, reason))
                    })
            }
            other => Err(SourceError::Malformed(format!(
                "line {}: unknown record kind {}",
                self.line_number, other
            ))),
        }
    }
}

impl LogSource for JsonLogReader {
    fn next_entry(&mut self) -> Option<Result<HashChainEntry, SourceError>> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(SourceError::Stream(e.into()))),
            };
            self.line_number += 1;
            if line.trim().is_empty() {
                continue;
            }

            match self.parse_line(&line) {
                Ok(Some(entry)) => return Some(Ok(entry)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }

    fn declared_root_digest(&self) -> Option<&str> {
        self.root_digest.as_deref()
    }
}

#[derive(Serialize)]
struct EntryRecord<'a> {
    kind: &'static str,
    #[serde(flatten)]
    entry: &'a HashChainEntry,
}

/// Writer for JSON-lines audit log files.
pub struct LogFileWriter {
    writer: BufWriter<File>,
    digest: RootDigest,
}

impl LogFileWriter {
    pub fn create(path: &Path) -> Result<Self, AuditLogError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path).map_err(|e| {
            AuditLogError::IoError(format!("Failed to create audit log {}: {}", path.display(), e))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            digest: RootDigest::new(),
        })
    }

    pub fn write_header(&mut self, document_format_version: Option<f64>) -> Result<(), AuditLogError> {
        let header = serde_json::json!({
            "kind": "header",
            "document_format_version": document_format_version,
        });
        writeln!(self.writer, "{}", header)?;
        Ok(())
    }

    /// Append one entry. Entries must be written newest first.
    pub fn write_entry(&mut self, entry: &HashChainEntry) -> Result<(), AuditLogError> {
        let record = EntryRecord {
            kind: "entry",
            entry,
        };
        writeln!(self.writer, "{}", serde_json::to_string(&record)?)?;
        self.digest.update(&entry.entry_hash);
        Ok(())
    }

    /// Root digest of the entries written so far.
    pub fn root_digest(&self) -> String {
        self.digest.clone().finalize()
    }

    pub fn write_footer(&mut self, root_hash: &str) -> Result<(), AuditLogError> {
        let footer = serde_json::json!({ "kind": "footer", "root_hash": root_hash });
        writeln!(self.writer, "{}", footer)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<(), AuditLogError> {
        self.writer.flush()?;
        Ok(())
    }

    /// Write a complete log for a chain given oldest first and return its root digest.
    pub fn write_chain(
        path: &Path,
        entries_oldest_first: &[HashChainEntry],
        document_format_version: Option<f64>,
    ) -> Result<String, AuditLogError> {
        let mut writer = Self::create(path)?;
        writer.write_header(document_format_version)?;
        for entry in entries_oldest_first.iter().rev() {
            writer.write_entry(entry)?;
        }
        let root_digest = writer.root_digest();
        writer.write_footer(&root_digest)?;
        writer.finish()?;

        info!(
            "Wrote audit log {} ({} entries)",
            path.display(),
            entries_oldest_first.len()
        );
        Ok(root_digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::link_chain;
    use chrono::{Duration, FixedOffset, TimeZone};
    use tempfile::TempDir;

    fn chain(len: usize) -> Vec<HashChainEntry> {
        let start = FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2024, 1, 9, 14, 0, 0)
            .unwrap();
        let mut entries: Vec<HashChainEntry> = (0..len)
            .map(|i| {
                HashChainEntry::new(
                    "reviewer",
                    "23.1",
                    start + Duration::seconds(i as i64 * 90),
                    None,
                    vec![AuditLogMessage::new(0, "modified", format!("Step {}", i))],
                )
            })
            .collect();
        link_chain(&mut entries);
        entries
    }

    fn read_all(reader: &mut JsonLogReader) -> Vec<Result<HashChainEntry, SourceError>> {
        std::iter::from_fn(|| reader.next_entry()).collect()
    }

    #[test]
    fn test_written_log_reads_back_newest_first() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.jsonl");
        let entries = chain(3);
        let root = LogFileWriter::write_chain(&path, &entries, Some(23.1)).unwrap();

        let mut reader = JsonLogReader::open(&path).unwrap();
        let read: Vec<HashChainEntry> = read_all(&mut reader).into_iter().map(|r| r.unwrap()).collect();

        assert_eq!(read.len(), 3);
        assert_eq!(read[0].entry_hash, entries[2].entry_hash);
        assert_eq!(read[2].entry_hash, entries[0].entry_hash);
        assert_eq!(read[0].document_format_version, Some(23.1));
        assert_eq!(reader.declared_root_digest(), Some(root.as_str()));
    }

    #[test]
    fn test_bad_entry_is_malformed_not_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.jsonl");
        std::fs::write(
            &path,
            concat!(
                "{\"kind\":\"entry\",\"user_name\":\"bob\",\"create_timestamp\":\"yesterday\"}\n",
                "{\"kind\":\"entry\",\"create_timestamp\":\"2024-01-09T14:00:00+01:00\"}\n",
                "{\"kind\":\"entry\",\"user_name\":\"bob\",\"format_version\":\"1\",\"create_timestamp\":\"2024-01-09T14:00:00+01:00\"}\n",
            ),
        )
        .unwrap();

        let mut reader = JsonLogReader::open(&path).unwrap();
        let read = read_all(&mut reader);
        assert_eq!(read.len(), 3);
        assert!(matches!(read[0], Err(SourceError::Malformed(_))));
        assert!(matches!(read[1], Err(SourceError::Malformed(_))));
        let entry = read[2].as_ref().unwrap();
        assert_eq!(entry.user_name, "bob");
        assert!(!entry.has_declared_hash());
        assert!(reader.declared_root_digest().is_none());
    }

    #[test]
    fn test_undecodable_line_is_a_stream_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.jsonl");
        std::fs::write(&path, "{\"kind\":\"entry\",\n").unwrap();

        let mut reader = JsonLogReader::open(&path).unwrap();
        let read = read_all(&mut reader);
        assert!(matches!(
            read[0],
            Err(SourceError::Stream(AuditLogError::Parse(_)))
        ));
    }

    #[test]
    fn test_open_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            JsonLogReader::open(&dir.path().join("absent.jsonl")),
            Err(AuditLogError::IoError(_))
        ));
    }
}
