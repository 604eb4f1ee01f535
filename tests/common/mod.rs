#![allow(dead_code)]

use audit_tree::audit::entry::{link_chain, AuditLogMessage, HashChainEntry};
use audit_tree::audit::{AuditLogService, IntegrityLevel, LogFileWriter};
use audit_tree::database::Database;
use chrono::{DateTime, Duration, FixedOffset, TimeZone};
use std::path::PathBuf;
use std::time::Duration as StdDuration;
use tempfile::TempDir;

/// Setup an in-memory SQLite database for testing
pub async fn setup_test_db() -> Database {
    Database::new_in_memory().await.expect("Failed to create test database")
}

/// Setup a file-backed SQLite database shared by several pools
pub async fn setup_file_db(dir: &TempDir) -> String {
    let url = format!("sqlite://{}", dir.path().join("audit-tree.db").display());
    let database = Database::new(&url).await.expect("Failed to create file database");
    database.run_migrations().await.expect("Failed to apply schema");
    database.close().await;
    url
}

pub async fn setup_service(level: IntegrityLevel) -> AuditLogService {
    AuditLogService::new(setup_test_db().await, level).with_retry(10, StdDuration::from_millis(5))
}

fn base_timestamp() -> DateTime<FixedOffset> {
    FixedOffset::east_opt(2 * 3600)
        .unwrap()
        .with_ymd_and_hms(2024, 5, 21, 9, 30, 0)
        .unwrap()
}

/// Build a linked chain (oldest first), one entry per label.
///
/// Entry content depends only on the label and its position, so two chains
/// starting with the same labels share their leading hashes.
pub fn chain(labels: &[&str]) -> Vec<HashChainEntry> {
    let mut entries: Vec<HashChainEntry> = labels
        .iter()
        .enumerate()
        .map(|(i, label)| {
            HashChainEntry::new(
                "analyst",
                "24.1",
                base_timestamp() + Duration::minutes(i as i64),
                None,
                vec![
                    AuditLogMessage::new(0, "modified", *label),
                    AuditLogMessage::new(1, "saved", "Document saved"),
                ],
            )
        })
        .collect();
    link_chain(&mut entries);
    entries
}

/// Write a complete log for `labels` and return its path and declared root digest.
pub fn write_log(dir: &TempDir, name: &str, labels: &[&str]) -> (PathBuf, String) {
    let path = dir.path().join(format!("{}.jsonl", name));
    let root = LogFileWriter::write_chain(&path, &chain(labels), None).expect("Failed to write log");
    (path, root)
}

/// Write entries (oldest first) without a footer and with their hashes blanked,
/// the way logs of older documents look.
pub fn write_legacy_log(dir: &TempDir, name: &str, labels: &[&str]) -> PathBuf {
    let path = dir.path().join(format!("{}.jsonl", name));
    let mut writer = LogFileWriter::create(&path).expect("Failed to create log");
    writer.write_header(None).unwrap();
    for mut entry in chain(labels).into_iter().rev() {
        entry.entry_hash.clear();
        writer.write_entry(&entry).unwrap();
    }
    writer.finish().unwrap();
    path
}

/// Replace text in a written log file.
pub fn tamper_file(path: &PathBuf, from: &str, to: &str) {
    let contents = std::fs::read_to_string(path).unwrap();
    assert!(contents.contains(from), "log does not contain {}", from);
    std::fs::write(path, contents.replace(from, to)).unwrap();
}

pub fn hash_of(labels: &[&str]) -> String {
    chain(labels)
        .last()
        .map(|entry| entry.entry_hash.clone())
        .unwrap_or_default()
}

/// Same as `chain`, but every entry lists its messages in reverse order number.
pub fn chain_with_reversed_messages(labels: &[&str]) -> Vec<HashChainEntry> {
    let mut entries = chain(labels);
    for entry in &mut entries {
        entry.messages.reverse();
    }
    link_chain(&mut entries);
    entries
}

/// Format version of documents written before hashes covered the parent entry.
pub const LEGACY_FORMAT: f64 = 4.2;

/// Build a legacy-format chain from (label, minute) steps. Entry hashes do not
/// depend on the parent, so the same step hashes alike wherever it appears.
pub fn legacy_chain(steps: &[(&str, i64)]) -> Vec<HashChainEntry> {
    let mut entries: Vec<HashChainEntry> = steps
        .iter()
        .map(|(label, minute)| {
            let mut entry = HashChainEntry::new(
                "analyst",
                "3.7",
                base_timestamp() + Duration::minutes(*minute),
                None,
                vec![AuditLogMessage::new(0, "modified", *label)],
            );
            entry.document_format_version = Some(LEGACY_FORMAT);
            entry
        })
        .collect();
    link_chain(&mut entries);
    entries
}

/// Write a complete log of already built entries (oldest first).
pub fn write_entries(
    dir: &TempDir,
    name: &str,
    entries: &[HashChainEntry],
    document_format_version: Option<f64>,
) -> (PathBuf, String) {
    let path = dir.path().join(format!("{}.jsonl", name));
    let root = LogFileWriter::write_chain(&path, entries, document_format_version)
        .expect("Failed to write log");
    (path, root)
}
