//! Audit Log Import
//!
//! Reads a version's change log, verifies it, and merges it into the shared
//! tree of its document. Entries already present along the same path are
//! reused; the rest extend the tree under the last reused node. The whole
//! merge runs in one transaction and is retried from a freshly rebuilt tree
//! when another writer got there first.

use serde::Serialize;
use sqlx::SqliteConnection;
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::entry::{short_hash, HashChainEntry};
use crate::audit::policy::{Check, IntegrityReporter};
use crate::audit::service::{load_tree, AuditLogService};
use crate::audit::source::{JsonLogReader, LogSource, SourceError};
use crate::audit::tree::VersionTree;
use crate::audit::verify::{verify_chain, verify_entry, ChainVerification, RootDigest, VerificationResult};
use crate::database::models::VersionStatus;
use crate::database::queries::Queries;
use crate::error::AuditLogError;

/// Outcome of a single import.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub document_guid: Option<Uuid>,
    pub version_id: i64,
    pub entries_read: usize,
    pub entries_persisted: usize,
    pub entries_reused: usize,
    pub malformed_entries: usize,
    pub hash_failures: usize,
    pub missing_hashes: usize,
    pub root_digest_valid: Option<bool>,
    /// True when the log was not merged at all (tolerated precondition or divergence).
    pub skipped: bool,
    pub merge_attempts: u32,
    pub warnings: String,
}

impl ImportReport {
    fn skipped(document_guid: Option<Uuid>, version_id: i64, reporter: &IntegrityReporter) -> Self {
        Self {
            document_guid,
            version_id,
            skipped: true,
            warnings: reporter.summary(),
            ..Default::default()
        }
    }
}

/// Entries of one log, oldest first, with what was learned while reading them.
struct ParsedLog {
    entries: Vec<HashChainEntry>,
    malformed: usize,
    computed_root_digest: String,
    declared_root_digest: Option<String>,
    chain: ChainVerification,
}

enum MergeOutcome {
    Merged { persisted: usize, reused: usize, root_digest_valid: Option<bool> },
    /// Nothing to attach; the version itself is still recorded.
    Skipped,
    /// The log contradicts stored history; nothing from this attempt is kept.
    Diverged,
    /// The version already has a different history or document; it stays as stored.
    Retained,
}

/// Result of walking the log through the tree.
#[derive(Debug, Default)]
pub(crate) struct MergeCounts {
    pub persisted: usize,
    pub reused_entry_ids: Vec<i64>,
    pub diverged: bool,
    /// The log would move the version off the history it was imported with.
    pub rewrites_version: bool,
}

impl AuditLogService {
    /// Import a version's audit log and return the number of newly persisted entries.
    pub async fn import_log(
        &self,
        document_guid: Option<Uuid>,
        version_id: i64,
        log_path: Option<&Path>,
    ) -> Result<usize, AuditLogError> {
        let report = self.import_log_with_report(document_guid, version_id, log_path).await?;
        Ok(report.entries_persisted)
    }

    pub async fn import_log_with_report(
        &self,
        document_guid: Option<Uuid>,
        version_id: i64,
        log_path: Option<&Path>,
    ) -> Result<ImportReport, AuditLogError> {
        let mut reporter = IntegrityReporter::new(self.level);

        let Some(log_path) = log_path.filter(|path| has_content(path)) else {
            reporter.report(
                Check::MissingResource,
                format!("No audit log found for version {}", version_id),
            )?;
            if let Some(document_guid) = document_guid {
                self.record_version_without_log(document_guid, version_id, &mut reporter)
                    .await?;
            }
            return Ok(ImportReport::skipped(document_guid, version_id, &reporter));
        };

        let Some(document_guid) = document_guid else {
            reporter.report(
                Check::MissingIdentifier,
                format!(
                    "Version {} has no document GUID; its audit log cannot be attached to a history",
                    version_id
                ),
            )?;
            return Ok(ImportReport::skipped(None, version_id, &reporter));
        };

        let log = {
            let mut source = JsonLogReader::open(log_path)?;
            read_log(&mut source, &mut reporter)?
        };
        debug!("Read {} audit log entries from {}", log.entries.len(), log_path.display());
        self.merge_log(document_guid, version_id, log, reporter).await
    }

    /// Import from any log source, e.g. entries already parsed in memory.
    pub async fn import_source(
        &self,
        document_guid: Uuid,
        version_id: i64,
        source: &mut (dyn LogSource + Send),
    ) -> Result<ImportReport, AuditLogError> {
        let mut reporter = IntegrityReporter::new(self.level);
        let log = read_log(source, &mut reporter)?;
        self.merge_log(document_guid, version_id, log, reporter).await
    }

    async fn record_version_without_log(
        &self,
        document_guid: Uuid,
        version_id: i64,
        reporter: &mut IntegrityReporter,
    ) -> Result<(), AuditLogError> {
        let mut tx = self.database.pool().begin().await?;
        if !claim_version(&mut tx, document_guid, version_id, reporter).await? {
            tx.rollback().await?;
            return Ok(());
        }
        // An earlier import keeps its pointer and recorded digest
        let imported = Queries::get_document_version(&mut tx, version_id)
            .await?
            .is_some_and(|v| v.status == VersionStatus::Imported);
        if !imported {
            Queries::mark_version_imported(&mut tx, version_id, None).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn merge_log(
        &self,
        document_guid: Uuid,
        version_id: i64,
        log: ParsedLog,
        mut reporter: IntegrityReporter,
    ) -> Result<ImportReport, AuditLogError> {
        let lock = self.document_lock(document_guid);
        let merged = {
            let _guard = lock.lock().await;
            self.merge_with_retry(document_guid, version_id, &log, &mut reporter)
                .await
        };
        self.release_document_lock(document_guid, lock);
        let (outcome, attempt) = merged?;

        let mut report = ImportReport {
            document_guid: Some(document_guid),
            version_id,
            entries_read: log.entries.len(),
            malformed_entries: log.malformed,
            hash_failures: log.chain.hash_failures,
            missing_hashes: log.chain.missing_hashes,
            merge_attempts: attempt,
            ..Default::default()
        };
        match outcome {
            MergeOutcome::Merged { persisted, reused, root_digest_valid } => {
                report.entries_persisted = persisted;
                report.entries_reused = reused;
                report.root_digest_valid = root_digest_valid;
                info!(
                    "Imported audit log for version {} of document {}: {} new entries, {} reused",
                    version_id, document_guid, persisted, reused
                );
            }
            MergeOutcome::Skipped => {
                report.skipped = true;
                info!("Audit log for version {} was not merged", version_id);
            }
            MergeOutcome::Diverged => {
                report.skipped = true;
                warn!(
                    "Audit log for version {} diverges from the stored history of document {}; not merged",
                    version_id, document_guid
                );
            }
            MergeOutcome::Retained => {
                report.skipped = true;
                warn!(
                    "Audit log for version {} conflicts with what is already stored for it; kept the stored history",
                    version_id
                );
            }
        }
        report.warnings = reporter.summary();
        Ok(report)
    }

    /// Run merge attempts until one completes, under the document lock.
    async fn merge_with_retry(
        &self,
        document_guid: Uuid,
        version_id: i64,
        log: &ParsedLog,
        reporter: &mut IntegrityReporter,
    ) -> Result<(MergeOutcome, u32), AuditLogError> {
        let mut attempt: u32 = 0;
        let outcome = loop {
            attempt += 1;
            let mut attempt_reporter = reporter.clone();
            match self
                .merge_once(document_guid, version_id, log, &mut attempt_reporter)
                .await
            {
                Ok(outcome) => {
                    *reporter = attempt_reporter;
                    break outcome;
                }
                Err(e) if e.is_retryable() && attempt < self.max_merge_attempts => {
                    warn!(
                        "Audit log merge for document {} conflicted (attempt {} of {}): {}",
                        document_guid, attempt, self.max_merge_attempts, e
                    );
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(e) if e.is_retryable() => {
                    return Err(AuditLogError::retries_exhausted(attempt, &e));
                }
                Err(e) => return Err(e),
            }
        };

        if matches!(outcome, MergeOutcome::Diverged) {
            self.record_version_without_log(document_guid, version_id, reporter)
                .await?;
        }
        Ok((outcome, attempt))
    }

    /// One merge attempt in its own transaction.
    async fn merge_once(
        &self,
        document_guid: Uuid,
        version_id: i64,
        log: &ParsedLog,
        reporter: &mut IntegrityReporter,
    ) -> Result<MergeOutcome, AuditLogError> {
        let mut tx = self.database.pool().begin().await?;
        match merge_in_transaction(&mut tx, document_guid, version_id, log, reporter).await {
            Ok(outcome @ (MergeOutcome::Diverged | MergeOutcome::Retained)) => {
                tx.rollback().await?;
                Ok(outcome)
            }
            Ok(outcome) => {
                tx.commit().await?;
                Ok(outcome)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("Failed to roll back audit log merge: {}", rollback_err);
                }
                Err(e)
            }
        }
    }
}

async fn merge_in_transaction(
    conn: &mut SqliteConnection,
    document_guid: Uuid,
    version_id: i64,
    log: &ParsedLog,
    reporter: &mut IntegrityReporter,
) -> Result<MergeOutcome, AuditLogError> {
    if !claim_version(conn, document_guid, version_id, reporter).await? {
        return Ok(MergeOutcome::Retained);
    }
    let mut tree = load_tree(conn, document_guid).await?;

    let other_versions = Queries::count_other_imported_versions(conn, &document_guid, version_id).await?;
    if other_versions > 0 && tree.tree_size() <= 1 {
        reporter.report(
            Check::NoSharedHistory,
            format!(
                "Document {} already has {} imported versions without audit log history; \
                 version {} has nothing to attach to",
                document_guid, other_versions, version_id
            ),
        )?;
        Queries::mark_version_imported(conn, version_id, None).await?;
        return Ok(MergeOutcome::Skipped);
    }

    if log.entries.is_empty() {
        debug!("Audit log for version {} has no entries", version_id);
        Queries::mark_version_imported(conn, version_id, None).await?;
        return Ok(MergeOutcome::Merged {
            persisted: 0,
            reused: 0,
            root_digest_valid: None,
        });
    }

    let counts = merge_entries(conn, &mut tree, version_id, &log.entries, reporter).await?;
    if counts.diverged {
        return Ok(MergeOutcome::Diverged);
    }
    if counts.rewrites_version {
        return Ok(MergeOutcome::Retained);
    }

    verify_reused_entries(conn, &counts.reused_entry_ids, reporter).await?;

    let verification = VerificationResult::from_chain(
        &log.chain,
        log.computed_root_digest.clone(),
        log.declared_root_digest.clone(),
    );
    verification.report_root_digest(reporter)?;

    // Adopted hashes differ from what the file declared, so its digest no longer describes the path
    let recorded_digest = log
        .declared_root_digest
        .as_deref()
        .filter(|_| verification.root_digest_valid() == Some(true) && log.chain.missing_hashes == 0);
    Queries::mark_version_imported(conn, version_id, recorded_digest).await?;

    Ok(MergeOutcome::Merged {
        persisted: counts.persisted,
        reused: counts.reused_entry_ids.len(),
        root_digest_valid: verification.root_digest_valid(),
    })
}

/// Walk `entries` (oldest first) down `tree`, persisting the ones not yet present,
/// and point `version_id` at the last one.
///
/// `tree` must reflect the store as seen by `conn`; a stale tree surfaces as a
/// concurrent modification when an insert collides with an existing entry.
pub(crate) async fn merge_entries(
    conn: &mut SqliteConnection,
    tree: &mut VersionTree,
    version_id: i64,
    entries: &[HashChainEntry],
    reporter: &mut IntegrityReporter,
) -> Result<MergeCounts, AuditLogError> {
    let document_guid = tree.document_guid();
    let mut counts = MergeCounts::default();
    let mut pointer = tree.root();

    for entry in entries {
        if let Some(child) = tree.child_by_hash(pointer, &entry.entry_hash) {
            counts.reused_entry_ids.push(tree.node(child).entry_id);
            pointer = child;
            continue;
        }

        if let Some(existing) = tree.find_by_hash(&entry.entry_hash) {
            let existing_parent = tree
                .node(existing)
                .parent
                .map(|p| tree.node(p).entry_hash.clone())
                .unwrap_or_default();
            reporter.report(
                Check::DivergentHistory,
                format!(
                    "Audit log entry {} of version {} already exists in document {} under parent {}, not {}",
                    short_hash(&entry.entry_hash),
                    version_id,
                    document_guid,
                    short_hash(&existing_parent),
                    short_hash(&tree.node(pointer).entry_hash)
                ),
            )?;
            counts.diverged = true;
            return Ok(counts);
        }

        let at_root = tree.node(pointer).is_root();
        if at_root && tree.node(pointer).child_count() > 0 {
            reporter.report(
                Check::DivergentHistory,
                format!(
                    "Version {} starts a history for document {} that shares no entries with the stored one",
                    version_id, document_guid
                ),
            )?;
        }

        let mut new_entry = entry.clone();
        new_entry.parent_entry_hash = (!at_root).then(|| tree.node(pointer).entry_hash.clone());
        let entry_id = Queries::insert_entry(conn, &document_guid, &new_entry).await?;
        pointer = tree.add_child(pointer, entry_id, &new_entry.entry_hash);
        counts.persisted += 1;
    }

    // Moving the pointer anywhere but further down would strand the old branch
    if let Some(previous) = tree.version_terminal(version_id) {
        if !tree.path_to(pointer).contains(&previous) {
            reporter.report(
                Check::DivergentHistory,
                format!(
                    "Version {} of document {} was imported with a history ending at {}, which this log does not extend",
                    version_id,
                    document_guid,
                    short_hash(&tree.node(previous).entry_hash)
                ),
            )?;
            counts.rewrites_version = true;
            return Ok(counts);
        }
    }

    tree.tag_version(pointer, version_id);
    Queries::upsert_version_pointer(conn, version_id, tree.node(pointer).entry_id).await?;
    Ok(counts)
}

/// Register `version_id` under `document_guid`.
///
/// Returns false when the version already belongs to another document and the
/// policy tolerates it.
async fn claim_version(
    conn: &mut SqliteConnection,
    document_guid: Uuid,
    version_id: i64,
    reporter: &mut IntegrityReporter,
) -> Result<bool, AuditLogError> {
    let registered = Queries::register_version(conn, version_id, &document_guid).await?;
    if registered == document_guid {
        return Ok(true);
    }
    reporter.report(
        Check::DivergentHistory,
        format!(
            "Version {} already belongs to document {}, not {}",
            version_id, registered, document_guid
        ),
    )?;
    Ok(false)
}

/// Re-hash stored entries the log walked through without persisting.
async fn verify_reused_entries(
    conn: &mut SqliteConnection,
    entry_ids: &[i64],
    reporter: &mut IntegrityReporter,
) -> Result<(), AuditLogError> {
    if entry_ids.is_empty() {
        return Ok(());
    }
    let stored = Queries::fetch_entries(conn, entry_ids).await?;
    let tampered: Vec<&HashChainEntry> = stored.iter().filter(|e| !verify_entry(e)).collect();
    if let Some(first) = tampered.first() {
        reporter.report(
            Check::HashMismatch,
            format!(
                "Stored audit log entry {} no longer matches its hash ({} of {} reused entries affected)",
                first.summary(),
                tampered.len(),
                stored.len()
            ),
        )?;
    }
    Ok(())
}

/// Pull every entry from `source`, then verify the chain oldest first.
fn read_log(
    source: &mut (dyn LogSource + Send),
    reporter: &mut IntegrityReporter,
) -> Result<ParsedLog, AuditLogError> {
    let mut entries = Vec::new();
    let mut digest = RootDigest::new();
    let mut malformed = 0;

    while let Some(next) = source.next_entry() {
        match next {
            Ok(entry) => {
                digest.update(&entry.entry_hash);
                entries.push(entry);
            }
            Err(SourceError::Malformed(reason)) => {
                reporter.report(Check::MalformedEntry, format!("Skipping malformed audit log entry: {}", reason))?;
                malformed += 1;
            }
            Err(SourceError::Stream(e)) => return Err(e),
        }
    }
    let declared_root_digest = source.declared_root_digest().map(str::to_string);

    entries.reverse();
    let chain = verify_chain(&mut entries, reporter)?;

    Ok(ParsedLog {
        entries,
        malformed,
        computed_root_digest: digest.finalize(),
        declared_root_digest,
        chain,
    })
}

fn has_content(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::{link_chain, AuditLogMessage};
    use crate::audit::policy::IntegrityLevel;
    use crate::audit::source::MemoryLogSource;
    use crate::database::Database;
    use chrono::{Duration, FixedOffset, TimeZone};

    fn chain(len: usize) -> Vec<HashChainEntry> {
        let start = FixedOffset::west_opt(5 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 6, 3, 10, 0, 0)
            .unwrap();
        let mut entries: Vec<HashChainEntry> = (0..len)
            .map(|i| {
                HashChainEntry::new(
                    "operator",
                    "24.1",
                    start + Duration::minutes(i as i64 * 7),
                    None,
                    vec![AuditLogMessage::new(0, "modified", format!("Change {}", i))],
                )
            })
            .collect();
        link_chain(&mut entries);
        entries
    }

    fn newest_first(entries: &[HashChainEntry]) -> Vec<HashChainEntry> {
        entries.iter().rev().cloned().collect()
    }

    #[tokio::test]
    async fn test_stale_tree_insert_is_a_concurrent_modification() {
        let database = Database::new_in_memory().await.unwrap();
        let service = AuditLogService::new(database.clone(), IntegrityLevel::Strict);
        let guid = Uuid::new_v4();
        let entries = chain(2);

        let mut stale = service.build_tree(guid).await.unwrap();

        let mut source = MemoryLogSource::new(newest_first(&entries), None);
        let mut reporter = IntegrityReporter::new(IntegrityLevel::WarnOnly);
        let log = read_log(&mut source, &mut reporter).unwrap();
        let mut conn = database.pool().acquire().await.unwrap();
        Queries::register_version(&mut conn, 1, &guid).await.unwrap();
        let mut fresh = load_tree(&mut conn, guid).await.unwrap();
        merge_entries(&mut conn, &mut fresh, 1, &log.entries, &mut reporter)
            .await
            .unwrap();

        let err = merge_entries(&mut conn, &mut stale, 2, &log.entries, &mut reporter)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, AuditLogError::ConcurrentModification(_)));
    }

    #[tokio::test]
    async fn test_import_source_reports_counts() {
        let database = Database::new_in_memory().await.unwrap();
        let service = AuditLogService::new(database, IntegrityLevel::Strict);
        let guid = Uuid::new_v4();
        let entries = chain(3);
        let hashes: Vec<&str> = entries.iter().rev().map(|e| e.entry_hash.as_str()).collect();
        let root = crate::audit::verify::compute_root_digest(hashes);

        let mut source = MemoryLogSource::new(newest_first(&entries), Some(root));
        let report = service.import_source(guid, 7, &mut source).await.unwrap();
        assert_eq!(report.entries_read, 3);
        assert_eq!(report.entries_persisted, 3);
        assert_eq!(report.root_digest_valid, Some(true));
        assert_eq!(report.merge_attempts, 1);
        assert!(!report.skipped);

        // No footer this time, which only a tolerant level accepts
        let relaxed = AuditLogService::new(service.database().clone(), IntegrityLevel::WarnOnly);
        let mut source = MemoryLogSource::new(newest_first(&entries[..2]), None);
        let report = relaxed.import_source(guid, 8, &mut source).await.unwrap();
        assert_eq!(report.entries_persisted, 0);
        assert_eq!(report.entries_reused, 2);
        assert_eq!(report.root_digest_valid, None);
    }

    #[tokio::test]
    async fn test_malformed_entries_are_policy_gated() {
        let database = Database::new_in_memory().await.unwrap();
        let guid = Uuid::new_v4();
        let entries = chain(1);
        let results = vec![
            Err(SourceError::Malformed("line 1: entry has no user name".to_string())),
            Ok(entries[0].clone()),
        ];

        let strict = AuditLogService::new(database.clone(), IntegrityLevel::Strict);
        let mut source = MemoryLogSource::from_results(results, None);
        assert!(matches!(
            strict.import_source(guid, 1, &mut source).await,
            Err(AuditLogError::Parse(_))
        ));

        let relaxed = AuditLogService::new(database, IntegrityLevel::WarnOnly);
        let results = vec![
            Err(SourceError::Malformed("line 1: entry has no user name".to_string())),
            Ok(entries[0].clone()),
        ];
        let mut source = MemoryLogSource::from_results(results, None);
        let report = relaxed.import_source(guid, 1, &mut source).await.unwrap();
        assert_eq!(report.malformed_entries, 1);
        assert_eq!(report.entries_persisted, 1);
    }

    #[tokio::test]
    async fn test_stream_error_is_fatal_even_when_tolerant() {
        let database = Database::new_in_memory().await.unwrap();
        let service = AuditLogService::new(database, IntegrityLevel::WarnOnly);
        let guid = Uuid::new_v4();
        let results = vec![Err(SourceError::Stream(AuditLogError::Parse("truncated".to_string())))];
        let mut source = MemoryLogSource::from_results(results, None);

        assert!(service.import_source(guid, 1, &mut source).await.is_err());
        assert_eq!(service.build_tree(guid).await.unwrap().tree_size(), 1);
    }
}
