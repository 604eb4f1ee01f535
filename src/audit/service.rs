//! Audit Log Service
//!
//! Explicit service value holding the store handle, the integrity level and
//! the merge retry settings. Imports, purges and read-only tree queries for a
//! document all go through it.

use sqlx::SqliteConnection;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::entry::HashChainEntry;
use crate::audit::policy::{IntegrityLevel, IntegrityReporter};
use crate::audit::source::LogFileWriter;
use crate::audit::tree::VersionTree;
use crate::audit::verify::{path_digest, verify_chain, VerificationResult};
use crate::config::AppConfig;
use crate::database::queries::Queries;
use crate::database::Database;
use crate::error::AuditLogError;

pub const DEFAULT_MAX_MERGE_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(20);

type DocumentLocks = Arc<Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>>;

#[derive(Clone)]
pub struct AuditLogService {
    pub(crate) database: Database,
    pub(crate) level: IntegrityLevel,
    pub(crate) max_merge_attempts: u32,
    pub(crate) retry_backoff: Duration,
    document_locks: DocumentLocks,
}

impl AuditLogService {
    pub fn new(database: Database, level: IntegrityLevel) -> Self {
        Self {
            database,
            level,
            max_merge_attempts: DEFAULT_MAX_MERGE_ATTEMPTS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            document_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_retry(mut self, max_merge_attempts: u32, retry_backoff: Duration) -> Self {
        self.max_merge_attempts = max_merge_attempts.max(1);
        self.retry_backoff = retry_backoff;
        self
    }

    /// Connect to the configured database and apply the schema.
    pub async fn from_config(config: &AppConfig) -> Result<Self, AuditLogError> {
        config.validate()?;
        let database = Database::new(&config.database_url).await?;
        database.run_migrations().await?;
        info!(
            "Audit log service ready (integrity level {}, {} merge attempts)",
            config.integrity_level, config.max_merge_attempts
        );
        Ok(Self::new(database, config.integrity_level()?)
            .with_retry(config.max_merge_attempts, config.retry_backoff()))
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn integrity_level(&self) -> IntegrityLevel {
        self.level
    }

    /// Record that `version_id` belongs to `document_guid` ahead of any import.
    ///
    /// Fails when the version is already registered under another document.
    pub async fn register_version(&self, document_guid: Uuid, version_id: i64) -> Result<(), AuditLogError> {
        let mut conn = self.database.pool().acquire().await?;
        let registered = Queries::register_version(&mut conn, version_id, &document_guid).await?;
        if registered != document_guid {
            return Err(AuditLogError::DivergentHistory(format!(
                "Version {} already belongs to document {}, not {}",
                version_id, registered, document_guid
            )));
        }
        Ok(())
    }

    /// Reconstruct the version tree of a document. Read-only.
    pub async fn build_tree(&self, document_guid: Uuid) -> Result<VersionTree, AuditLogError> {
        let mut conn = self.database.pool().acquire().await?;
        load_tree(&mut conn, document_guid).await
    }

    /// Re-verify the stored history of a version.
    ///
    /// Every entry on the version's path is re-hashed against its stored
    /// parent, and the path's root digest is compared with the digest recorded
    /// when the version was imported. Hash failures go through the integrity
    /// policy.
    pub async fn verify_version(&self, version_id: i64) -> Result<VerificationResult, AuditLogError> {
        let (declared_root_digest, mut entries) = self.version_entries(version_id).await?;

        let mut reporter = IntegrityReporter::new(self.level);
        let chain = verify_chain(&mut entries, &mut reporter)?;
        let hashes: Vec<&str> = entries.iter().map(|e| e.entry_hash.as_str()).collect();
        let result = VerificationResult::from_chain(&chain, path_digest(&hashes), declared_root_digest);
        if result.declared_root_digest.is_some() {
            result.report_root_digest(&mut reporter)?;
        }

        debug!("Verified version {}: {}", version_id, result.summary());
        Ok(result)
    }

    /// Write the stored history of a version as a log file and return its root digest.
    pub async fn export_version_log(&self, version_id: i64, path: &Path) -> Result<String, AuditLogError> {
        let (_, entries) = self.version_entries(version_id).await?;
        let document_format_version = entries.first().and_then(|e| e.document_format_version);
        LogFileWriter::write_chain(path, &entries, document_format_version)
    }

    /// Recorded root digest and stored entries (oldest first) of a version.
    async fn version_entries(
        &self,
        version_id: i64,
    ) -> Result<(Option<String>, Vec<HashChainEntry>), AuditLogError> {
        let mut conn = self.database.pool().acquire().await?;
        let version = Queries::get_document_version(&mut conn, version_id)
            .await?
            .ok_or_else(|| {
                AuditLogError::MissingIdentifier(format!("Unknown document version {}", version_id))
            })?;
        let document_guid = Uuid::parse_str(&version.document_guid).map_err(|e| {
            AuditLogError::MissingIdentifier(format!(
                "Version {} has an invalid document GUID {}: {}",
                version_id, version.document_guid, e
            ))
        })?;

        let tree = load_tree(&mut conn, document_guid).await?;
        let entry_ids: Vec<i64> = tree
            .version_path(version_id)
            .unwrap_or_default()
            .into_iter()
            .skip(1)
            .map(|id| tree.node(id).entry_id)
            .collect();
        let entries = Queries::fetch_entries(&mut conn, &entry_ids).await?;
        Ok((version.root_digest, entries))
    }

    /// In-process lock serialising merges and purges of one document.
    pub(crate) fn document_lock(&self, document_guid: Uuid) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .document_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(document_guid).or_default().clone()
    }

    /// Forget the lock of a document once no other task holds or awaits it.
    ///
    /// Call after the guard taken from `lock` has been dropped.
    pub(crate) fn release_document_lock(&self, document_guid: Uuid, lock: Arc<AsyncMutex<()>>) {
        let mut locks = self
            .document_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // One reference in the map, one in `lock`
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&document_guid);
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_document_locks(&self) -> usize {
        self.document_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// Rebuild a document's tree on the given connection.
pub(crate) async fn load_tree(
    conn: &mut SqliteConnection,
    document_guid: Uuid,
) -> Result<VersionTree, AuditLogError> {
    let rows = Queries::fetch_tree_rows(conn, &document_guid).await?;
    let pointers = Queries::fetch_version_pointers(conn, &document_guid).await?;
    Ok(VersionTree::from_rows(document_guid, rows, pointers))
}
