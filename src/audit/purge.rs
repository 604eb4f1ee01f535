//! Version Purge
//!
//! Removes one version's contribution to its document's tree. Only entries no
//! other version's history passes through are deleted.

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::entry::short_hash;
use crate::audit::service::{load_tree, AuditLogService};
use crate::database::queries::Queries;
use crate::error::AuditLogError;

impl AuditLogService {
    /// Delete the audit log of `version_id` and return the number of entries removed.
    ///
    /// Unknown versions are a no-op. Shared history stays in place; the
    /// version's pointer and registration are always removed.
    pub async fn delete_version_log(&self, version_id: i64) -> Result<usize, AuditLogError> {
        let document_guid = {
            let mut conn = self.database.pool().acquire().await?;
            Queries::document_guid_for_version(&mut conn, version_id).await?
        };
        let Some(document_guid) = document_guid else {
            debug!("Version {} has no document; nothing to delete", version_id);
            return Ok(0);
        };

        let lock = self.document_lock(document_guid);
        let result = {
            let _guard = lock.lock().await;
            self.purge_version(document_guid, version_id).await
        };
        self.release_document_lock(document_guid, lock);
        result
    }

    async fn purge_version(&self, document_guid: Uuid, version_id: i64) -> Result<usize, AuditLogError> {
        let mut tx = self.database.pool().begin().await?;
        let tree = load_tree(&mut tx, document_guid).await?;

        for leaf in tree.dangling_leaves() {
            let node = tree.node(leaf);
            warn!(
                "Audit log entry {} ({}) of document {} is a leaf no version points at",
                node.entry_id,
                short_hash(&node.entry_hash),
                document_guid
            );
        }

        let entry_ids: Vec<i64> = tree
            .exclusive_nodes(version_id)
            .into_iter()
            .map(|id| tree.node(id).entry_id)
            .collect();

        let deleted = if entry_ids.is_empty() {
            debug!(
                "Version {} shares all of its history with other versions of {}",
                version_id, document_guid
            );
            0
        } else {
            Queries::delete_entries(&mut tx, &entry_ids).await?
        };
        Queries::delete_version_pointer(&mut tx, version_id).await?;
        Queries::delete_version_registration(&mut tx, version_id).await?;
        tx.commit().await?;

        info!(
            "Deleted audit log of version {}: {} entries removed, document {} keeps {}",
            version_id,
            deleted,
            document_guid,
            tree.tree_size() - deleted as usize
        );
        Ok(deleted as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::{link_chain, AuditLogMessage, HashChainEntry};
    use crate::audit::policy::IntegrityLevel;
    use crate::audit::source::MemoryLogSource;
    use crate::database::Database;
    use chrono::{Duration, FixedOffset, TimeZone};

    fn history(labels: &[&str]) -> Vec<HashChainEntry> {
        let start = FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 2, 1, 12, 0, 0)
            .unwrap();
        let mut entries: Vec<HashChainEntry> = labels
            .iter()
            .enumerate()
            .map(|(i, label)| {
                HashChainEntry::new(
                    "curator",
                    "24.1",
                    start + Duration::minutes(i as i64),
                    None,
                    vec![AuditLogMessage::new(0, "modified", *label)],
                )
            })
            .collect();
        link_chain(&mut entries);
        entries.reverse();
        entries
    }

    #[tokio::test]
    async fn test_unknown_version_is_a_no_op() {
        let database = Database::new_in_memory().await.unwrap();
        let service = AuditLogService::new(database, IntegrityLevel::Strict);
        assert_eq!(service.delete_version_log(404).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_branch_purge_keeps_shared_prefix() {
        let database = Database::new_in_memory().await.unwrap();
        let service = AuditLogService::new(database, IntegrityLevel::WarnOnly);
        let guid = Uuid::new_v4();

        let mut a = MemoryLogSource::new(history(&["base", "left"]), None);
        let mut b = MemoryLogSource::new(history(&["base", "right"]), None);
        service.import_source(guid, 1, &mut a).await.unwrap();
        service.import_source(guid, 2, &mut b).await.unwrap();
        assert_eq!(service.build_tree(guid).await.unwrap().tree_size(), 4);

        assert_eq!(service.delete_version_log(2).await.unwrap(), 1);
        let tree = service.build_tree(guid).await.unwrap();
        assert_eq!(tree.tree_size(), 3);
        assert!(tree.version_terminal(2).is_none());
        assert!(tree.version_terminal(1).is_some());
    }
}
