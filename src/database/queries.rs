use chrono::DateTime;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use std::collections::HashMap;
use uuid::Uuid;

use crate::audit::entry::{AuditLogMessage, HashChainEntry};
use crate::audit::tree::NULL_SENTINEL;
use crate::database::models::*;
use crate::error::AuditLogError;

/// Upper bound on ids bound into a single IN clause.
const ID_CHUNK: usize = 500;

pub struct Queries;

impl Queries {
    /// Record a document version and return the document it belongs to.
    ///
    /// An existing registration is left untouched, so a version never moves
    /// to another document.
    pub async fn register_version(
        conn: &mut SqliteConnection,
        version_id: i64,
        document_guid: &Uuid,
    ) -> Result<Uuid, AuditLogError> {
        sqlx::query(
            r#"
            INSERT INTO document_versions (version_id, document_guid, status)
            VALUES (?, ?, 'pending')
            ON CONFLICT (version_id) DO NOTHING
            "#,
        )
        .bind(version_id)
        .bind(document_guid.to_string())
        .execute(&mut *conn)
        .await?;

        Self::document_guid_for_version(conn, version_id)
            .await?
            .ok_or_else(|| {
                AuditLogError::DatabaseError(format!("Version {} vanished while registering it", version_id))
            })
    }

    pub async fn mark_version_imported(
        conn: &mut SqliteConnection,
        version_id: i64,
        root_digest: Option<&str>,
    ) -> Result<(), AuditLogError> {
        sqlx::query("UPDATE document_versions SET status = ?, root_digest = ? WHERE version_id = ?")
            .bind(VersionStatus::Imported.as_str())
            .bind(root_digest)
            .bind(version_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn get_document_version(
        conn: &mut SqliteConnection,
        version_id: i64,
    ) -> Result<Option<DocumentVersion>, AuditLogError> {
        let row = sqlx::query(
            "SELECT version_id, document_guid, status, root_digest FROM document_versions WHERE version_id = ?",
        )
        .bind(version_id)
        .fetch_optional(&mut *conn)
        .await?;

        row.map(|row| document_version_from_row(&row)).transpose()
    }

    pub async fn list_versions(
        conn: &mut SqliteConnection,
        document_guid: &Uuid,
    ) -> Result<Vec<DocumentVersion>, AuditLogError> {
        let rows = sqlx::query(
            r#"
            SELECT version_id, document_guid, status, root_digest
            FROM document_versions
            WHERE document_guid = ?
            ORDER BY version_id
            "#,
        )
        .bind(document_guid.to_string())
        .fetch_all(&mut *conn)
        .await?;

        rows.iter().map(document_version_from_row).collect()
    }

    pub async fn document_guid_for_version(
        conn: &mut SqliteConnection,
        version_id: i64,
    ) -> Result<Option<Uuid>, AuditLogError> {
        let guid: Option<String> =
            sqlx::query_scalar("SELECT document_guid FROM document_versions WHERE version_id = ?")
                .bind(version_id)
                .fetch_optional(&mut *conn)
                .await?;

        guid.map(|g| {
            Uuid::parse_str(&g).map_err(|e| {
                AuditLogError::DatabaseError(format!(
                    "Version {} has an invalid document GUID {}: {}",
                    version_id, g, e
                ))
            })
        })
        .transpose()
    }

    /// Versions of the document, other than `version_id`, whose import completed.
    pub async fn count_other_imported_versions(
        conn: &mut SqliteConnection,
        document_guid: &Uuid,
        version_id: i64,
    ) -> Result<i64, AuditLogError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM document_versions
            WHERE document_guid = ? AND version_id <> ? AND status = ?
            "#,
        )
        .bind(document_guid.to_string())
        .bind(version_id)
        .bind(VersionStatus::Imported.as_str())
        .fetch_one(&mut *conn)
        .await?;
        Ok(count)
    }

    pub async fn delete_version_registration(
        conn: &mut SqliteConnection,
        version_id: i64,
    ) -> Result<(), AuditLogError> {
        sqlx::query("DELETE FROM document_versions WHERE version_id = ?")
            .bind(version_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Insert an entry and its messages; returns the new surrogate key.
    ///
    /// A second row for the same (document, hash) violates the unique constraint.
    pub async fn insert_entry(
        conn: &mut SqliteConnection,
        document_guid: &Uuid,
        entry: &HashChainEntry,
    ) -> Result<i64, AuditLogError> {
        let result = sqlx::query(
            r#"
            INSERT INTO audit_log_entries
            (document_guid, entry_hash, parent_entry_hash, create_timestamp, timezone_offset_minutes,
             user_name, format_version, reason, extra_info, document_format_version)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(document_guid.to_string())
        .bind(&entry.entry_hash)
        .bind(entry.stored_parent_hash())
        .bind(entry.create_timestamp.to_rfc3339())
        .bind(entry.timezone_offset_minutes())
        .bind(&entry.user_name)
        .bind(&entry.format_version)
        .bind(&entry.reason)
        .bind(&entry.extra_info)
        .bind(entry.document_format_version)
        .execute(&mut *conn)
        .await?;

        let entry_id = result.last_insert_rowid();

        for message in &entry.messages {
            sqlx::query(
                r#"
                INSERT INTO audit_log_messages
                (entry_id, order_number, message_type, en_text, expanded_text, reason)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(entry_id)
            .bind(message.order_number)
            .bind(&message.message_type)
            .bind(&message.en_text)
            .bind(&message.expanded_text)
            .bind(&message.reason)
            .execute(&mut *conn)
            .await?;
        }

        Ok(entry_id)
    }

    /// Point a version at its terminal entry, replacing any previous pointer.
    pub async fn upsert_version_pointer(
        conn: &mut SqliteConnection,
        version_id: i64,
        entry_id: i64,
    ) -> Result<(), AuditLogError> {
        sqlx::query(
            r#"
            INSERT INTO version_audit_log_entries (version_id, entry_id)
            VALUES (?, ?)
            ON CONFLICT (version_id) DO UPDATE SET entry_id = excluded.entry_id
            "#,
        )
        .bind(version_id)
        .bind(entry_id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn delete_version_pointer(
        conn: &mut SqliteConnection,
        version_id: i64,
    ) -> Result<u64, AuditLogError> {
        let result = sqlx::query("DELETE FROM version_audit_log_entries WHERE version_id = ?")
            .bind(version_id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }

    /// Every entry of the document reachable from the root sentinel, by depth.
    pub async fn fetch_tree_rows(
        conn: &mut SqliteConnection,
        document_guid: &Uuid,
    ) -> Result<Vec<TreeRow>, AuditLogError> {
        let guid = document_guid.to_string();
        let rows = sqlx::query(
            r#"
            WITH RECURSIVE tree(entry_id, entry_hash, parent_entry_hash, depth) AS (
                SELECT entry_id, entry_hash, parent_entry_hash, 1
                FROM audit_log_entries
                WHERE document_guid = ? AND parent_entry_hash = ?
                UNION ALL
                SELECT e.entry_id, e.entry_hash, e.parent_entry_hash, t.depth + 1
                FROM audit_log_entries e
                JOIN tree t ON t.entry_hash = e.parent_entry_hash
                WHERE e.document_guid = ?
            )
            SELECT entry_id, entry_hash, parent_entry_hash, depth
            FROM tree
            ORDER BY depth, entry_id
            "#,
        )
        .bind(&guid)
        .bind(NULL_SENTINEL)
        .bind(&guid)
        .fetch_all(&mut *conn)
        .await?;

        rows.iter()
            .map(|row| -> Result<TreeRow, AuditLogError> {
                Ok(TreeRow {
                    entry_id: row.try_get("entry_id")?,
                    entry_hash: row.try_get("entry_hash")?,
                    parent_entry_hash: row.try_get("parent_entry_hash")?,
                    depth: row.try_get("depth")?,
                })
            })
            .collect()
    }

    pub async fn fetch_version_pointers(
        conn: &mut SqliteConnection,
        document_guid: &Uuid,
    ) -> Result<Vec<VersionPointerRow>, AuditLogError> {
        let rows = sqlx::query(
            r#"
            SELECT v.version_id, v.entry_id
            FROM version_audit_log_entries v
            JOIN audit_log_entries e ON e.entry_id = v.entry_id
            WHERE e.document_guid = ?
            ORDER BY v.version_id
            "#,
        )
        .bind(document_guid.to_string())
        .fetch_all(&mut *conn)
        .await?;

        rows.iter()
            .map(|row| -> Result<VersionPointerRow, AuditLogError> {
                Ok(VersionPointerRow {
                    version_id: row.try_get("version_id")?,
                    entry_id: row.try_get("entry_id")?,
                })
            })
            .collect()
    }

    /// Full entries with their messages, in the order of `entry_ids`.
    pub async fn fetch_entries(
        conn: &mut SqliteConnection,
        entry_ids: &[i64],
    ) -> Result<Vec<HashChainEntry>, AuditLogError> {
        let mut by_id: HashMap<i64, HashChainEntry> = HashMap::with_capacity(entry_ids.len());

        for chunk in entry_ids.chunks(ID_CHUNK) {
            let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
                r#"SELECT entry_id, document_guid, entry_hash, parent_entry_hash, create_timestamp,
                   user_name, format_version, reason, extra_info, document_format_version
                   FROM audit_log_entries WHERE entry_id IN ("#,
            );
            push_id_list(&mut query, chunk);
            for row in query.build().fetch_all(&mut *conn).await? {
                let entry = entry_from_row(&row)?;
                by_id.insert(entry.entry_id.unwrap_or_default(), entry);
            }

            let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
                r#"SELECT entry_id, order_number, message_type, en_text, expanded_text, reason
                   FROM audit_log_messages WHERE entry_id IN ("#,
            );
            push_id_list(&mut query, chunk);
            // Hashes cover messages in the order the log listed them
            query.push(" ORDER BY entry_id, message_id");
            for row in query.build().fetch_all(&mut *conn).await? {
                let entry_id: i64 = row.try_get("entry_id")?;
                if let Some(entry) = by_id.get_mut(&entry_id) {
                    entry.messages.push(AuditLogMessage {
                        order_number: row.try_get("order_number")?,
                        message_type: row.try_get("message_type")?,
                        en_text: row.try_get("en_text")?,
                        expanded_text: row.try_get("expanded_text")?,
                        reason: row.try_get("reason")?,
                    });
                }
            }
        }

        Ok(entry_ids
            .iter()
            .filter_map(|id| by_id.remove(id))
            .collect())
    }

    /// Delete entries together with their messages and any version pointers at them.
    pub async fn delete_entries(
        conn: &mut SqliteConnection,
        entry_ids: &[i64],
    ) -> Result<u64, AuditLogError> {
        let mut deleted = 0;
        for chunk in entry_ids.chunks(ID_CHUNK) {
            for table in ["audit_log_messages", "version_audit_log_entries"] {
                let mut query: QueryBuilder<Sqlite> =
                    QueryBuilder::new(format!("DELETE FROM {} WHERE entry_id IN (", table));
                push_id_list(&mut query, chunk);
                query.build().execute(&mut *conn).await?;
            }

            let mut query: QueryBuilder<Sqlite> =
                QueryBuilder::new("DELETE FROM audit_log_entries WHERE entry_id IN (");
            push_id_list(&mut query, chunk);
            deleted += query.build().execute(&mut *conn).await?.rows_affected();
        }
        Ok(deleted)
    }
}

fn push_id_list(query: &mut QueryBuilder<'_, Sqlite>, ids: &[i64]) {
    let mut separated = query.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
}

fn document_version_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<DocumentVersion, AuditLogError> {
    let status: String = row.try_get("status")?;
    Ok(DocumentVersion {
        version_id: row.try_get("version_id")?,
        document_guid: row.try_get("document_guid")?,
        status: VersionStatus::parse(&status).ok_or_else(|| {
            AuditLogError::DatabaseError(format!("Unknown version status: {}", status))
        })?,
        root_digest: row.try_get("root_digest")?,
    })
}

fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<HashChainEntry, AuditLogError> {
    let timestamp: String = row.try_get("create_timestamp")?;
    let create_timestamp = DateTime::parse_from_rfc3339(&timestamp).map_err(|e| {
        AuditLogError::DatabaseError(format!("Invalid stored timestamp {}: {}", timestamp, e))
    })?;
    let guid: String = row.try_get("document_guid")?;
    let parent: String = row.try_get("parent_entry_hash")?;

    Ok(HashChainEntry {
        entry_id: Some(row.try_get("entry_id")?),
        document_guid: Uuid::parse_str(&guid).ok(),
        version_id: None,
        create_timestamp,
        user_name: row.try_get("user_name")?,
        format_version: row.try_get("format_version")?,
        reason: row.try_get("reason")?,
        extra_info: row.try_get("extra_info")?,
        messages: Vec::new(),
        entry_hash: row.try_get("entry_hash")?,
        parent_entry_hash: (parent != NULL_SENTINEL).then_some(parent),
        document_format_version: row.try_get("document_format_version")?,
    })
}
