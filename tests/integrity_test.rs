//! Audit Log Integrity Tests
//!
//! Tampering with log files or with stored entries, and the root digest
//! recorded for each imported version.

mod common;

use audit_tree::audit::{AuditLogService, IntegrityLevel};
use audit_tree::error::AuditLogError;
use common::*;
use tempfile::TempDir;
use uuid::Uuid;

async fn tamper_stored_entry(service: &AuditLogService, entry_hash: &str) {
    sqlx::query("UPDATE audit_log_entries SET user_name = 'mallory' WHERE entry_hash = ?")
        .bind(entry_hash)
        .execute(service.database().pool())
        .await
        .expect("Failed to tamper with stored entry");
}

#[tokio::test]
async fn test_stored_root_digest_matches_declared() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let service = setup_service(IntegrityLevel::Strict).await;
    let guid = Uuid::new_v4();
    let (v1, root1) = write_log(&dir, "v1", &["a", "b"]);
    let (v2, root2) = write_log(&dir, "v2", &["a", "b", "c", "d"]);

    service.import_log(Some(guid), 1, Some(&v1)).await?;
    service.import_log(Some(guid), 2, Some(&v2)).await?;

    for (version, declared) in [(1, root1), (2, root2)] {
        let result = service.verify_version(version).await?;
        assert_eq!(result.computed_root_digest, declared);
        assert_eq!(result.root_digest_valid(), Some(true));
        assert!(result.is_valid(), "{}", result.summary());
    }
    Ok(())
}

#[tokio::test]
async fn test_tampered_stored_entry_is_detected() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let guid = Uuid::new_v4();
    let (v1, _) = write_log(&dir, "v1", &["a", "b"]);
    let (v2, _) = write_log(&dir, "v2", &["a", "b", "c"]);

    let service = setup_service(IntegrityLevel::HashRequired).await;
    service.import_log(Some(guid), 1, Some(&v1)).await?;
    tamper_stored_entry(&service, &hash_of(&["a"])).await;

    assert!(matches!(
        service.verify_version(1).await,
        Err(AuditLogError::HashMismatch(_))
    ));

    // Importing through the tampered entry fails and leaves the tree as it was
    assert!(matches!(
        service.import_log(Some(guid), 2, Some(&v2)).await,
        Err(AuditLogError::HashMismatch(_))
    ));
    assert_eq!(service.build_tree(guid).await?.tree_size(), 3);

    let tolerant = AuditLogService::new(service.database().clone(), IntegrityLevel::WarnOnly);
    let result = tolerant.verify_version(1).await?;
    assert_eq!(result.hash_failures, 1);
    assert!(!result.is_valid());

    let report = tolerant.import_log_with_report(Some(guid), 2, Some(&v2)).await?;
    assert_eq!(report.entries_persisted, 1);
    assert!(report.warnings.contains("HashMismatch"));
    Ok(())
}

#[tokio::test]
async fn test_tampered_file_entry_is_detected() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let guid = Uuid::new_v4();
    let (log, _) = write_log(&dir, "v1", &["alpha", "beta", "gamma"]);
    tamper_file(&log, "\"en_text\":\"beta\"", "\"en_text\":\"BETA\"");

    let strict = setup_service(IntegrityLevel::HashRequired).await;
    assert!(matches!(
        strict.import_log(Some(guid), 1, Some(&log)).await,
        Err(AuditLogError::HashMismatch(_))
    ));
    assert_eq!(strict.build_tree(guid).await?.tree_size(), 1);

    let tolerant = setup_service(IntegrityLevel::WarnOnly).await;
    let report = tolerant.import_log_with_report(Some(guid), 1, Some(&log)).await?;
    assert_eq!(report.hash_failures, 1);
    assert_eq!(report.entries_persisted, 3);
    // Entry hashes are untouched, so the file digest still holds
    assert_eq!(report.root_digest_valid, Some(true));
    Ok(())
}

#[tokio::test]
async fn test_tampered_root_digest_is_detected() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let guid = Uuid::new_v4();
    let (log, root) = write_log(&dir, "v1", &["alpha", "beta"]);
    let forged = format!("sha256:{}", "0".repeat(64));
    tamper_file(&log, &root, &forged);

    let strict = setup_service(IntegrityLevel::Strict).await;
    assert!(matches!(
        strict.import_log(Some(guid), 1, Some(&log)).await,
        Err(AuditLogError::RootDigestMismatch(_))
    ));
    assert_eq!(strict.build_tree(guid).await?.tree_size(), 1);

    let tolerant = setup_service(IntegrityLevel::WarnOnly).await;
    let report = tolerant.import_log_with_report(Some(guid), 1, Some(&log)).await?;
    assert_eq!(report.root_digest_valid, Some(false));
    assert_eq!(report.entries_persisted, 2);

    // A digest that failed at import time is not recorded for later checks
    let result = tolerant.verify_version(1).await?;
    assert!(result.declared_root_digest.is_none());
    Ok(())
}

#[tokio::test]
async fn test_missing_footer_tolerated_unless_strict() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let guid = Uuid::new_v4();
    let (log, root) = write_log(&dir, "v1", &["alpha"]);
    let footer = format!("{{\"kind\":\"footer\",\"root_hash\":\"{}\"}}\n", root);
    tamper_file(&log, &footer, "");

    let strict = setup_service(IntegrityLevel::Strict).await;
    assert!(strict.import_log(Some(guid), 1, Some(&log)).await.is_err());

    let hash_required = setup_service(IntegrityLevel::HashRequired).await;
    assert_eq!(hash_required.import_log(Some(guid), 1, Some(&log)).await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_exported_history_reimports_with_same_digest() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let service = setup_service(IntegrityLevel::Strict).await;
    let guid = Uuid::new_v4();
    let (log, root) = write_log(&dir, "v1", &["a", "b", "c"]);
    service.import_log(Some(guid), 1, Some(&log)).await?;

    let exported = dir.path().join("export.jsonl");
    assert_eq!(service.export_version_log(1, &exported).await?, root);

    let copy = Uuid::new_v4();
    assert_eq!(service.import_log(Some(copy), 2, Some(&exported)).await?, 3);
    assert!(service.verify_version(2).await?.is_valid());
    Ok(())
}

#[tokio::test]
async fn test_message_order_survives_the_store() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let service = setup_service(IntegrityLevel::HashRequired).await;
    let guid = Uuid::new_v4();
    let (v1, _) = write_entries(&dir, "v1", &chain_with_reversed_messages(&["a", "b"]), None);
    let (v2, _) = write_entries(&dir, "v2", &chain_with_reversed_messages(&["a", "b", "c"]), None);

    assert_eq!(service.import_log(Some(guid), 1, Some(&v1)).await?, 2);
    let result = service.verify_version(1).await?;
    assert_eq!(result.hash_failures, 0);
    assert!(result.is_valid(), "{}", result.summary());

    // Reusing the stored entries re-hashes them with their messages as logged
    let report = service.import_log_with_report(Some(guid), 2, Some(&v2)).await?;
    assert_eq!(report.entries_persisted, 1);
    assert_eq!(report.entries_reused, 2);
    assert!(!report.warnings.contains("HashMismatch"));
    assert!(service.verify_version(2).await?.is_valid());
    Ok(())
}
