//! Audit Log Verification
//!
//! Recomputes entry hashes along a chain and the rolling root digest that a
//! log file declares in its footer.

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::audit::entry::HashChainEntry;
use crate::audit::policy::{Check, IntegrityReporter};
use crate::error::AuditLogError;

/// Verify a single entry against its recomputed hash. Never fails.
pub fn verify_entry(entry: &HashChainEntry) -> bool {
    entry.verify_hash()
}

/// Rolling SHA256 over entry hashes in the order they are encountered.
#[derive(Clone, Default)]
pub struct RootDigest {
    hasher: Sha256,
    entry_count: usize,
}

impl RootDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, entry_hash: &str) {
        self.hasher.update(entry_hash.as_bytes());
        self.entry_count += 1;
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn finalize(self) -> String {
        format!("sha256:{}", hex::encode(self.hasher.finalize()))
    }

    /// Compare against a declared digest without consuming the running state.
    pub fn matches(&self, declared: &str) -> bool {
        self.clone().finalize() == declared
    }
}

/// Root digest of hashes given in encounter order.
pub fn compute_root_digest<'a>(hashes: impl IntoIterator<Item = &'a str>) -> String {
    let mut digest = RootDigest::new();
    for hash in hashes {
        digest.update(hash);
    }
    digest.finalize()
}

/// Root digest of a stored version path. Log files list entries newest first,
/// so the oldest-first path is folded in reverse.
pub fn path_digest(hashes_oldest_first: &[&str]) -> String {
    compute_root_digest(hashes_oldest_first.iter().rev().copied())
}

/// Tally of a chain verification pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainVerification {
    pub entry_count: usize,
    pub hash_failures: usize,
    pub missing_hashes: usize,
}

/// Verify a chain given oldest first.
///
/// Each entry is linked to the declared hash of the entry before it, then its
/// hash is recomputed. Only the first mismatch goes through the integrity
/// policy, so a strict level aborts on it and a tolerant one warns once; the
/// remaining mismatches are counted. Entries that declare no hash take their
/// calculated hash.
pub fn verify_chain(
    entries: &mut [HashChainEntry],
    reporter: &mut IntegrityReporter,
) -> Result<ChainVerification, AuditLogError> {
    let mut result = ChainVerification {
        entry_count: entries.len(),
        ..Default::default()
    };
    let mut previous: Option<String> = None;

    for entry in entries.iter_mut() {
        entry.parent_entry_hash = previous.take();

        if !entry.has_declared_hash() {
            if result.missing_hashes == 0 {
                reporter.report(
                    Check::MissingHash,
                    format!(
                        "Log entry timestamped {} has no hash. This is expected for older documents; \
                         suppressing the warning for the remainder of the log",
                        entry.create_timestamp
                    ),
                )?;
            }
            result.missing_hashes += 1;
            entry.adopt_calculated_hash();
        } else if !verify_entry(entry) {
            if result.hash_failures == 0 {
                reporter.report(
                    Check::HashMismatch,
                    format!(
                        "Hash verification failed for the log entry timestamped {}. \
                         Suppressing the warning for the remainder of the log",
                        entry.create_timestamp
                    ),
                )?;
            }
            debug!("Hash mismatch for entry {}", entry.summary());
            result.hash_failures += 1;
        }

        previous = Some(entry.entry_hash.clone());
    }

    if result.hash_failures > 0 {
        warn!(
            "Hash verification failed for {} of {} total entries",
            result.hash_failures, result.entry_count
        );
    }

    Ok(result)
}

/// Find tampered entries in a chain already linked to its parents
pub fn find_tampered_entries(entries: &[HashChainEntry]) -> Vec<usize> {
    entries
        .iter()
        .enumerate()
        .filter(|(_, entry)| entry.has_declared_hash() && !verify_entry(entry))
        .map(|(i, _)| i)
        .collect()
}

/// Verification result for a stored version or a log file
#[derive(Debug, Clone)]
pub struct VerificationResult {
    pub entry_count: usize,
    pub hash_failures: usize,
    pub missing_hashes: usize,
    pub computed_root_digest: String,
    pub declared_root_digest: Option<String>,
}

impl VerificationResult {
    pub fn from_chain(
        chain: &ChainVerification,
        computed_root_digest: String,
        declared_root_digest: Option<String>,
    ) -> Self {
        Self {
            entry_count: chain.entry_count,
            hash_failures: chain.hash_failures,
            missing_hashes: chain.missing_hashes,
            computed_root_digest,
            declared_root_digest,
        }
    }

    /// None when there is no declared digest to compare with.
    pub fn root_digest_valid(&self) -> Option<bool> {
        self.declared_root_digest
            .as_deref()
            .map(|declared| declared == self.computed_root_digest)
    }

    pub fn is_valid(&self) -> bool {
        self.hash_failures == 0 && self.root_digest_valid() != Some(false)
    }

    pub fn summary(&self) -> String {
        if self.is_valid() {
            format!("✅ Audit log is valid ({} entries)", self.entry_count)
        } else {
            format!(
                "❌ Audit log is invalid ({} entries): {} hash failures, root digest {}",
                self.entry_count,
                self.hash_failures,
                match self.root_digest_valid() {
                    Some(true) => "matches",
                    Some(false) => "does not match",
                    None => "not declared",
                }
            )
        }
    }

    /// Check the root digest through the integrity policy.
    pub fn report_root_digest(&self, reporter: &mut IntegrityReporter) -> Result<(), AuditLogError> {
        match self.root_digest_valid() {
            Some(true) => {
                info!("Audit log root digest verified ({} entries)", self.entry_count);
                Ok(())
            }
            Some(false) => reporter.report(
                Check::RootDigest,
                format!(
                    "Audit log root digest verification failed: declared {}, computed {}",
                    self.declared_root_digest.as_deref().unwrap_or_default(),
                    self.computed_root_digest
                ),
            ),
            None => reporter.report(Check::MissingHash, "Audit log declares no root digest"),
        }
    }
}
