//! Integrity Policy
//!
//! Maps the configured integrity level to the action taken when one of the
//! audit log checks fails, and keeps the per-import tally of tolerated failures.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::error::AuditLogError;

/// Configured strictness of audit log validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityLevel {
    /// Log and continue. Documents without audit data still import.
    WarnOnly,
    /// Hash mismatches abort; entries that carry no hash at all are tolerated.
    HashRequired,
    /// Any inconsistency aborts the import.
    Strict,
}

impl Default for IntegrityLevel {
    fn default() -> Self {
        Self::WarnOnly
    }
}

impl IntegrityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WarnOnly => "warn_only",
            Self::HashRequired => "hash_required",
            Self::Strict => "strict",
        }
    }

    /// Action taken when `check` fails under this level.
    pub fn action(&self, check: Check) -> Action {
        match (self, check) {
            (Self::WarnOnly, _) => Action::Warn,
            (Self::HashRequired, Check::MissingHash) => Action::Warn,
            (Self::HashRequired, _) | (Self::Strict, _) => Action::Abort,
        }
    }
}

impl fmt::Display for IntegrityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntegrityLevel {
    type Err = AuditLogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "warn_only" | "warn-only" | "any" | "0" => Ok(Self::WarnOnly),
            "hash_required" | "hash-required" | "hash" | "1" => Ok(Self::HashRequired),
            "strict" | "2" => Ok(Self::Strict),
            other => Err(AuditLogError::ConfigError(format!(
                "Unknown integrity level: {}",
                other
            ))),
        }
    }
}

/// Outcome of a failed check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Warn,
    Abort,
}

/// The validation checks that are gated by the integrity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Check {
    MissingResource,
    MissingIdentifier,
    NoSharedHistory,
    DivergentHistory,
    HashMismatch,
    MissingHash,
    RootDigest,
    MalformedEntry,
}

impl Check {
    fn into_error(self, message: String) -> AuditLogError {
        match self {
            Self::MissingResource => AuditLogError::MissingResource(message),
            Self::MissingIdentifier => AuditLogError::MissingIdentifier(message),
            Self::NoSharedHistory | Self::DivergentHistory => {
                AuditLogError::DivergentHistory(message)
            }
            Self::HashMismatch | Self::MissingHash => AuditLogError::HashMismatch(message),
            Self::RootDigest => AuditLogError::RootDigestMismatch(message),
            Self::MalformedEntry => AuditLogError::Parse(message),
        }
    }
}

/// Per-call reporter for integrity failures.
///
/// Under a tolerant level each kind of failure is logged once and counted
/// afterwards, so a legacy file does not produce one warning per entry.
#[derive(Debug, Clone)]
pub struct IntegrityReporter {
    level: IntegrityLevel,
    tolerated: BTreeMap<Check, usize>,
}

impl IntegrityReporter {
    pub fn new(level: IntegrityLevel) -> Self {
        Self {
            level,
            tolerated: BTreeMap::new(),
        }
    }

    pub fn level(&self) -> IntegrityLevel {
        self.level
    }

    /// Report a failed check. Returns the matching error when the level aborts.
    pub fn report(&mut self, check: Check, message: impl Into<String>) -> Result<(), AuditLogError> {
        let message = message.into();
        match self.level.action(check) {
            Action::Abort => Err(check.into_error(message)),
            Action::Warn => {
                let seen = self.tolerated.entry(check).or_insert(0);
                if *seen == 0 {
                    warn!("{} (integrity level {})", message, self.level);
                } else {
                    debug!("Suppressed repeated {:?} warning: {}", check, message);
                }
                *seen += 1;
                Ok(())
            }
        }
    }

    /// Number of tolerated failures of the given kind.
    pub fn count(&self, check: Check) -> usize {
        self.tolerated.get(&check).copied().unwrap_or(0)
    }

    pub fn has_warnings(&self) -> bool {
        !self.tolerated.is_empty()
    }

    pub fn summary(&self) -> String {
        if self.tolerated.is_empty() {
            return "no integrity warnings".to_string();
        }
        self.tolerated
            .iter()
            .map(|(check, count)| format!("{:?}: {}", check, count))
            .collect::<Vec<_>>()
            .join(", ")
    }
}
