//! Audit Log Tree
//!
//! Hash-chained audit logs of document versions, merged into one shared
//! history tree per document and verified against their declared digests.

pub mod entry;
pub mod importer;
pub mod policy;
pub mod purge;
pub mod service;
pub mod source;
pub mod tree;
pub mod verify;

pub use entry::{AuditLogMessage, HashChainEntry};
pub use importer::ImportReport;
pub use policy::{Check, IntegrityLevel, IntegrityReporter};
pub use service::AuditLogService;
pub use source::{JsonLogReader, LogFileWriter, LogSource, MemoryLogSource, SourceError};
pub use tree::{VersionTree, NULL_SENTINEL};
pub use verify::{verify_chain, verify_entry, RootDigest, VerificationResult};
