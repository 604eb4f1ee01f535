// Database schema for the audit log tree

pub const AUDIT_LOG_TREE_SCHEMA: &str = include_str!("../../migrations/001_audit_log_tree.sql");
