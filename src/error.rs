use thiserror::Error;

impl From<serde_json::Error> for AuditLogError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(format!("JSON decoding error: {}", err))
    }
}

impl From<std::io::Error> for AuditLogError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<config::ConfigError> for AuditLogError {
    fn from(err: config::ConfigError) -> Self {
        Self::ConfigError(err.to_string())
    }
}

impl From<sqlx::Error> for AuditLogError {
    fn from(err: sqlx::Error) -> Self {
        if is_concurrent_modification(&err) {
            Self::ConcurrentModification(format!("Conflicting write: {}", err))
        } else {
            Self::DatabaseError(format!("Database error: {}", err))
        }
    }
}

/// True when a store error means another writer touched the same document tree:
/// a uniqueness violation on the entry table, or SQLite reporting BUSY/LOCKED.
pub fn is_concurrent_modification(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            if db_err.is_unique_violation() {
                return true;
            }
            // Extended result codes keep the primary code in the low byte
            db_err
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| matches!(code & 0xff, 5 | 6))
                .unwrap_or(false)
        }
        _ => false,
    }
}

#[derive(Error, Debug)]
pub enum AuditLogError {
    #[error("Missing resource: {0}")]
    MissingResource(String),

    #[error("Missing identifier: {0}")]
    MissingIdentifier(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Hash mismatch: {0}")]
    HashMismatch(String),

    #[error("Root digest mismatch: {0}")]
    RootDigestMismatch(String),

    #[error("Divergent history: {0}")]
    DivergentHistory(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

impl AuditLogError {
    /// Whether the merge step may be retried from a freshly rebuilt tree.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification(_))
    }

    pub fn retries_exhausted(attempts: u32, last: &AuditLogError) -> Self {
        Self::ConcurrentModification(format!(
            "Gave up after {} merge attempts: {}",
            attempts, last
        ))
    }
}

pub type Result<T> = std::result::Result<T, AuditLogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_concurrent_modification_is_retryable() {
        assert!(AuditLogError::ConcurrentModification("x".into()).is_retryable());
        assert!(!AuditLogError::HashMismatch("x".into()).is_retryable());
        assert!(!AuditLogError::DatabaseError("x".into()).is_retryable());
    }

    #[test]
    fn test_row_not_found_is_not_a_conflict() {
        let err: AuditLogError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, AuditLogError::DatabaseError(_)));
    }

    #[test]
    fn test_error_display() {
        let err = AuditLogError::DivergentHistory("first entries differ".to_string());
        assert_eq!(err.to_string(), "Divergent history: first entries differ");
    }
}
