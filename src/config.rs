use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::audit::policy::IntegrityLevel;
use crate::error::AuditLogError;

const DEFAULT_CONFIG_FILE: &str = "audit-tree";
const ENV_PREFIX: &str = "AUDIT_TREE";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    /// One of `warn_only`, `hash_required`, `strict` (or the numeric levels 0-2).
    pub integrity_level: String,
    pub max_merge_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://audit-tree.db".to_string(),
            integrity_level: IntegrityLevel::default().as_str().to_string(),
            max_merge_attempts: 5,
            retry_backoff_ms: 20,
        }
    }
}

impl AppConfig {
    /// Defaults, then `audit-tree.{yaml,toml,json}` if present, then `AUDIT_TREE_*`.
    pub fn load() -> Result<Self, AuditLogError> {
        Self::build(File::with_name(DEFAULT_CONFIG_FILE).required(false))
    }

    /// Like [`AppConfig::load`] but with an explicit, required config file.
    pub fn load_from(path: &Path) -> Result<Self, AuditLogError> {
        Self::build(File::from(path).required(true))
    }

    fn build<S>(file: S) -> Result<Self, AuditLogError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let defaults = AppConfig::default();
        let config: AppConfig = Config::builder()
            .set_default("database_url", defaults.database_url)?
            .set_default("integrity_level", defaults.integrity_level)?
            .set_default("max_merge_attempts", defaults.max_merge_attempts)?
            .set_default("retry_backoff_ms", defaults.retry_backoff_ms)?
            .add_source(file)
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AuditLogError> {
        if self.max_merge_attempts == 0 {
            return Err(AuditLogError::ConfigError(
                "max_merge_attempts must be at least 1".to_string(),
            ));
        }
        self.integrity_level()?;
        Ok(())
    }

    pub fn integrity_level(&self) -> Result<IntegrityLevel, AuditLogError> {
        self.integrity_level.parse()
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
