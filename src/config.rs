//! Configuration for stores and sync behavior
//!
//! Loaded from TOML:
//!
//! ```toml
//! [database]
//! backend = "postgres"
//! url = "postgres://sync@localhost/warehouse"
//! schema = "public"
//!
//! [connect]
//! attempts = 5
//! backoff_ms = 250
//!
//! [sync]
//! sanity_check = true
//! insert_batch_size = 500
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::store::RetryPolicy;
use crate::sync::audit::DEFAULT_AUDIT_TABLE;
use crate::validation::validate_identifier;

/// Environment variable overriding the database with a PostgreSQL URL
pub const DATABASE_URL_ENV: &str = "TABLE_SYNC_DATABASE_URL";

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "table-sync.toml";

fn default_schema() -> String {
    "public".to_string()
}

/// Which store to talk to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum DatabaseConfig {
    /// Embedded DuckDB; in-memory when no path is given
    Duckdb {
        #[serde(default)]
        path: Option<PathBuf>,
    },
    /// PostgreSQL server
    Postgres {
        url: String,
        #[serde(default = "default_schema")]
        schema: String,
        #[serde(default)]
        statement_timeout_ms: Option<u64>,
    },
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig::Duckdb { path: None }
    }
}

impl DatabaseConfig {
    pub fn duckdb(path: impl Into<PathBuf>) -> Self {
        DatabaseConfig::Duckdb {
            path: Some(path.into()),
        }
    }

    pub fn postgres(url: &str) -> Self {
        DatabaseConfig::Postgres {
            url: url.to_string(),
            schema: default_schema(),
            statement_timeout_ms: None,
        }
    }

    /// Display string without credentials
    pub fn display(&self) -> String {
        match self {
            DatabaseConfig::Duckdb { path: Some(path) } => format!("duckdb:{}", path.display()),
            DatabaseConfig::Duckdb { path: None } => "duckdb::memory:".to_string(),
            DatabaseConfig::Postgres { url, schema, .. } => {
                let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
                let host = rest.rsplit('@').next().unwrap_or(rest);
                format!("postgres://{host} (schema {schema})")
            }
        }
    }
}

impl FromStr for DatabaseConfig {
    type Err = String;

    /// Parse `postgres://...`, `postgresql://...`, `:memory:` or a DuckDB file path
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            Err("Database location cannot be empty".to_string())
        } else if s.starts_with("postgres://") || s.starts_with("postgresql://") {
            Ok(DatabaseConfig::postgres(s))
        } else if s == ":memory:" {
            Ok(DatabaseConfig::Duckdb { path: None })
        } else {
            Ok(DatabaseConfig::duckdb(s))
        }
    }
}

/// Connection establishment policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// Total attempts before giving up
    pub attempts: u32,
    /// Fixed delay between attempts
    pub backoff_ms: u64,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 500,
        }
    }
}

impl ConnectConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.attempts.max(1),
            backoff: Duration::from_millis(self.backoff_ms),
        }
    }
}

/// Behavior of the sync executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    /// Re-read and compare the table after every write
    pub sanity_check: bool,
    /// Fail update-only calls that target missing keys
    pub strict_update_only: bool,
    /// Rows per multi-row insert statement
    pub insert_batch_size: usize,
    /// Table audit records are appended to
    pub audit_table: String,
    /// Username for read-only sessions and schema loads
    pub service_user: String,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            sanity_check: true,
            strict_update_only: false,
            insert_batch_size: 1000,
            audit_table: DEFAULT_AUDIT_TABLE.to_string(),
            service_user: "table_sync".to_string(),
        }
    }
}

impl SyncOptions {
    pub fn with_sanity_check(mut self, enabled: bool) -> Self {
        self.sanity_check = enabled;
        self
    }

    pub fn with_strict_update_only(mut self, strict: bool) -> Self {
        self.strict_update_only = strict;
        self
    }

    pub fn with_insert_batch_size(mut self, size: usize) -> Self {
        self.insert_batch_size = size;
        self
    }

    pub fn with_audit_table(mut self, table: &str) -> Self {
        self.audit_table = table.to_string();
        self
    }

    /// Check the options are usable
    pub fn validate(&self) -> SyncResult<()> {
        if self.insert_batch_size == 0 {
            return Err(SyncError::Config(
                "insert_batch_size must be at least 1".to_string(),
            ));
        }
        validate_identifier(&self.audit_table)
            .map_err(|e| SyncError::Config(format!("audit_table: {e}")))?;
        if self.service_user.trim().is_empty() {
            return Err(SyncError::Config("service_user cannot be empty".to_string()));
        }
        Ok(())
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub connect: ConnectConfig,
    #[serde(default)]
    pub sync: SyncOptions,
}

impl SyncConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> SyncResult<Self> {
        let config: SyncConfig = toml::from_str(text)
            .map_err(|e| SyncError::Config(format!("invalid TOML: {e}")))?;
        config.sync.validate()?;
        Ok(config)
    }

    /// Load configuration from a file
    pub fn load(path: &Path) -> SyncResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Apply `TABLE_SYNC_DATABASE_URL` if it is set
    pub fn apply_env(self) -> Self {
        self.apply_database_url(std::env::var(DATABASE_URL_ENV).ok().as_deref())
    }

    fn apply_database_url(mut self, url: Option<&str>) -> Self {
        if let Some(url) = url.filter(|u| !u.trim().is_empty()) {
            let (schema, statement_timeout_ms) = match &self.database {
                DatabaseConfig::Postgres {
                    schema,
                    statement_timeout_ms,
                    ..
                } => (schema.clone(), *statement_timeout_ms),
                DatabaseConfig::Duckdb { .. } => (default_schema(), None),
            };
            self.database = DatabaseConfig::Postgres {
                url: url.trim().to_string(),
                schema,
                statement_timeout_ms,
            };
        }
        self
    }

    pub fn to_toml(&self) -> SyncResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SyncError::Config(format!("failed to serialize config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::from_toml_str("").unwrap();
        assert_eq!(config.database, DatabaseConfig::Duckdb { path: None });
        assert!(config.sync.sanity_check);
        assert!(!config.sync.strict_update_only);
        assert_eq!(config.sync.insert_batch_size, 1000);
        assert_eq!(config.sync.audit_table, "bulk_update_log");
        assert_eq!(config.connect.retry_policy().attempts, 3);
    }

    #[test]
    fn test_postgres_section() {
        let config = SyncConfig::from_toml_str(
            r#"
            [database]
            backend = "postgres"
            url = "postgres://u:p@db/warehouse"
            statement_timeout_ms = 30000

            [sync]
            strict_update_only = true
            "#,
        )
        .unwrap();
        match &config.database {
            DatabaseConfig::Postgres {
                schema,
                statement_timeout_ms,
                ..
            } => {
                assert_eq!(schema, "public");
                assert_eq!(*statement_timeout_ms, Some(30000));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(config.sync.strict_update_only);
        assert_eq!(config.database.display(), "postgres://db/warehouse (schema public)");
    }

    #[test]
    fn test_invalid_options_rejected() {
        assert!(SyncConfig::from_toml_str("[sync]\ninsert_batch_size = 0").is_err());
        assert!(SyncConfig::from_toml_str("[sync]\naudit_table = \"bad name\"").is_err());
        assert!(SyncConfig::from_toml_str("[database]\nbackend = \"oracle\"").is_err());
    }

    #[test]
    fn test_database_url_override() {
        let config = SyncConfig::default().apply_database_url(Some("postgres://db/x"));
        assert_eq!(config.database, DatabaseConfig::postgres("postgres://db/x"));

        let config = SyncConfig::default().apply_database_url(Some("  "));
        assert_eq!(config.database, DatabaseConfig::default());
    }

    #[test]
    fn test_database_from_str() {
        assert_eq!(
            ":memory:".parse::<DatabaseConfig>().unwrap(),
            DatabaseConfig::Duckdb { path: None }
        );
        assert_eq!(
            "data/shop.duckdb".parse::<DatabaseConfig>().unwrap(),
            DatabaseConfig::duckdb("data/shop.duckdb")
        );
        assert!(matches!(
            "postgresql://host/db".parse::<DatabaseConfig>().unwrap(),
            DatabaseConfig::Postgres { .. }
        ));
    }
}
