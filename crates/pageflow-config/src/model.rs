use std::path::PathBuf;

use pageflow_common::{Error, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the `pageflow` migration tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub migrations: MigrationsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database file. Defaults to `pageflow.db` in the config directory.
    pub path: Option<PathBuf>,
    /// How long SQLite waits on a busy database before giving up.
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationsConfig {
    /// Directory of migration files. When unset the builtin Pageflow
    /// migrations are used.
    pub directory: Option<PathBuf>,
    pub ledger_table: String,
    pub log_table: String,
    pub lock_table: String,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            directory: None,
            ledger_table: "_pageflow_migrations".to_string(),
            log_table: "_pageflow_log".to_string(),
            lock_table: "_pageflow_lock".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl AppConfig {
    /// Reject configurations the migration engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        let tables = [
            ("ledger_table", &self.migrations.ledger_table),
            ("log_table", &self.migrations.log_table),
            ("lock_table", &self.migrations.lock_table),
        ];
        for (field, name) in tables {
            validate_identifier(name)
                .map_err(|e| Error::Config(format!("migrations.{field}: {e}")))?;
        }

        let m = &self.migrations;
        if m.ledger_table == m.log_table
            || m.ledger_table == m.lock_table
            || m.log_table == m.lock_table
        {
            return Err(Error::Config(
                "migrations ledger, log and lock tables must be distinct".into(),
            ));
        }

        if self.logging.level.trim().is_empty() {
            return Err(Error::Config("logging.level cannot be empty".into()));
        }
        Ok(())
    }
}

/// A bare SQL identifier: ASCII letters, digits and underscores, not starting
/// with a digit.
pub fn validate_identifier(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("identifier cannot be empty".into());
    }
    if name.len() > 64 {
        return Err(format!("identifier `{name}` is too long"));
    }
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(format!("identifier `{name}` cannot start with a digit"));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(format!(
            "identifier `{name}` may only contain letters, digits and underscores"
        ));
    }
    Ok(())
}
