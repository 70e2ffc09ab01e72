use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use pageflow_common::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::database::{Database, Row, parse_datetime};

pub const DEFAULT_LEDGER_TABLE: &str = "_pageflow_migrations";
pub const DEFAULT_LOG_TABLE: &str = "_pageflow_log";

/// One applied migration, as recorded in the ledger table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub migration_id: String,
    pub applied_at: DateTime<Utc>,
    pub checksum: Option<String>,
}

/// Kind of ledger change recorded in the operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Apply,
    Rollback,
    Mark,
    Unmark,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Apply => "apply",
            Operation::Rollback => "rollback",
            Operation::Mark => "mark",
            Operation::Unmark => "unmark",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "apply" => Ok(Operation::Apply),
            "rollback" => Ok(Operation::Rollback),
            "mark" => Ok(Operation::Mark),
            "unmark" => Ok(Operation::Unmark),
            other => Err(Error::Database(format!("unknown ledger operation `{other}`"))),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of the operation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub migration_id: String,
    pub operation: Operation,
    pub pid: u32,
    pub created_at: DateTime<Utc>,
}

/// Record of applied migrations, kept in the target database.
///
/// Ledger order is insertion order (`seq`), not timestamp order, so two
/// migrations applied within the same second still have a defined latest.
#[derive(Debug, Clone)]
pub struct Ledger {
    table: String,
    log_table: String,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_TABLE, DEFAULT_LOG_TABLE)
    }
}

impl Ledger {
    /// Table names are interpolated into SQL and must already be validated
    /// identifiers.
    pub fn new(table: impl Into<String>, log_table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            log_table: log_table.into(),
        }
    }

    /// Create the ledger and log tables if they do not exist yet.
    pub fn ensure(&self, db: &dyn Database) -> Result<()> {
        if db.has_table(&self.table)? && db.has_table(&self.log_table)? {
            return Ok(());
        }
        db.execute(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                migration_id TEXT NOT NULL UNIQUE,
                applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                checksum TEXT
            );

            CREATE TABLE IF NOT EXISTS {log} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                migration_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                pid INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
            );",
            table = self.table,
            log = self.log_table,
        ))
        .map_err(|e| Error::Database(format!("failed to create ledger tables: {e}")))
    }

    pub fn is_applied(&self, db: &dyn Database, id: &str) -> Result<bool> {
        let rows = db.query(
            &format!("SELECT 1 FROM {} WHERE migration_id = ?1", self.table),
            &[id],
        )?;
        Ok(!rows.is_empty())
    }

    pub fn record_applied(
        &self,
        db: &dyn Database,
        id: &str,
        applied_at: DateTime<Utc>,
        checksum: Option<&str>,
    ) -> Result<()> {
        if self.is_applied(db, id)? {
            return Err(Error::DuplicateEntry(id.to_string()));
        }

        let at = applied_at.to_rfc3339_opts(SecondsFormat::Secs, true);
        let sql = format!(
            "INSERT INTO {} (migration_id, applied_at, checksum) VALUES (?1, ?2, ?3)",
            self.table
        );
        let result = match checksum {
            Some(sum) => db.execute_params(&sql, &[id, at.as_str(), sum]),
            None => db.execute_params(
                &format!(
                    "INSERT INTO {} (migration_id, applied_at) VALUES (?1, ?2)",
                    self.table
                ),
                &[id, at.as_str()],
            ),
        };

        match result {
            Ok(_) => {
                debug!(migration = id, "ledger entry recorded");
                Ok(())
            }
            Err(Error::Constraint(_)) => Err(Error::DuplicateEntry(id.to_string())),
            Err(e) => Err(e),
        }
    }

    pub fn remove_entry(&self, db: &dyn Database, id: &str) -> Result<()> {
        let removed = db.execute_params(
            &format!("DELETE FROM {} WHERE migration_id = ?1", self.table),
            &[id],
        )?;
        if removed == 0 {
            return Err(Error::NotFound(format!("no ledger entry for {id}")));
        }
        debug!(migration = id, "ledger entry removed");
        Ok(())
    }

    /// All entries, oldest first.
    pub fn entries(&self, db: &dyn Database) -> Result<Vec<LedgerEntry>> {
        let rows = db.query(
            &format!(
                "SELECT migration_id, applied_at, checksum FROM {} ORDER BY seq ASC",
                self.table
            ),
            &[],
        )?;
        rows.into_iter().map(entry_from_row).collect()
    }

    /// The most recently applied migration.
    pub fn latest(&self, db: &dyn Database) -> Result<Option<LedgerEntry>> {
        let rows = db.query(
            &format!(
                "SELECT migration_id, applied_at, checksum FROM {} ORDER BY seq DESC LIMIT 1",
                self.table
            ),
            &[],
        )?;
        rows.into_iter().next().map(entry_from_row).transpose()
    }

    pub fn log_operation(&self, db: &dyn Database, id: &str, operation: Operation) -> Result<()> {
        let pid = std::process::id().to_string();
        db.execute_params(
            &format!(
                "INSERT INTO {} (migration_id, operation, pid) VALUES (?1, ?2, ?3)",
                self.log_table
            ),
            &[id, operation.as_str(), pid.as_str()],
        )?;
        Ok(())
    }

    /// Most recent operations first.
    pub fn history(&self, db: &dyn Database, limit: usize) -> Result<Vec<LogEntry>> {
        let rows = db.query(
            &format!(
                "SELECT migration_id, operation, pid, created_at FROM {}
                 ORDER BY id DESC LIMIT {limit}",
                self.log_table
            ),
            &[],
        )?;

        rows.into_iter()
            .map(|row| {
                let pid = column(&row, 2)?
                    .parse::<u32>()
                    .map_err(|e| Error::Database(format!("invalid pid in log: {e}")))?;
                Ok(LogEntry {
                    migration_id: column(&row, 0)?.to_string(),
                    operation: Operation::parse(column(&row, 1)?)?,
                    pid,
                    created_at: parse_datetime(column(&row, 3)?)?,
                })
            })
            .collect()
    }
}

fn entry_from_row(row: Row) -> Result<LedgerEntry> {
    Ok(LedgerEntry {
        migration_id: column(&row, 0)?.to_string(),
        applied_at: parse_datetime(column(&row, 1)?)?,
        checksum: row.get(2).cloned().flatten(),
    })
}

fn column(row: &Row, index: usize) -> Result<&str> {
    row.get(index)
        .and_then(|v| v.as_deref())
        .ok_or_else(|| Error::Database(format!("ledger row is missing column {index}")))
}
