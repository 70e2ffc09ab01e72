use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use pageflow_common::{Error, Result};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, params_from_iter};
use tracing::{debug, info};

/// A result row with every column rendered as text (`None` for SQL NULL).
pub type Row = Vec<Option<String>>;

/// The SQL surface the migration engine needs from a target database.
///
/// Implementations run statements one at a time and report unique/check
/// constraint failures as [`Error::Constraint`] so callers can tell a
/// duplicate row apart from any other failure.
pub trait Database {
    /// Run SQL with no bound parameters.
    fn execute(&self, sql: &str) -> Result<()>;

    /// Run a single statement with positional text parameters, returning the
    /// number of affected rows.
    fn execute_params(&self, sql: &str, params: &[&str]) -> Result<usize>;

    fn query(&self, sql: &str, params: &[&str]) -> Result<Vec<Row>>;

    fn begin(&self) -> Result<()>;
    fn commit(&self) -> Result<()>;
    fn rollback(&self) -> Result<()>;

    /// Whether DDL participates in transactions on this backend.
    fn transactional_ddl(&self) -> bool;

    /// Whether a table with this name exists. Only reads, so it does not
    /// wait on another connection's open write transaction.
    fn has_table(&self, name: &str) -> Result<bool>;
}

/// [`Database`] backed by a single SQLite connection.
pub struct SqliteDatabase {
    conn: Mutex<Connection>,
}

impl SqliteDatabase {
    pub fn open(db_path: &Path) -> Result<Self> {
        Self::open_with_timeout(db_path, Duration::from_secs(5))
    }

    pub fn open_with_timeout(db_path: &Path, busy_timeout: Duration) -> Result<Self> {
        info!("opening database at {}", db_path.display());
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;
        conn.busy_timeout(busy_timeout)
            .map_err(|e| Error::Database(format!("failed to set busy timeout: {e}")))?;

        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("database lock poisoned".into()))
    }
}

impl Database for SqliteDatabase {
    fn execute(&self, sql: &str) -> Result<()> {
        debug!(sql, "execute");
        let conn = self.connection()?;
        conn.execute_batch(sql).map_err(classify)
    }

    fn execute_params(&self, sql: &str, params: &[&str]) -> Result<usize> {
        debug!(sql, "execute with params");
        let conn = self.connection()?;
        conn.execute(sql, params_from_iter(params.iter()))
            .map_err(classify)
    }

    fn query(&self, sql: &str, params: &[&str]) -> Result<Vec<Row>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;
        let columns = stmt.column_count();

        let rows = stmt
            .query_map(params_from_iter(params.iter()), |row| {
                (0..columns)
                    .map(|i| row.get_ref(i).map(render_value))
                    .collect::<rusqlite::Result<Row>>()
            })
            .map_err(|e| Error::Database(format!("failed to run query: {e}")))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| Error::Database(format!("failed to read row: {e}")))?);
        }
        Ok(out)
    }

    fn begin(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch("BEGIN")
            .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))
    }

    fn commit(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch("COMMIT")
            .map_err(|e| Error::Database(format!("failed to commit transaction: {e}")))
    }

    fn rollback(&self) -> Result<()> {
        let conn = self.connection()?;
        // Some errors make SQLite abandon the transaction on its own.
        if conn.is_autocommit() {
            return Ok(());
        }
        conn.execute_batch("ROLLBACK")
            .map_err(|e| Error::Database(format!("failed to roll back transaction: {e}")))
    }

    fn transactional_ddl(&self) -> bool {
        true
    }

    fn has_table(&self, name: &str) -> Result<bool> {
        let rows = self.query(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            &[name],
        )?;
        Ok(!rows.is_empty())
    }
}

fn classify(e: rusqlite::Error) -> Error {
    match e.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => Error::Constraint(e.to_string()),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => Error::Busy(e.to_string()),
        _ => Error::Database(e.to_string()),
    }
}

fn render_value(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) | ValueRef::Blob(t) => Some(String::from_utf8_lossy(t).into_owned()),
    }
}

/// Parse a timestamp written either as RFC 3339 or by SQLite's
/// `datetime('now')`.
pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|naive| naive.and_utc())
        })
        .map_err(|e| Error::Database(format!("invalid timestamp `{s}`: {e}")))
}
