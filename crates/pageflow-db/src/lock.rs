use chrono::{SecondsFormat, Utc};
use pageflow_common::{Error, Result};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::database::Database;

pub const DEFAULT_LOCK_TABLE: &str = "_pageflow_lock";

/// Cross-process lock serializing migration runs against one database.
///
/// The lock is a single row keyed `locked = 1`. Whoever inserts it first owns
/// the run; everyone else fails immediately.
#[derive(Debug, Clone)]
pub struct MigrationLock {
    table: String,
}

impl Default for MigrationLock {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TABLE)
    }
}

impl MigrationLock {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    fn ensure(&self, db: &dyn Database) -> Result<()> {
        if db.has_table(&self.table)? {
            return Ok(());
        }
        db.execute(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                locked INTEGER PRIMARY KEY CHECK (locked = 1),
                owner TEXT NOT NULL,
                pid INTEGER NOT NULL,
                acquired_at TEXT NOT NULL
            )",
            self.table
        ))
        .map_err(|e| match e {
            Error::Busy(msg) => busy_writer(msg),
            e => Error::Database(format!("failed to create lock table: {e}")),
        })
    }

    /// Take the lock or fail with [`Error::ConcurrentMigration`]. Must be
    /// called outside of any open transaction so the row is visible to other
    /// processes right away.
    ///
    /// A held lock is detected with a plain read before any write, so a run
    /// midway through a migration transaction is reported without waiting on
    /// the busy timeout.
    pub fn acquire<'a>(&'a self, db: &'a dyn Database) -> Result<LockGuard<'a>> {
        self.ensure(db)?;
        if let Some(holder) = self.holder(db)? {
            return Err(Error::ConcurrentMigration(holder));
        }

        let owner = Uuid::new_v4().to_string();
        let pid = std::process::id().to_string();
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

        let inserted = db.execute_params(
            &format!(
                "INSERT INTO {} (locked, owner, pid, acquired_at) VALUES (1, ?1, ?2, ?3)",
                self.table
            ),
            &[owner.as_str(), pid.as_str(), now.as_str()],
        );

        match inserted {
            Ok(_) => {
                debug!(owner = %owner, "migration lock acquired");
                Ok(LockGuard {
                    lock: self,
                    db,
                    owner,
                })
            }
            Err(Error::Constraint(_)) => Err(Error::ConcurrentMigration(
                self.holder(db)?
                    .unwrap_or_else(|| "lock was held but has just been released, retry".into()),
            )),
            Err(Error::Busy(msg)) => Err(busy_writer(msg)),
            Err(e) => Err(e),
        }
    }

    fn holder(&self, db: &dyn Database) -> Result<Option<String>> {
        let rows = db.query(
            &format!("SELECT pid, acquired_at FROM {} WHERE locked = 1", self.table),
            &[],
        )?;
        Ok(rows.first().map(|row| {
            format!(
                "lock held by pid {} since {}",
                row.first().cloned().flatten().unwrap_or_default(),
                row.get(1).cloned().flatten().unwrap_or_default()
            )
        }))
    }

    /// Remove the lock row whoever owns it. For recovering from a run that
    /// died without releasing.
    pub fn break_lock(&self, db: &dyn Database) -> Result<bool> {
        self.ensure(db)?;
        let removed = db.execute_params(
            &format!("DELETE FROM {} WHERE locked = 1", self.table),
            &[],
        )?;
        if removed > 0 {
            info!("stale migration lock removed");
        }
        Ok(removed > 0)
    }

    fn release(&self, db: &dyn Database, owner: &str) -> Result<()> {
        db.execute_params(
            &format!("DELETE FROM {} WHERE owner = ?1", self.table),
            &[owner],
        )?;
        debug!(owner, "migration lock released");
        Ok(())
    }
}

fn busy_writer(msg: String) -> Error {
    Error::ConcurrentMigration(format!("another connection is writing to the database ({msg})"))
}

/// Releases the migration lock when dropped.
pub struct LockGuard<'a> {
    lock: &'a MigrationLock,
    db: &'a dyn Database,
    owner: String,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release(self.db, &self.owner) {
            warn!("failed to release migration lock (run `pageflow break-lock`): {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::SqliteDatabase;

    #[test]
    fn second_acquire_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock.db");
        let first = SqliteDatabase::open(&path).unwrap();
        let second = SqliteDatabase::open(&path).unwrap();
        let lock = MigrationLock::default();

        let guard = lock.acquire(&first).unwrap();
        let err = lock.acquire(&second).err().unwrap();
        assert!(matches!(err, Error::ConcurrentMigration(_)), "got {err:?}");
        assert!(err.to_string().contains(&std::process::id().to_string()));

        drop(guard);
        assert!(lock.acquire(&second).is_ok());
    }

    #[test]
    fn open_write_transaction_elsewhere_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock.db");
        let writer = SqliteDatabase::open(&path).unwrap();
        let other =
            SqliteDatabase::open_with_timeout(&path, std::time::Duration::from_millis(100)).unwrap();
        let lock = MigrationLock::default();
        drop(lock.acquire(&writer).unwrap());

        // A foreign writer that never took the migration lock.
        writer.begin().unwrap();
        writer.execute("CREATE TABLE scratch (a INTEGER)").unwrap();

        let err = lock.acquire(&other).err().unwrap();
        assert!(matches!(err, Error::ConcurrentMigration(_)), "got {err:?}");
        assert!(err.to_string().contains("another connection is writing"));

        writer.rollback().unwrap();
        assert!(lock.acquire(&other).is_ok());
    }

    #[test]
    fn guard_releases_on_drop() {
        let db = SqliteDatabase::in_memory().unwrap();
        let lock = MigrationLock::default();
        {
            let _guard = lock.acquire(&db).unwrap();
        }
        let rows = db.query("SELECT COUNT(*) FROM _pageflow_lock", &[]).unwrap();
        assert_eq!(rows[0][0].as_deref(), Some("0"));
    }

    #[test]
    fn break_lock_clears_a_leaked_lock() {
        let db = SqliteDatabase::in_memory().unwrap();
        let lock = MigrationLock::default();

        let guard = lock.acquire(&db).unwrap();
        std::mem::forget(guard);
        assert!(lock.acquire(&db).is_err());

        assert!(lock.break_lock(&db).unwrap());
        assert!(!lock.break_lock(&db).unwrap());
        assert!(lock.acquire(&db).is_ok());
    }
}
