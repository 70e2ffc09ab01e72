use std::collections::HashMap;

use chrono::{DateTime, Utc};
use pageflow_common::{Error, Result};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::database::Database;
use crate::ledger::{Ledger, LedgerEntry, Operation};
use crate::lock::MigrationLock;
use crate::migrations::{Migration, Registry};
use crate::resolver::resolve;

/// Outcome of [`Applier::apply_pending`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
    pub statements_executed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationState {
    Pending,
    Applied,
    /// Applied, but the definition no longer matches what was applied.
    Modified,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationStatus {
    pub id: String,
    pub state: MigrationState,
    pub applied_at: Option<DateTime<Utc>>,
}

/// Runs migrations from a [`Registry`] against a [`Database`] and keeps the
/// ledger in step with what actually ran.
///
/// Every mutating operation holds the migration lock for its whole duration
/// and re-reads the ledger; nothing is cached between calls.
pub struct Applier<'a> {
    db: &'a dyn Database,
    registry: &'a Registry,
    ledger: Ledger,
    lock: MigrationLock,
}

impl<'a> Applier<'a> {
    pub fn new(db: &'a dyn Database, registry: &'a Registry) -> Self {
        Self {
            db,
            registry,
            ledger: Ledger::default(),
            lock: MigrationLock::default(),
        }
    }

    pub fn with_ledger(mut self, ledger: Ledger) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn with_lock(mut self, lock: MigrationLock) -> Self {
        self.lock = lock;
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn lock(&self) -> &MigrationLock {
        &self.lock
    }

    /// Every declared migration in the order it would be applied.
    pub fn plan(&self) -> Result<Vec<&'a Migration>> {
        resolve(self.registry)
    }

    /// Declared migrations that have no ledger entry, in apply order.
    pub fn pending(&self) -> Result<Vec<&'a Migration>> {
        let order = self.plan()?;
        self.ledger.ensure(self.db)?;
        let mut pending = Vec::new();
        for migration in order {
            if !self.ledger.is_applied(self.db, migration.id())? {
                pending.push(migration);
            }
        }
        Ok(pending)
    }

    pub fn status(&self) -> Result<Vec<MigrationStatus>> {
        let order = self.plan()?;
        self.ledger.ensure(self.db)?;
        let entries = self.ledger.entries(self.db)?;
        self.warn_orphans(&entries);

        let by_id: HashMap<&str, &LedgerEntry> = entries
            .iter()
            .map(|e| (e.migration_id.as_str(), e))
            .collect();

        Ok(order
            .into_iter()
            .map(|migration| match by_id.get(migration.id()) {
                Some(entry) => MigrationStatus {
                    id: migration.id().to_string(),
                    state: if is_modified(migration, entry) {
                        MigrationState::Modified
                    } else {
                        MigrationState::Applied
                    },
                    applied_at: Some(entry.applied_at),
                },
                None => MigrationStatus {
                    id: migration.id().to_string(),
                    state: MigrationState::Pending,
                    applied_at: None,
                },
            })
            .collect())
    }

    /// Apply every pending migration in dependency order. Stops at the first
    /// failure, leaving the database at the last fully applied migration.
    pub fn apply_pending(&self) -> Result<ApplyReport> {
        let order = self.plan()?;
        let _guard = self.lock.acquire(self.db)?;
        self.ledger.ensure(self.db)?;

        let entries = self.ledger.entries(self.db)?;
        self.ensure_unmodified(&entries)?;

        let mut report = ApplyReport::default();
        for migration in order {
            if self.ledger.is_applied(self.db, migration.id())? {
                debug!(migration = migration.id(), "already applied, skipping");
                report.skipped.push(migration.id().to_string());
                continue;
            }
            report.statements_executed += self.apply_migration(migration)?;
            report.applied.push(migration.id().to_string());
        }

        if report.applied.is_empty() {
            info!("database is up to date");
        } else {
            info!(
                applied = report.applied.len(),
                statements = report.statements_executed,
                "migrations applied"
            );
        }
        Ok(report)
    }

    /// Apply exactly one migration whose dependencies are already applied.
    pub fn apply(&self, id: &str) -> Result<usize> {
        let migration = self.declared(id)?;
        self.plan()?;
        let _guard = self.lock.acquire(self.db)?;
        self.ledger.ensure(self.db)?;
        self.ensure_unmodified(&self.ledger.entries(self.db)?)?;
        self.apply_one(migration)
    }

    fn apply_one(&self, migration: &Migration) -> Result<usize> {
        if self.ledger.is_applied(self.db, migration.id())? {
            return Err(Error::AlreadyApplied(migration.id().to_string()));
        }
        self.ensure_dependencies_applied(migration)?;
        self.apply_migration(migration)
    }

    /// Roll back `id`, which must be the most recently applied migration.
    pub fn rollback(&self, id: &str) -> Result<()> {
        let _guard = self.lock.acquire(self.db)?;
        self.ledger.ensure(self.db)?;
        self.rollback_one(id)
    }

    /// Roll back whichever migration was applied last and return its id.
    pub fn rollback_latest(&self) -> Result<String> {
        let _guard = self.lock.acquire(self.db)?;
        self.ledger.ensure(self.db)?;
        let latest = self
            .ledger
            .latest(self.db)?
            .ok_or(Error::NothingToRollback)?;
        self.rollback_one(&latest.migration_id)?;
        Ok(latest.migration_id)
    }

    fn rollback_one(&self, id: &str) -> Result<()> {
        let migration = self.rollback_target(id)?;
        if let Some(step) = migration.first_irreversible_step() {
            return Err(Error::IrreversibleStep {
                migration: id.to_string(),
                step,
            });
        }

        info!(migration = id, "rolling back");
        self.atomically(|| {
            for (index, step) in migration.steps().iter().enumerate().rev() {
                for statement in step.backward() {
                    self.run_statement(id, index, statement)?;
                }
            }
            self.ledger.remove_entry(self.db, id)?;
            self.ledger.log_operation(self.db, id, Operation::Rollback)
        })
        .inspect_err(|e| error!(migration = id, "rollback failed: {e}"))?;
        info!(migration = id, "rolled back");
        Ok(())
    }

    /// Roll back and re-apply the most recently applied migration.
    pub fn reapply(&self, id: &str) -> Result<usize> {
        let _guard = self.lock.acquire(self.db)?;
        self.ledger.ensure(self.db)?;
        self.rollback_one(id)?;
        let migration = self.declared(id)?;
        self.apply_one(migration)
    }

    /// Record `id` as applied without running it.
    pub fn mark(&self, id: &str) -> Result<()> {
        let migration = self.declared(id)?;
        self.plan()?;
        let _guard = self.lock.acquire(self.db)?;
        self.ledger.ensure(self.db)?;

        if self.ledger.is_applied(self.db, id)? {
            return Err(Error::AlreadyApplied(id.to_string()));
        }
        self.ensure_dependencies_applied(migration)?;

        let checksum = migration.checksum();
        self.atomically(|| {
            self.ledger
                .record_applied(self.db, id, Utc::now(), Some(&checksum))?;
            self.ledger.log_operation(self.db, id, Operation::Mark)
        })?;
        info!(migration = id, "marked as applied");
        Ok(())
    }

    /// Remove the ledger entry for `id` without running its rollback. Same
    /// ordering rules as [`Applier::rollback`].
    pub fn unmark(&self, id: &str) -> Result<()> {
        let _guard = self.lock.acquire(self.db)?;
        self.ledger.ensure(self.db)?;
        self.rollback_target(id)?;

        self.atomically(|| {
            self.ledger.remove_entry(self.db, id)?;
            self.ledger.log_operation(self.db, id, Operation::Unmark)
        })?;
        info!(migration = id, "unmarked");
        Ok(())
    }

    fn declared(&self, id: &str) -> Result<&'a Migration> {
        self.registry
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("unknown migration {id}")))
    }

    fn rollback_target(&self, id: &str) -> Result<&'a Migration> {
        let latest = self
            .ledger
            .latest(self.db)?
            .ok_or(Error::NothingToRollback)?;

        if !self.ledger.is_applied(self.db, id)? {
            return Err(Error::NotFound(format!("migration {id} is not applied")));
        }
        if latest.migration_id != id {
            return Err(Error::NotFound(format!(
                "migration {id} is not the most recently applied migration, roll back {} first",
                latest.migration_id
            )));
        }
        self.registry.get(id).ok_or_else(|| {
            Error::NotFound(format!("migration {id} is applied but no longer declared"))
        })
    }

    fn ensure_dependencies_applied(&self, migration: &Migration) -> Result<()> {
        for dep in migration.dependencies() {
            if !self.ledger.is_applied(self.db, dep)? {
                return Err(Error::Config(format!(
                    "cannot apply {}: dependency {dep} is not applied",
                    migration.id()
                )));
            }
        }
        Ok(())
    }

    fn ensure_unmodified(&self, entries: &[LedgerEntry]) -> Result<()> {
        self.warn_orphans(entries);
        for entry in entries {
            if let Some(migration) = self.registry.get(&entry.migration_id) {
                if is_modified(migration, entry) {
                    return Err(Error::Config(format!(
                        "migration {} was modified after it was applied, add a new migration instead",
                        entry.migration_id
                    )));
                }
            }
        }
        Ok(())
    }

    fn warn_orphans(&self, entries: &[LedgerEntry]) {
        for entry in entries {
            if !self.registry.contains(&entry.migration_id) {
                warn!(
                    migration = entry.migration_id.as_str(),
                    "ledger entry has no matching migration definition"
                );
            }
        }
    }

    fn apply_migration(&self, migration: &Migration) -> Result<usize> {
        let id = migration.id();
        info!(migration = id, steps = migration.steps().len(), "applying");

        let checksum = migration.checksum();
        let executed = self
            .atomically(|| {
                let mut executed = 0;
                for (index, step) in migration.steps().iter().enumerate() {
                    for statement in step.forward() {
                        self.run_statement(id, index, statement)?;
                        executed += 1;
                    }
                }
                self.ledger
                    .record_applied(self.db, id, Utc::now(), Some(&checksum))?;
                self.ledger.log_operation(self.db, id, Operation::Apply)?;
                Ok(executed)
            })
            .inspect_err(|e| {
                error!(migration = id, "migration failed: {e}");
                if !self.db.transactional_ddl() {
                    warn!(
                        migration = id,
                        "database has no transactional DDL, earlier steps of this migration may remain"
                    );
                }
            })?;

        info!(migration = id, statements = executed, "applied");
        Ok(executed)
    }

    fn run_statement(&self, id: &str, step: usize, statement: &str) -> Result<()> {
        debug!(migration = id, step, "executing statement");
        self.db.execute(statement).map_err(|e| Error::Execution {
            migration: id.to_string(),
            step,
            statement: statement.to_string(),
            message: match e {
                Error::Database(message) | Error::Constraint(message) => message,
                other => other.to_string(),
            },
        })
    }

    /// Run `f` in a transaction when the backend supports transactional DDL.
    /// Otherwise run it as is; callers write the ledger last so a failure
    /// never leaves an entry behind.
    fn atomically<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let transactional = self.db.transactional_ddl();
        if transactional {
            self.db.begin()?;
        }

        match f() {
            Ok(value) => {
                if transactional {
                    self.db.commit()?;
                }
                Ok(value)
            }
            Err(e) => {
                if transactional {
                    if let Err(rollback_err) = self.db.rollback() {
                        warn!("failed to roll back transaction: {rollback_err}");
                    }
                }
                Err(e)
            }
        }
    }
}

fn is_modified(migration: &Migration, entry: &LedgerEntry) -> bool {
    entry
        .checksum
        .as_deref()
        .is_some_and(|sum| sum != migration.checksum())
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use super::*;
    use crate::database::{Row, SqliteDatabase};
    use crate::migrations::Step;

    /// Wraps a real database, recording every batch statement and optionally
    /// refusing transactions.
    struct Recording<'a> {
        inner: &'a SqliteDatabase,
        statements: RefCell<Vec<String>>,
        begins: Cell<usize>,
        transactional: bool,
    }

    impl<'a> Recording<'a> {
        fn new(inner: &'a SqliteDatabase, transactional: bool) -> Self {
            Self {
                inner,
                statements: RefCell::new(Vec::new()),
                begins: Cell::new(0),
                transactional,
            }
        }

        /// Statements that came from migration steps rather than bookkeeping.
        fn migration_statements(&self) -> Vec<String> {
            self.statements
                .borrow()
                .iter()
                .filter(|s| !s.trim_start().starts_with("CREATE TABLE IF NOT EXISTS"))
                .cloned()
                .collect()
        }
    }

    impl Database for Recording<'_> {
        fn execute(&self, sql: &str) -> Result<()> {
            self.statements.borrow_mut().push(sql.to_string());
            self.inner.execute(sql)
        }

        fn execute_params(&self, sql: &str, params: &[&str]) -> Result<usize> {
            self.inner.execute_params(sql, params)
        }

        fn query(&self, sql: &str, params: &[&str]) -> Result<Vec<Row>> {
            self.inner.query(sql, params)
        }

        fn begin(&self) -> Result<()> {
            if !self.transactional {
                return Err(Error::Other("transactions are not supported".into()));
            }
            self.begins.set(self.begins.get() + 1);
            self.inner.begin()
        }

        fn commit(&self) -> Result<()> {
            self.inner.commit()
        }

        fn rollback(&self) -> Result<()> {
            self.inner.rollback()
        }

        fn transactional_ddl(&self) -> bool {
            self.transactional
        }

        fn has_table(&self, name: &str) -> Result<bool> {
            self.inner.has_table(name)
        }
    }

    fn step(forward: &str, backward: &str) -> Step {
        Step::new([forward], [backward]).unwrap()
    }

    fn m1() -> Migration {
        Migration::new("M1")
            .step(step("CREATE TABLE t (a INTEGER)", "DROP TABLE t"))
            .step(step("CREATE UNIQUE INDEX uk_t_a ON t (a)", "DROP INDEX uk_t_a"))
    }

    fn m2() -> Migration {
        Migration::new("M2")
            .depends_on("M1")
            .step(step(
                "ALTER TABLE t ADD COLUMN b TEXT",
                "ALTER TABLE t DROP COLUMN b",
            ))
    }

    fn m3() -> Migration {
        Migration::new("M3").depends_on("M2").step(step(
            "DROP INDEX uk_t_a",
            "CREATE UNIQUE INDEX uk_t_a ON t (a)",
        ))
    }

    fn registry(migrations: Vec<Migration>) -> Registry {
        let mut registry = Registry::new();
        for m in migrations {
            registry.register(m).unwrap();
        }
        registry
    }

    fn ledger_ids(db: &dyn Database) -> Vec<String> {
        Ledger::default()
            .entries(db)
            .unwrap()
            .into_iter()
            .map(|e| e.migration_id)
            .collect()
    }

    fn object_exists(db: &dyn Database, name: &str) -> bool {
        !db.query("SELECT 1 FROM sqlite_master WHERE name = ?1", &[name])
            .unwrap()
            .is_empty()
    }

    /// Columns and indexes of every user table, for comparing schemas.
    fn schema_snapshot(db: &dyn Database) -> Vec<String> {
        let tables = db
            .query(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '\\_pageflow%' ESCAPE '\\'
                 ORDER BY name",
                &[],
            )
            .unwrap();

        let mut out = Vec::new();
        for table in tables {
            let name = table[0].clone().unwrap();
            for col in db
                .query(
                    "SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid",
                    &[name.as_str()],
                )
                .unwrap()
            {
                out.push(format!("{name}.column {col:?}"));
            }
            for idx in db
                .query(
                    "SELECT name, \"unique\" FROM pragma_index_list(?1) ORDER BY name",
                    &[name.as_str()],
                )
                .unwrap()
            {
                out.push(format!("{name}.index {idx:?}"));
            }
        }
        out
    }

    #[test]
    fn applies_in_dependency_order_and_rolls_back_only_the_latest() {
        let db = SqliteDatabase::in_memory().unwrap();
        let registry = registry(vec![m3(), m1(), m2()]);
        let applier = Applier::new(&db, &registry);

        let report = applier.apply_pending().unwrap();
        assert_eq!(report.applied, ["M1", "M2", "M3"]);
        assert!(report.skipped.is_empty());
        assert_eq!(report.statements_executed, 4);
        assert_eq!(ledger_ids(&db), ["M1", "M2", "M3"]);
        assert!(!object_exists(&db, "uk_t_a"));

        applier.rollback("M3").unwrap();
        assert_eq!(ledger_ids(&db), ["M1", "M2"]);
        assert!(object_exists(&db, "uk_t_a"));

        let err = applier.rollback("M1").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)), "got {err:?}");
        assert!(err.to_string().contains("roll back M2 first"));
        assert_eq!(ledger_ids(&db), ["M1", "M2"]);
    }

    #[test]
    fn second_apply_runs_nothing() {
        let sqlite = SqliteDatabase::in_memory().unwrap();
        let db = Recording::new(&sqlite, true);
        let registry = registry(vec![m1(), m2(), m3()]);
        let applier = Applier::new(&db, &registry);

        applier.apply_pending().unwrap();
        let statements_after_first = db.migration_statements().len();
        let begins_after_first = db.begins.get();
        assert_eq!(statements_after_first, 4);

        let report = applier.apply_pending().unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(report.skipped, ["M1", "M2", "M3"]);
        assert_eq!(report.statements_executed, 0);
        assert_eq!(db.migration_statements().len(), statements_after_first);
        assert_eq!(db.begins.get(), begins_after_first);
        assert_eq!(ledger_ids(&sqlite).len(), 3);
    }

    #[test]
    fn apply_then_rollback_restores_the_schema() {
        let db = SqliteDatabase::in_memory().unwrap();
        let empty = schema_snapshot(&db);

        let only_m1 = registry(vec![m1()]);
        Applier::new(&db, &only_m1).apply_pending().unwrap();
        let after_m1 = schema_snapshot(&db);
        assert_ne!(after_m1, empty);

        let all = registry(vec![m1(), m2(), m3()]);
        let applier = Applier::new(&db, &all);
        applier.apply_pending().unwrap();
        assert_ne!(schema_snapshot(&db), after_m1);

        applier.rollback("M3").unwrap();
        applier.rollback("M2").unwrap();
        assert_eq!(schema_snapshot(&db), after_m1);

        applier.rollback("M1").unwrap();
        assert_eq!(schema_snapshot(&db), empty);
        assert!(ledger_ids(&db).is_empty());
    }

    #[test]
    fn failed_step_rolls_back_the_migration_and_stops_the_run() {
        let db = SqliteDatabase::in_memory().unwrap();
        let broken = Migration::new("M2")
            .depends_on("M1")
            .step(step("CREATE TABLE x (a INTEGER)", "DROP TABLE x"))
            .step(step("INSERT INTO missing VALUES (1)", "SELECT 1"));
        let registry = registry(vec![m1(), broken, m3()]);

        let err = Applier::new(&db, &registry).apply_pending().unwrap_err();
        match err {
            Error::Execution {
                migration,
                step,
                statement,
                message,
            } => {
                assert_eq!(migration, "M2");
                assert_eq!(step, 1);
                assert_eq!(statement, "INSERT INTO missing VALUES (1)");
                assert!(message.contains("missing"), "{message}");
            }
            other => panic!("expected execution error, got {other:?}"),
        }

        assert_eq!(ledger_ids(&db), ["M1"]);
        assert!(!object_exists(&db, "x"));
        // M3 never ran, so the unique index from M1 is still there.
        assert!(object_exists(&db, "uk_t_a"));
    }

    #[test]
    fn without_transactional_ddl_the_ledger_is_written_last() {
        let sqlite = SqliteDatabase::in_memory().unwrap();
        let db = Recording::new(&sqlite, false);
        let broken = Migration::new("M2")
            .depends_on("M1")
            .step(step("CREATE TABLE x (a INTEGER)", "DROP TABLE x"))
            .step(step("INSERT INTO missing VALUES (1)", "SELECT 1"));
        let registry = registry(vec![m1(), broken, m3()]);

        let err = Applier::new(&db, &registry).apply_pending().unwrap_err();
        assert!(matches!(err, Error::Execution { step: 1, .. }));
        assert_eq!(db.begins.get(), 0);
        assert_eq!(ledger_ids(&sqlite), ["M1"]);
        // Without transactions the first step stays behind.
        assert!(object_exists(&sqlite, "x"));
        assert!(
            !db.migration_statements()
                .iter()
                .any(|s| s.contains("DROP INDEX uk_t_a"))
        );
    }

    #[test]
    fn irreversible_step_blocks_rollback_before_anything_runs() {
        let db = SqliteDatabase::in_memory().unwrap();
        let migration = Migration::new("M1")
            .step(step("CREATE TABLE t (a INTEGER)", "DROP TABLE t"))
            .step(Step::irreversible(["INSERT INTO t VALUES (1)"]).unwrap());
        let registry = registry(vec![migration]);
        let applier = Applier::new(&db, &registry);
        applier.apply_pending().unwrap();

        let err = applier.rollback("M1").unwrap_err();
        assert!(
            matches!(err, Error::IrreversibleStep { ref migration, step: 1 } if migration == "M1"),
            "got {err:?}"
        );
        assert!(object_exists(&db, "t"));
        assert_eq!(ledger_ids(&db), ["M1"]);
    }

    #[test]
    fn rollback_requires_an_applied_migration() {
        let db = SqliteDatabase::in_memory().unwrap();
        let registry = registry(vec![m1(), m2()]);
        let applier = Applier::new(&db, &registry);

        assert!(matches!(
            applier.rollback("M1").unwrap_err(),
            Error::NothingToRollback
        ));
        assert!(matches!(
            applier.rollback_latest().unwrap_err(),
            Error::NothingToRollback
        ));

        applier.apply("M1").unwrap();
        let err = applier.rollback("M2").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(err.to_string().contains("M2 is not applied"));

        assert_eq!(applier.rollback_latest().unwrap(), "M1");
        assert!(ledger_ids(&db).is_empty());
    }

    #[test]
    fn apply_single_checks_state_and_dependencies() {
        let db = SqliteDatabase::in_memory().unwrap();
        let registry = registry(vec![m1(), m2()]);
        let applier = Applier::new(&db, &registry);

        let err = applier.apply("M2").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("dependency M1 is not applied"));

        assert_eq!(applier.apply("M1").unwrap(), 2);
        assert!(matches!(
            applier.apply("M1").unwrap_err(),
            Error::AlreadyApplied(ref id) if id == "M1"
        ));
        assert!(matches!(
            applier.apply("M9").unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn mark_and_unmark_touch_only_the_ledger() {
        let db = SqliteDatabase::in_memory().unwrap();
        let registry = registry(vec![m1(), m2()]);
        let applier = Applier::new(&db, &registry);

        applier.mark("M1").unwrap();
        assert_eq!(ledger_ids(&db), ["M1"]);
        assert!(!object_exists(&db, "t"));
        assert!(matches!(
            applier.mark("M1").unwrap_err(),
            Error::AlreadyApplied(_)
        ));

        applier.unmark("M1").unwrap();
        assert!(ledger_ids(&db).is_empty());

        let history = applier.ledger().history(&db, 10).unwrap();
        let ops: Vec<Operation> = history.iter().map(|h| h.operation).collect();
        assert_eq!(ops, [Operation::Unmark, Operation::Mark]);
    }

    #[test]
    fn reapply_runs_rollback_then_apply() {
        let db = SqliteDatabase::in_memory().unwrap();
        let registry = registry(vec![m1(), m2()]);
        let applier = Applier::new(&db, &registry);
        applier.apply_pending().unwrap();

        assert_eq!(applier.reapply("M2").unwrap(), 1);
        assert_eq!(ledger_ids(&db), ["M1", "M2"]);

        let ops: Vec<(String, Operation)> = applier
            .ledger()
            .history(&db, 2)
            .unwrap()
            .into_iter()
            .map(|h| (h.migration_id, h.operation))
            .collect();
        assert_eq!(
            ops,
            [
                ("M2".to_string(), Operation::Apply),
                ("M2".to_string(), Operation::Rollback)
            ]
        );

        assert!(matches!(
            applier.reapply("M1").unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn status_reports_pending_applied_and_modified() {
        let db = SqliteDatabase::in_memory().unwrap();
        let original = registry(vec![m1(), m2()]);
        Applier::new(&db, &original).apply("M1").unwrap();

        let states: Vec<(String, MigrationState)> = Applier::new(&db, &original)
            .status()
            .unwrap()
            .into_iter()
            .map(|s| (s.id, s.state))
            .collect();
        assert_eq!(
            states,
            [
                ("M1".to_string(), MigrationState::Applied),
                ("M2".to_string(), MigrationState::Pending)
            ]
        );

        let edited_m1 = Migration::new("M1")
            .step(step("CREATE TABLE t (a INTEGER, z TEXT)", "DROP TABLE t"));
        let edited = registry(vec![edited_m1, m2()]);
        let applier = Applier::new(&db, &edited);

        let status = applier.status().unwrap();
        assert_eq!(status[0].state, MigrationState::Modified);
        assert!(status[0].applied_at.is_some());

        let err = applier.apply_pending().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("M1 was modified"));
        assert_eq!(ledger_ids(&db), ["M1"]);
    }

    #[test]
    fn single_apply_refuses_when_an_applied_migration_was_edited() {
        let db = SqliteDatabase::in_memory().unwrap();
        Applier::new(&db, &registry(vec![m1(), m2()]))
            .apply("M1")
            .unwrap();

        let edited_m1 = Migration::new("M1")
            .step(step("CREATE TABLE t (a INTEGER, z TEXT)", "DROP TABLE t"));
        let edited = registry(vec![edited_m1, m2()]);

        let err = Applier::new(&db, &edited).apply("M2").unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {err:?}");
        assert!(err.to_string().contains("M1 was modified"));
        assert_eq!(ledger_ids(&db), ["M1"]);
    }

    #[test]
    fn bad_graph_fails_before_touching_the_database() {
        let db = SqliteDatabase::in_memory().unwrap();
        let registry = registry(vec![
            Migration::new("A")
                .depends_on("B")
                .step(step("CREATE TABLE a (x INTEGER)", "DROP TABLE a")),
            Migration::new("B")
                .depends_on("A")
                .step(step("CREATE TABLE b (x INTEGER)", "DROP TABLE b")),
        ]);

        let err = Applier::new(&db, &registry).apply_pending().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!object_exists(&db, "_pageflow_migrations"));
        assert!(!object_exists(&db, "a"));
    }

    #[test]
    fn held_lock_rejects_a_concurrent_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pageflow.db");
        let holder = SqliteDatabase::open(&path).unwrap();
        let runner = SqliteDatabase::open(&path).unwrap();

        let lock = MigrationLock::default();
        let _held = lock.acquire(&holder).unwrap();

        let registry = registry(vec![m1()]);
        let err = Applier::new(&runner, &registry).apply_pending().unwrap_err();
        assert!(matches!(err, Error::ConcurrentMigration(_)), "got {err:?}");
        assert!(!object_exists(&runner, "_pageflow_migrations"));
        assert!(!object_exists(&runner, "t"));
    }

    #[test]
    fn run_midway_through_a_migration_is_reported_without_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pageflow.db");
        let holder = SqliteDatabase::open(&path).unwrap();
        let runner =
            SqliteDatabase::open_with_timeout(&path, std::time::Duration::from_secs(5)).unwrap();
        let registry = registry(vec![m1()]);

        // The holder is inside a migration transaction while owning the lock.
        let lock = MigrationLock::default();
        let _held = lock.acquire(&holder).unwrap();
        holder.begin().unwrap();
        holder.execute("CREATE TABLE mid (a INTEGER)").unwrap();

        let started = std::time::Instant::now();
        let err = Applier::new(&runner, &registry).apply_pending().unwrap_err();
        assert!(matches!(err, Error::ConcurrentMigration(_)), "got {err:?}");
        assert!(
            started.elapsed() < std::time::Duration::from_secs(2),
            "waited {:?}",
            started.elapsed()
        );

        holder.rollback().unwrap();
    }

    #[test]
    fn custom_tables_are_honoured() {
        let db = SqliteDatabase::in_memory().unwrap();
        let registry = registry(vec![m1()]);
        let applier = Applier::new(&db, &registry)
            .with_ledger(Ledger::new("schema_ledger", "schema_log"))
            .with_lock(MigrationLock::new("schema_lock"));

        applier.apply_pending().unwrap();
        assert!(object_exists(&db, "schema_ledger"));
        assert!(object_exists(&db, "schema_lock"));
        assert!(!object_exists(&db, "_pageflow_migrations"));
        assert_eq!(applier.pending().unwrap().len(), 0);
    }
}
