pub mod applier;
pub mod database;
pub mod ledger;
pub mod lock;
pub mod migrations;
pub mod resolver;
pub mod schema;
pub mod source;

pub use applier::{Applier, ApplyReport, MigrationState, MigrationStatus};
pub use database::{Database, Row, SqliteDatabase};
pub use ledger::{Ledger, LedgerEntry, LogEntry, Operation};
pub use lock::{LockGuard, MigrationLock};
pub use migrations::{Migration, Registry, Step};
pub use resolver::resolve;
