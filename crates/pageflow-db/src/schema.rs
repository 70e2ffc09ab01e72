//! Schema of the Pageflow snapshot database.
//!
//! `snapshots` keeps the extracted data of every monitored URL, `settings`
//! is a small key/value table for the viewer.

use pageflow_common::Result;

use crate::migrations::{Migration, Registry, Step};

pub const CREATE_SNAPSHOTS_AND_SETTINGS: &str = "0001_create_snapshots_and_settings";
pub const ADD_NOTIFIED_AT_TO_SNAPSHOTS: &str = "0002_add_notified_at_to_snapshots";
pub const REMOVE_UNIQUE_INDEX_FROM_SNAPSHOTS: &str = "0003_remove_unique_index_from_snapshots";

const CREATE_SNAPSHOTS_SQL: &str = "
CREATE TABLE snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    type TEXT NOT NULL DEFAULT 'default',
    data TEXT NOT NULL CHECK (json_valid(data)),
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
)";

const SNAPSHOTS_UPDATED_AT_TRIGGER_SQL: &str = "
CREATE TRIGGER snapshots_touch_updated_at
AFTER UPDATE ON snapshots
FOR EACH ROW WHEN NEW.updated_at = OLD.updated_at
BEGIN
    UPDATE snapshots SET updated_at = datetime('now') WHERE id = NEW.id;
END";

const CREATE_SETTINGS_SQL: &str = "
CREATE TABLE settings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL UNIQUE,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
)";

const SETTINGS_UPDATED_AT_TRIGGER_SQL: &str = "
CREATE TRIGGER settings_touch_updated_at
AFTER UPDATE ON settings
FOR EACH ROW WHEN NEW.updated_at = OLD.updated_at
BEGIN
    UPDATE settings SET updated_at = datetime('now') WHERE id = NEW.id;
END";

/// Creates `snapshots` (unique per url and type) and `settings`.
pub fn create_snapshots_and_settings() -> Result<Migration> {
    Ok(Migration::new(CREATE_SNAPSHOTS_AND_SETTINGS)
        .step(Step::new(
            [
                CREATE_SNAPSHOTS_SQL,
                "CREATE UNIQUE INDEX uk_url_type ON snapshots (url, type)",
                "CREATE INDEX idx_created_at ON snapshots (created_at)",
                "CREATE INDEX idx_type ON snapshots (type)",
                SNAPSHOTS_UPDATED_AT_TRIGGER_SQL,
            ],
            ["DROP TABLE IF EXISTS snapshots"],
        )?)
        .step(Step::new(
            [CREATE_SETTINGS_SQL, SETTINGS_UPDATED_AT_TRIGGER_SQL],
            ["DROP TABLE IF EXISTS settings"],
        )?))
}

/// Adds the time a snapshot was first notified about.
pub fn add_notified_at_to_snapshots() -> Result<Migration> {
    Ok(Migration::new(ADD_NOTIFIED_AT_TO_SNAPSHOTS)
        .depends_on(CREATE_SNAPSHOTS_AND_SETTINGS)
        .step(Step::new(
            ["ALTER TABLE snapshots ADD COLUMN notified_at TEXT NULL"],
            ["ALTER TABLE snapshots DROP COLUMN notified_at"],
        )?))
}

/// Drops the url/type uniqueness so history rows can be kept, and replaces it
/// with a plain lookup index.
pub fn remove_unique_index_from_snapshots() -> Result<Migration> {
    Ok(Migration::new(REMOVE_UNIQUE_INDEX_FROM_SNAPSHOTS)
        .depends_on(ADD_NOTIFIED_AT_TO_SNAPSHOTS)
        .step(Step::new(
            ["DROP INDEX uk_url_type"],
            ["CREATE UNIQUE INDEX uk_url_type ON snapshots (url, type)"],
        )?)
        .step(Step::new(
            ["CREATE INDEX idx_url_type ON snapshots (url, type)"],
            ["DROP INDEX idx_url_type"],
        )?))
}

/// All Pageflow migrations.
pub fn builtin_registry() -> Result<Registry> {
    Registry::new()
        .with(create_snapshots_and_settings()?)?
        .with(add_notified_at_to_snapshots()?)?
        .with(remove_unique_index_from_snapshots()?)
}
