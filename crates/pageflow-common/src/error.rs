use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    /// Another connection holds the write lock on the database.
    #[error("database is busy: {0}")]
    Busy(String),

    /// A uniqueness or check constraint rejected a write.
    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("migration {migration} step {step} failed on `{statement}`: {message}")]
    Execution {
        migration: String,
        step: usize,
        statement: String,
        message: String,
    },

    #[error("migration {migration} step {step} has no rollback statements")]
    IrreversibleStep { migration: String, step: usize },

    #[error("ledger already has an entry for {0}")]
    DuplicateEntry(String),

    #[error("migration {0} is already applied")]
    AlreadyApplied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("nothing to roll back: no migrations are applied")]
    NothingToRollback,

    #[error("another migration run is in progress: {0}")]
    ConcurrentMigration(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}
