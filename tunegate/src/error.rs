//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Store error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Store error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Stale write for {entity_type} {id}: epoch {expected} is no longer current")]
    CasConflict {
        entity_type: &'static str,
        id: String,
        expected: u64,
    },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound {
        entity_type: &'static str,
        id: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("All tuner slots are leased")]
    TunerBusy,

    #[error("Lease is expired or no longer held by this session")]
    LeaseExpired,

    #[error("Receiver error: {0}")]
    Receiver(#[from] enigma2::Enigma2Error),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(entity_type: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type,
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn pipeline(msg: impl Into<String>) -> Self {
        Self::Pipeline(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// True for transient store failures that callers may retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::DatabaseSqlx(_) | Self::Storage(_))
    }

    /// True when a store write lost a race it can win on a prompt retry:
    /// the SQLite write lock was held (SQLITE_BUSY / SQLITE_LOCKED /
    /// SQLITE_BUSY_SNAPSHOT) or the connection pool was exhausted.
    pub fn is_store_contention(&self) -> bool {
        match self {
            Self::DatabaseSqlx(sqlx::Error::PoolTimedOut) => true,
            Self::DatabaseSqlx(sqlx::Error::Database(db)) => {
                matches!(db.code().as_deref(), Some("5") | Some("6") | Some("517"))
            }
            _ => false,
        }
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<redb::TableError> for Error {
    fn from(e: redb::TableError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<redb::StorageError> for Error {
    fn from(e: redb::StorageError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<redb::CommitError> for Error {
    fn from(e: redb::CommitError) -> Self {
        Self::Storage(e.to_string())
    }
}
