//! Error types for unimem.

use std::fmt;
use thiserror::Error;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Result type returned by storage adapters.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// The storage engine an adapter fronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    Relational,
    Vector,
    Graph,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Relational => "relational",
            Engine::Vector => "vector",
            Engine::Graph => "graph",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of an adapter failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Timeout, lock contention or similar; worth retrying.
    Transient,
    /// The addressed record does not exist.
    NotFound,
    /// Corruption, constraint violations, I/O failures.
    Permanent,
    /// The caller cancelled the operation or its deadline passed.
    Cancelled,
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StorageErrorKind::Transient => "transient",
            StorageErrorKind::NotFound => "not found",
            StorageErrorKind::Permanent => "permanent",
            StorageErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A failure reported by one storage adapter.
#[derive(Debug, Clone, Error)]
#[error("{engine} storage error ({kind}): {message}")]
pub struct StorageError {
    pub engine: Engine,
    pub kind: StorageErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn new(engine: Engine, kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Self {
            engine,
            kind,
            message: message.into(),
        }
    }

    pub fn transient(engine: Engine, message: impl Into<String>) -> Self {
        Self::new(engine, StorageErrorKind::Transient, message)
    }

    pub fn not_found(engine: Engine, message: impl Into<String>) -> Self {
        Self::new(engine, StorageErrorKind::NotFound, message)
    }

    pub fn permanent(engine: Engine, message: impl Into<String>) -> Self {
        Self::new(engine, StorageErrorKind::Permanent, message)
    }

    pub fn cancelled(engine: Engine) -> Self {
        Self::new(engine, StorageErrorKind::Cancelled, "operation cancelled")
    }

    pub fn is_transient(&self) -> bool {
        self.kind == StorageErrorKind::Transient
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == StorageErrorKind::NotFound
    }

    /// Map a SQLite error, treating busy/locked databases as transient.
    pub fn from_sqlite(engine: Engine, err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if matches!(
                    code.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                Self::transient(engine, err.to_string())
            }
            rusqlite::Error::QueryReturnedNoRows => Self::not_found(engine, err.to_string()),
            _ => Self::permanent(engine, err.to_string()),
        }
    }
}

/// unimem error types.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad instance location or unusable configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invalid, missing or conflicting type definitions
    #[error("Schema error: {0}")]
    Schema(String),

    /// Instance data violates its schema
    #[error("Validation error: {0}")]
    Validation(String),

    /// Embedding model or dimension problems
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Malformed or unexecutable query
    #[error("Query error: {message}")]
    Query {
        message: String,
        #[source]
        source: Option<StorageError>,
    },

    /// Adapter failure outside of a query
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A cross-store write partially succeeded and compensation failed
    #[error("Consistency risk in {store} store for {id}: {reason}")]
    ConsistencyRisk {
        store: Engine,
        id: String,
        reason: String,
    },

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    pub fn query(message: impl Into<String>) -> Self {
        Error::Query {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap an adapter failure raised while executing a query.
    pub fn query_storage(err: StorageError) -> Self {
        Error::Query {
            message: format!("{} adapter failed", err.engine),
            source: Some(err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Storage(e) => e.is_not_found(),
            _ => false,
        }
    }
}
