use std::fmt;
use std::io;

use strata::StorageError;

/// Errors surfaced to the client, spanning parse/semantic analysis,
/// integrity constraints, transactions and storage.
#[derive(Debug)]
pub enum QueryError {
    // Parse / semantic.
    Parse(String),
    TableNotFound(String),
    ColumnNotFound(String),
    AmbiguousColumn(String),
    IncompatibleType { expected: String, found: String },
    InvalidValueCount,
    StringOverflow,
    InvalidDatetime(String),
    Planning(String),

    // Integrity.
    UniqueConstraint,
    TableExists(String),
    IndexExists(String),
    IndexNotFound(String),
    DatabaseExists(String),
    DatabaseNotFound(String),

    // Transaction.
    TransactionAborted,

    // Storage and below.
    Storage(StorageError),

    Internal(String),
}

pub type QueryResult<T> = Result<T, QueryError>;

impl QueryError {
    /// Transaction aborts get the dedicated `abort` reply; everything
    /// else is reported as a failure.
    pub fn is_abort(&self) -> bool {
        matches!(self, QueryError::TransactionAborted)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::Parse(msg) => write!(f, "syntax error: {}", msg),
            QueryError::TableNotFound(name) => write!(f, "table does not exist: {}", name),
            QueryError::ColumnNotFound(name) => write!(f, "column does not exist: {}", name),
            QueryError::AmbiguousColumn(name) => write!(f, "ambiguous column: {}", name),
            QueryError::IncompatibleType { expected, found } => {
                write!(f, "incompatible types: expected {}, found {}", expected, found)
            }
            QueryError::InvalidValueCount => write!(f, "invalid value count"),
            QueryError::StringOverflow => write!(f, "string exceeds column width"),
            QueryError::InvalidDatetime(s) => write!(f, "invalid datetime value: {}", s),
            QueryError::Planning(msg) => write!(f, "cannot plan query: {}", msg),
            QueryError::UniqueConstraint => write!(f, "unique constraint violation"),
            QueryError::TableExists(name) => write!(f, "table already exists: {}", name),
            QueryError::IndexExists(name) => write!(f, "index already exists: {}", name),
            QueryError::IndexNotFound(name) => write!(f, "index does not exist: {}", name),
            QueryError::DatabaseExists(name) => write!(f, "database already exists: {}", name),
            QueryError::DatabaseNotFound(name) => write!(f, "database does not exist: {}", name),
            QueryError::TransactionAborted => write!(f, "abort"),
            QueryError::Storage(e) => write!(f, "{}", e),
            QueryError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for QueryError {}

impl From<StorageError> for QueryError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::UniqueConstraint => QueryError::UniqueConstraint,
            StorageError::DeadlockPrevention(_) => QueryError::TransactionAborted,
            other => QueryError::Storage(other),
        }
    }
}

impl From<io::Error> for QueryError {
    fn from(e: io::Error) -> Self {
        QueryError::Storage(StorageError::Io(e))
    }
}
