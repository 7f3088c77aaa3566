//! Error definitions for PolyDB

use thiserror::Error;

/// Represents errors that can occur during PolyDB operations.
///
/// # Example
/// ```rust
/// use polydb_common::DbError;
///
/// fn example() -> polydb_common::Result<()> {
///     Err(DbError::Constraint("key 7 already exists".into()))
/// }
///
/// match example() {
///     Ok(_) => println!("Success"),
///     Err(e) => println!("Error occurred: {e}"),
/// }
/// ```
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DbError {
    #[error("Invalid argument: {0}")]
    Argument(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("SQL parse error: {0}")]
    SqlParse(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Connection closed: {0}")]
    Closed(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    /// Get the inner message without the type prefix.
    /// Useful when re-wrapping errors to avoid "Internal error: Internal error: ..."
    pub fn message(&self) -> &str {
        match self {
            DbError::Argument(msg) => msg,
            DbError::Constraint(msg) => msg,
            DbError::InvalidState(msg) => msg,
            DbError::InvalidOperation(msg) => msg,
            DbError::NotImplemented(msg) => msg,
            DbError::SqlParse(msg) => msg,
            DbError::Internal(msg) => msg,
            DbError::Closed(msg) => msg,
        }
    }

    /// Get a short error kind name
    pub fn kind(&self) -> &'static str {
        match self {
            DbError::Argument(_) => "argument_error",
            DbError::Constraint(_) => "constraint_error",
            DbError::InvalidState(_) => "invalid_state",
            DbError::InvalidOperation(_) => "invalid_operation",
            DbError::NotImplemented(_) => "not_implemented",
            DbError::SqlParse(_) => "sql_parse_error",
            DbError::Internal(_) => "internal_error",
            DbError::Closed(_) => "closed",
        }
    }
}

/// Convert std::io::Error to DbError
///
/// Shortcut as the persistent backend surfaces plenty of these.
impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        DbError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Internal(format!("JSON: {err}"))
    }
}
