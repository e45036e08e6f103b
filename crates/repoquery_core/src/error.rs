//! Error taxonomy for repository operations.
//!
//! # Responsibility
//! - Name every failure kind a caller can branch on.
//! - Classify SQLite result codes into semantic kinds.
//!
//! # Invariants
//! - `AmbiguousPredicate` and `Syntax` are only produced while a registry is
//!   being built. `UnresolvedField` is also raised for unknown sort keys.
//! - `LockTimeout` and `Deadlock` are the only retryable kinds; the layer
//!   never retries on its own.

use crate::db::DbError;
use rusqlite::ErrorCode;
use thiserror::Error;

pub type RepoResult<T> = Result<T, RepoError>;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("unresolved field `{token}` on entity `{entity}` in `{declaration}`")]
    UnresolvedField {
        entity: &'static str,
        declaration: String,
        token: String,
    },
    #[error("ambiguous predicate in `{declaration}`: And and Or cannot be mixed")]
    AmbiguousPredicate { declaration: String },
    #[error("syntax error in `{declaration}` at offset {offset}: {message}")]
    Syntax {
        declaration: String,
        offset: usize,
        message: String,
    },
    #[error(
        "parameter mismatch for `{query}`: missing [{}], unexpected [{}]",
        .missing.join(", "),
        .unexpected.join(", ")
    )]
    ParameterMismatch {
        query: String,
        missing: Vec<String>,
        unexpected: Vec<String>,
    },
    #[error("query `{query}` expected at most one row, got {rows}")]
    NotUnique { query: String, rows: usize },
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("lock timeout: {0}")]
    LockTimeout(String),
    #[error("deadlock: {0}")]
    Deadlock(String),
    #[error("statement aborted: deadline exceeded")]
    Timeout,
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("{entity} has no identity yet; the operation requires a managed entity")]
    TransientEntity { entity: &'static str },
    #[error("query `{query}` returns {declared}, but was invoked as {requested}")]
    ShapeMismatch {
        query: String,
        declared: &'static str,
        requested: &'static str,
    },
    #[error("transaction {tx_id} was aborted by an earlier failure; roll it back")]
    TransactionAborted { tx_id: String },
    #[error("invalid persisted data: {0}")]
    InvalidData(String),
    #[error(transparent)]
    Db(DbError),
}

impl RepoError {
    /// Whether the caller may retry the whole unit of work.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout(_) | Self::Deadlock(_))
    }

    /// Stable code used in log events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnresolvedField { .. } => "unresolved_field",
            Self::AmbiguousPredicate { .. } => "ambiguous_predicate",
            Self::Syntax { .. } => "syntax",
            Self::ParameterMismatch { .. } => "parameter_mismatch",
            Self::NotUnique { .. } => "not_unique",
            Self::NotFound { .. } => "not_found",
            Self::ConstraintViolation(_) => "constraint_violation",
            Self::LockTimeout(_) => "lock_timeout",
            Self::Deadlock(_) => "deadlock",
            Self::Timeout => "timeout",
            Self::Configuration(_) => "configuration",
            Self::TransientEntity { .. } => "transient_entity",
            Self::ShapeMismatch { .. } => "shape_mismatch",
            Self::TransactionAborted { .. } => "transaction_aborted",
            Self::InvalidData(_) => "invalid_data",
            Self::Db(_) => "db",
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        match value {
            DbError::Sqlite(err) => err.into(),
            other => Self::Db(other),
        }
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, message) = &err {
            let detail = message.clone().unwrap_or_else(|| failure.to_string());
            match failure.code {
                ErrorCode::ConstraintViolation => return Self::ConstraintViolation(detail),
                ErrorCode::DatabaseBusy => return Self::LockTimeout(detail),
                ErrorCode::DatabaseLocked => return Self::Deadlock(detail),
                ErrorCode::OperationInterrupted => return Self::Timeout,
                _ => {}
            }
        }
        Self::Db(DbError::Sqlite(err))
    }
}
