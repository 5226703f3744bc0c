//! Store Error Types
//!
//! One taxonomy for every repository and transaction failure:
//! not-found, constraint violations, transient infrastructure failures and
//! caller errors. Constraint violations are client-correctable; everything
//! else is reported to clients as an opaque internal failure.

use thiserror::Error;

/// PostgreSQL SQLSTATE codes the store distinguishes.
pub mod sqlstate {
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const FOREIGN_KEY_VIOLATION: &str = "23503";
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";
    pub const LOCK_NOT_AVAILABLE: &str = "55P03";
    pub const QUERY_CANCELED: &str = "57014";
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("unique violation: {0}")]
    UniqueViolation(String),

    #[error("foreign key violation: {0}")]
    ForeignKeyViolation(String),

    #[error("transient database error: {0}")]
    Transient(String),

    #[error("transaction deadline exceeded")]
    DeadlineExceeded,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("after create hook failed: {0:#}")]
    AfterCreate(anyhow::Error),

    #[error("database error: {0}")]
    Database(String),

    /// The unit of work failed and so did the rollback.
    #[error("tx err: {tx}, rb err: {rollback}")]
    Rollback {
        tx: Box<StoreError>,
        rollback: Box<StoreError>,
    },
}

impl StoreError {
    /// The unit-of-work error, looking through a failed rollback.
    pub fn root(&self) -> &StoreError {
        match self {
            StoreError::Rollback { tx, .. } => tx.root(),
            other => other,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound => "NOT_FOUND",
            StoreError::UniqueViolation(_) => "ALREADY_EXISTS",
            StoreError::ForeignKeyViolation(_) => "FOREIGN_KEY_VIOLATION",
            StoreError::Transient(_) => "UNAVAILABLE",
            StoreError::DeadlineExceeded => "DEADLINE_EXCEEDED",
            StoreError::InvalidArgument(_) => "INVALID_ARGUMENT",
            StoreError::AfterCreate(_) | StoreError::Database(_) => "INTERNAL",
            StoreError::Rollback { tx, .. } => tx.code(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), StoreError::NotFound)
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self.root(), StoreError::UniqueViolation(_))
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            StoreError::Transient(_) | StoreError::DeadlineExceeded | StoreError::NotFound
        )
    }

    /// Errors the client can fix by changing the request.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self.root(),
            StoreError::UniqueViolation(_)
                | StoreError::ForeignKeyViolation(_)
                | StoreError::InvalidArgument(_)
                | StoreError::NotFound
        )
    }

    /// Message safe to show to a client. Internal detail is never leaked.
    pub fn public_message(&self) -> String {
        match self.root() {
            StoreError::NotFound => "record not found".to_string(),
            StoreError::UniqueViolation(_) => "record already exists".to_string(),
            StoreError::ForeignKeyViolation(_) => "referenced record does not exist".to_string(),
            StoreError::InvalidArgument(msg) => msg.clone(),
            _ => "internal error".to_string(),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(db_err) => {
                let constraint = db_err.constraint().unwrap_or_default().to_string();
                match db_err.code().as_deref() {
                    Some(sqlstate::UNIQUE_VIOLATION) => StoreError::UniqueViolation(constraint),
                    Some(sqlstate::FOREIGN_KEY_VIOLATION) => {
                        StoreError::ForeignKeyViolation(constraint)
                    }
                    Some(
                        sqlstate::SERIALIZATION_FAILURE
                        | sqlstate::DEADLOCK_DETECTED
                        | sqlstate::LOCK_NOT_AVAILABLE
                        | sqlstate::QUERY_CANCELED,
                    ) => StoreError::Transient(db_err.message().to_string()),
                    _ => StoreError::Database(db_err.to_string()),
                }
            }
            sqlx::Error::Io(e) => StoreError::Transient(e.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
                StoreError::Transient(e.to_string())
            }
            other => StoreError::Database(other.to_string()),
        }
    }
}
