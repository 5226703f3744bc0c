//! Worker Error Types

use thiserror::Error;
use uuid::Uuid;

/// Outcome of a failed handler run.
#[derive(Error, Debug)]
pub enum TaskError {
    /// Transient failure: requeue with backoff while budget remains
    #[error("{0:#}")]
    Retry(anyhow::Error),

    /// Retrying cannot help (e.g. malformed payload): archive now
    #[error("skip retry: {0:#}")]
    SkipRetry(anyhow::Error),
}

impl TaskError {
    pub fn retry(err: impl Into<anyhow::Error>) -> Self {
        TaskError::Retry(err.into())
    }

    pub fn skip_retry(err: impl Into<anyhow::Error>) -> Self {
        TaskError::SkipRetry(err.into())
    }

    pub fn is_skip_retry(&self) -> bool {
        matches!(self, TaskError::SkipRetry(_))
    }
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Failed to serialize task payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    /// The claim was recovered or taken over by another worker.
    #[error("Task lease lost: {0}")]
    LeaseLost(Uuid),

    #[error("Corrupt task record: {0}")]
    CorruptRecord(String),
}

impl From<sqlx::Error> for BrokerError {
    fn from(e: sqlx::Error) -> Self {
        BrokerError::DatabaseError(e.to_string())
    }
}
