//! Database connection management and the ledger store
//!
//! - [`queries`] - repository trait implemented per backend
//! - [`store`] - transaction executor, transfers, registration
//! - [`postgres`] / [`memory`] - backends

pub mod error;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod queries;
pub mod schema;
pub mod store;

pub use error::StoreError;
pub use memory::{FaultPoint, MemoryDatabase};
pub use models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, CreateUserParams, CreateVerifyEmailParams, Entry, Transfer, User,
    VerifyEmail,
};
pub use queries::{Backend, Queries, Transaction};
pub use store::{
    AfterCreate, CreateUserTxResult, Store, TransferTxParams, TransferTxResult,
    VerifyEmailTxParams, VerifyEmailTxResult,
};

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::config::DatabaseConfig;

/// PostgreSQL database connection pool
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    pub async fn connect(database_url: &str, config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(database_url)
            .await?;

        tracing::info!(
            max_connections = config.max_connections,
            "PostgreSQL connection pool established"
        );
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Extension trait for safe row access with logging
pub trait SafeRow {
    /// Try to get a value from a column, log error and return None if it fails
    fn try_get_log<'r, T>(&'r self, column: &str) -> Option<T>
    where
        T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>;
}

impl SafeRow for sqlx::postgres::PgRow {
    fn try_get_log<'r, T>(&'r self, column: &str) -> Option<T>
    where
        T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
    {
        use sqlx::Row;
        match self.try_get(column) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::error!("Failed to read column '{}': {}", column, e);
                None
            }
        }
    }
}
