//! PostgreSQL task broker
//!
//! Tasks live in the `tasks` table next to the ledger. Claims use
//! `FOR UPDATE SKIP LOCKED` so concurrent workers never pick the same row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgRow;
use std::time::Duration;
use uuid::Uuid;

use super::broker::{Broker, LEASE_EXPIRED_ERROR};
use super::error::BrokerError;
use super::task::{MAX_SCHEDULE_DELAY, TaskInfo, TaskMessage, TaskState};
use crate::db::{Database, SafeRow};

const TASK_COLUMNS: &str = "id, task_type, payload, queue, max_retry, retried, last_error, \
                            state, process_at, lease_expires_at, created_at";

/// Matches a row only while it is still held by the claim in `$1..$3`.
const CLAIM_FENCE: &str =
    "id = $1 AND state = 'active' AND retried = $2 AND lease_expires_at = $3";

#[derive(Clone)]
pub struct PgBroker {
    pool: PgPool,
}

impl PgBroker {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    fn map_row(row: &PgRow) -> Result<TaskMessage, BrokerError> {
        let id: Uuid = row
            .try_get_log("id")
            .ok_or_else(|| BrokerError::CorruptRecord("id".into()))?;
        let corrupt = |column: &str| BrokerError::CorruptRecord(format!("task {} column {}", id, column));

        let state: String = row.try_get_log("state").ok_or_else(|| corrupt("state"))?;
        let state = TaskState::from_str_opt(&state).ok_or_else(|| corrupt("state"))?;
        let max_retry: i32 = row.try_get_log("max_retry").ok_or_else(|| corrupt("max_retry"))?;
        let retried: i32 = row.try_get_log("retried").ok_or_else(|| corrupt("retried"))?;

        Ok(TaskMessage {
            id,
            task_type: row.try_get_log("task_type").ok_or_else(|| corrupt("task_type"))?,
            payload: row.try_get_log("payload").ok_or_else(|| corrupt("payload"))?,
            queue: row.try_get_log("queue").ok_or_else(|| corrupt("queue"))?,
            max_retry: u32::try_from(max_retry).map_err(|_| corrupt("max_retry"))?,
            retried: u32::try_from(retried).map_err(|_| corrupt("retried"))?,
            last_error: row.try_get_log("last_error").unwrap_or(None),
            state,
            process_at: row.try_get_log("process_at").ok_or_else(|| corrupt("process_at"))?,
            lease_expires_at: row.try_get_log("lease_expires_at").unwrap_or(None),
            created_at: row.try_get_log("created_at").ok_or_else(|| corrupt("created_at"))?,
        })
    }

    fn to_i32(value: u32) -> i32 {
        i32::try_from(value).unwrap_or(i32::MAX)
    }

    fn expect_claimed(id: Uuid, rows_affected: u64) -> Result<(), BrokerError> {
        if rows_affected == 0 {
            return Err(BrokerError::LeaseLost(id));
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for PgBroker {
    async fn enqueue(&self, msg: TaskMessage) -> Result<TaskInfo, BrokerError> {
        sqlx::query(
            r#"INSERT INTO tasks
               (id, task_type, payload, queue, max_retry, retried, state, process_at, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"#,
        )
        .bind(msg.id)
        .bind(&msg.task_type)
        .bind(&msg.payload)
        .bind(&msg.queue)
        .bind(Self::to_i32(msg.max_retry))
        .bind(Self::to_i32(msg.retried))
        .bind(msg.state.as_str())
        .bind(msg.process_at)
        .bind(msg.created_at)
        .execute(&self.pool)
        .await?;

        Ok(msg.info())
    }

    async fn claim(&self, queue: &str, lease: Duration) -> Result<Option<TaskMessage>, BrokerError> {
        let sql = format!(
            r#"UPDATE tasks
               SET state = 'active',
                   lease_expires_at = NOW() + make_interval(secs => $2),
                   updated_at = NOW()
               WHERE id = (
                   SELECT id FROM tasks
                   WHERE queue = $1 AND state = 'pending' AND process_at <= NOW()
                   ORDER BY process_at, created_at
                   LIMIT 1
                   FOR UPDATE SKIP LOCKED
               )
               RETURNING {}"#,
            TASK_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(queue)
            .bind(lease.min(MAX_SCHEDULE_DELAY).as_secs_f64())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::map_row).transpose()
    }

    async fn complete(&self, task: &TaskMessage) -> Result<(), BrokerError> {
        let sql = format!("DELETE FROM tasks WHERE {}", CLAIM_FENCE);
        let result = sqlx::query(&sql)
            .bind(task.id)
            .bind(Self::to_i32(task.retried))
            .bind(task.lease_expires_at)
            .execute(&self.pool)
            .await?;
        Self::expect_claimed(task.id, result.rows_affected())
    }

    async fn retry(
        &self,
        task: &TaskMessage,
        retried: u32,
        process_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), BrokerError> {
        let sql = format!(
            r#"UPDATE tasks
               SET state = 'pending', retried = $4, process_at = $5, last_error = $6,
                   lease_expires_at = NULL, updated_at = NOW()
               WHERE {}"#,
            CLAIM_FENCE
        );
        let result = sqlx::query(&sql)
            .bind(task.id)
            .bind(Self::to_i32(task.retried))
            .bind(task.lease_expires_at)
            .bind(Self::to_i32(retried))
            .bind(process_at)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Self::expect_claimed(task.id, result.rows_affected())
    }

    async fn archive(&self, task: &TaskMessage, error: &str) -> Result<(), BrokerError> {
        let sql = format!(
            r#"UPDATE tasks
               SET state = 'archived', last_error = $4, lease_expires_at = NULL, updated_at = NOW()
               WHERE {}"#,
            CLAIM_FENCE
        );
        let result = sqlx::query(&sql)
            .bind(task.id)
            .bind(Self::to_i32(task.retried))
            .bind(task.lease_expires_at)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Self::expect_claimed(task.id, result.rows_affected())
    }

    async fn recover_expired(&self) -> Result<u64, BrokerError> {
        let result = sqlx::query(
            r#"UPDATE tasks
               SET state = CASE WHEN retried >= max_retry THEN 'archived' ELSE 'pending' END,
                   retried = CASE WHEN retried >= max_retry THEN retried ELSE retried + 1 END,
                   last_error = $1,
                   process_at = NOW(),
                   lease_expires_at = NULL,
                   updated_at = NOW()
               WHERE state = 'active' AND lease_expires_at < NOW()"#,
        )
        .bind(LEASE_EXPIRED_ERROR)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn get(&self, id: Uuid) -> Result<Option<TaskMessage>, BrokerError> {
        let sql = format!("SELECT {} FROM tasks WHERE id = $1", TASK_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::map_row).transpose()
    }
}
