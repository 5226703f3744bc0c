//! Task Distributor
//!
//! Producer side of the broker. Serializes typed payloads and enqueues them.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use super::broker::Broker;
use super::error::BrokerError;
use super::task::{TaskInfo, TaskMessage, TaskOptions};
use super::task_verify_email::{PayloadSendVerifyEmail, TASK_SEND_VERIFY_EMAIL};

#[async_trait]
pub trait TaskDistributor: Send + Sync {
    async fn distribute_task_send_verify_email(
        &self,
        payload: &PayloadSendVerifyEmail,
        opts: TaskOptions,
    ) -> Result<TaskInfo, BrokerError>;
}

/// Distributor backed by a shared [`Broker`]. Cheap to clone.
#[derive(Clone)]
pub struct BrokerTaskDistributor {
    broker: Arc<dyn Broker>,
}

impl BrokerTaskDistributor {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Serialize `payload` as JSON and enqueue it under `task_type`.
    pub async fn enqueue<P: Serialize + Sync>(
        &self,
        task_type: &str,
        payload: &P,
        opts: TaskOptions,
    ) -> Result<TaskInfo, BrokerError> {
        let payload = serde_json::to_vec(payload)?;
        let msg = TaskMessage::new(task_type, payload, &opts);
        let info = self.broker.enqueue(msg).await?;

        tracing::info!(
            task_id = %info.id,
            task_type = %info.task_type,
            queue = %info.queue,
            max_retry = info.max_retry,
            process_at = %info.process_at,
            "Enqueued task"
        );
        Ok(info)
    }
}

#[async_trait]
impl TaskDistributor for BrokerTaskDistributor {
    async fn distribute_task_send_verify_email(
        &self,
        payload: &PayloadSendVerifyEmail,
        opts: TaskOptions,
    ) -> Result<TaskInfo, BrokerError> {
        self.enqueue(TASK_SEND_VERIFY_EMAIL, payload, opts).await
    }
}
