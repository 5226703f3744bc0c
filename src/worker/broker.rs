//! Task Broker
//!
//! Persistent store of pending work shared by every distributor and
//! processor. A claim hands a task to exactly one worker for the length of a
//! lease; tasks whose lease runs out are returned to the queue by
//! [`Broker::recover_expired`].
//!
//! Outcome writes (`complete`, `retry`, `archive`) are fenced on the claim:
//! they only apply while the task is still active under the same lease and
//! retry count, so a worker whose lease was recovered cannot clobber a newer
//! claim.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use super::error::BrokerError;
use super::task::{TaskInfo, TaskMessage, TaskState, after_delay};

pub const LEASE_EXPIRED_ERROR: &str = "task lease expired";

#[async_trait]
pub trait Broker: Send + Sync {
    /// Store a new pending task.
    async fn enqueue(&self, msg: TaskMessage) -> Result<TaskInfo, BrokerError>;

    /// Claim the oldest due task in `queue`, if any, for `lease`.
    async fn claim(&self, queue: &str, lease: Duration) -> Result<Option<TaskMessage>, BrokerError>;

    /// Remove a claimed task that ran successfully.
    ///
    /// Fails with [`BrokerError::LeaseLost`] if `task`'s claim no longer holds,
    /// as do [`Broker::retry`] and [`Broker::archive`].
    async fn complete(&self, task: &TaskMessage) -> Result<(), BrokerError>;

    /// Put a claimed task back to pending with a new retry count.
    async fn retry(
        &self,
        task: &TaskMessage,
        retried: u32,
        process_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), BrokerError>;

    /// Move a claimed task to the terminal archived state.
    async fn archive(&self, task: &TaskMessage, error: &str) -> Result<(), BrokerError>;

    /// Return active tasks with expired leases to pending, counting one retry
    /// (archived if the budget is spent). Returns how many were touched.
    async fn recover_expired(&self) -> Result<u64, BrokerError>;

    async fn get(&self, id: Uuid) -> Result<Option<TaskMessage>, BrokerError>;
}

fn lease_deadline(lease: Duration) -> DateTime<Utc> {
    after_delay(Utc::now(), lease)
}

/// In-process broker for tests and single-node development runs.
#[derive(Default)]
pub struct MemoryBroker {
    tasks: Mutex<HashMap<Uuid, TaskMessage>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored task in `state`.
    pub fn tasks_in(&self, state: TaskState) -> Vec<TaskMessage> {
        let mut tasks: Vec<TaskMessage> = self
            .tasks
            .lock()
            .values()
            .filter(|t| t.state == state)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.created_at, t.id));
        tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make a delayed or backed-off task due immediately.
    pub fn make_due(&self, id: Uuid) -> Result<(), BrokerError> {
        let mut tasks = self.tasks.lock();
        let task = tasks.get_mut(&id).ok_or(BrokerError::TaskNotFound(id))?;
        task.process_at = Utc::now();
        Ok(())
    }

    fn claimed<'a>(
        tasks: &'a mut HashMap<Uuid, TaskMessage>,
        claim: &TaskMessage,
    ) -> Result<&'a mut TaskMessage, BrokerError> {
        match tasks.get_mut(&claim.id) {
            Some(task)
                if task.state == TaskState::Active
                    && task.retried == claim.retried
                    && task.lease_expires_at == claim.lease_expires_at =>
            {
                Ok(task)
            }
            _ => Err(BrokerError::LeaseLost(claim.id)),
        }
    }

    /// Force the lease of an active task to be already expired.
    pub fn expire_lease(&self, id: Uuid) -> Result<(), BrokerError> {
        let mut tasks = self.tasks.lock();
        let task = tasks.get_mut(&id).ok_or(BrokerError::TaskNotFound(id))?;
        task.lease_expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, msg: TaskMessage) -> Result<TaskInfo, BrokerError> {
        let info = msg.info();
        self.tasks.lock().insert(msg.id, msg);
        Ok(info)
    }

    async fn claim(&self, queue: &str, lease: Duration) -> Result<Option<TaskMessage>, BrokerError> {
        let now = Utc::now();
        let mut tasks = self.tasks.lock();
        let next = tasks
            .values_mut()
            .filter(|t| t.queue == queue && t.state == TaskState::Pending && t.process_at <= now)
            .min_by_key(|t| (t.process_at, t.created_at));

        Ok(next.map(|task| {
            task.state = TaskState::Active;
            task.lease_expires_at = Some(lease_deadline(lease));
            task.clone()
        }))
    }

    async fn complete(&self, task: &TaskMessage) -> Result<(), BrokerError> {
        let mut tasks = self.tasks.lock();
        Self::claimed(&mut tasks, task)?;
        tasks.remove(&task.id);
        Ok(())
    }

    async fn retry(
        &self,
        task: &TaskMessage,
        retried: u32,
        process_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), BrokerError> {
        let mut tasks = self.tasks.lock();
        let task = Self::claimed(&mut tasks, task)?;
        task.state = TaskState::Pending;
        task.retried = retried;
        task.process_at = process_at;
        task.last_error = Some(error.to_string());
        task.lease_expires_at = None;
        Ok(())
    }

    async fn archive(&self, task: &TaskMessage, error: &str) -> Result<(), BrokerError> {
        let mut tasks = self.tasks.lock();
        let task = Self::claimed(&mut tasks, task)?;
        task.state = TaskState::Archived;
        task.last_error = Some(error.to_string());
        task.lease_expires_at = None;
        Ok(())
    }

    async fn recover_expired(&self) -> Result<u64, BrokerError> {
        let now = Utc::now();
        let mut recovered = 0;
        for task in self.tasks.lock().values_mut() {
            let expired = task.state == TaskState::Active
                && task.lease_expires_at.is_some_and(|at| at < now);
            if !expired {
                continue;
            }
            if task.retries_exhausted() {
                task.state = TaskState::Archived;
            } else {
                task.state = TaskState::Pending;
                task.retried += 1;
            }
            task.last_error = Some(LEASE_EXPIRED_ERROR.to_string());
            task.process_at = now;
            task.lease_expires_at = None;
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn get(&self, id: Uuid) -> Result<Option<TaskMessage>, BrokerError> {
        Ok(self.tasks.lock().get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::task::{QUEUE_CRITICAL, QUEUE_DEFAULT, TaskOptions};
    use std::collections::HashSet;
    use std::sync::Arc;

    const LEASE: Duration = Duration::from_secs(60);

    fn msg(queue: &str) -> TaskMessage {
        TaskMessage::new("test:noop", b"{}".to_vec(), &TaskOptions::default().queue(queue))
    }

    #[tokio::test]
    async fn test_claim_respects_queue_and_due_time() {
        let broker = MemoryBroker::new();
        broker.enqueue(msg(QUEUE_DEFAULT)).await.unwrap();
        let delayed = TaskMessage::new(
            "test:noop",
            vec![],
            &TaskOptions::default()
                .queue(QUEUE_CRITICAL)
                .process_in(Duration::from_secs(10)),
        );
        let delayed_id = delayed.id;
        broker.enqueue(delayed).await.unwrap();

        assert!(broker.claim(QUEUE_CRITICAL, LEASE).await.unwrap().is_none());

        broker.make_due(delayed_id).unwrap();
        let claimed = broker.claim(QUEUE_CRITICAL, LEASE).await.unwrap().unwrap();
        assert_eq!(claimed.id, delayed_id);
        assert_eq!(claimed.state, TaskState::Active);
        assert!(claimed.lease_expires_at.is_some());
    }

    #[tokio::test]
    async fn test_claimed_task_is_not_claimed_again() {
        let broker = MemoryBroker::new();
        broker.enqueue(msg(QUEUE_DEFAULT)).await.unwrap();
        assert!(broker.claim(QUEUE_DEFAULT, LEASE).await.unwrap().is_some());
        assert!(broker.claim(QUEUE_DEFAULT, LEASE).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_are_disjoint() {
        let broker = Arc::new(MemoryBroker::new());
        for _ in 0..200 {
            broker.enqueue(msg(QUEUE_DEFAULT)).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let broker = broker.clone();
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                while let Some(task) = broker.claim(QUEUE_DEFAULT, LEASE).await.unwrap() {
                    mine.push(task.id);
                    tokio::task::yield_now().await;
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "task {} claimed twice", id);
            }
        }
        assert_eq!(seen.len(), 200);
    }

    #[tokio::test]
    async fn test_retry_complete_archive() {
        let broker = MemoryBroker::new();
        let info = broker.enqueue(msg(QUEUE_DEFAULT)).await.unwrap();
        let claim = broker.claim(QUEUE_DEFAULT, LEASE).await.unwrap().unwrap();

        broker
            .retry(&claim, 1, Utc::now(), "smtp timeout")
            .await
            .unwrap();
        let task = broker.get(info.id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.retried, 1);
        assert_eq!(task.last_error.as_deref(), Some("smtp timeout"));

        // A pending task is not owned by anyone
        assert!(matches!(
            broker.archive(&claim, "gave up").await,
            Err(BrokerError::LeaseLost(_))
        ));

        let claim = broker.claim(QUEUE_DEFAULT, LEASE).await.unwrap().unwrap();
        broker.archive(&claim, "gave up").await.unwrap();
        assert_eq!(broker.tasks_in(TaskState::Archived).len(), 1);
        assert!(matches!(
            broker.complete(&claim).await,
            Err(BrokerError::LeaseLost(_))
        ));
        assert_eq!(broker.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_claim_cannot_overwrite_new_claim() {
        let broker = MemoryBroker::new();
        let info = broker.enqueue(msg(QUEUE_DEFAULT)).await.unwrap();
        let stale = broker.claim(QUEUE_DEFAULT, LEASE).await.unwrap().unwrap();

        broker.expire_lease(info.id).unwrap();
        broker.recover_expired().await.unwrap();
        let fresh = broker.claim(QUEUE_DEFAULT, LEASE).await.unwrap().unwrap();
        assert_eq!(fresh.id, info.id);

        for result in [
            broker.complete(&stale).await,
            broker.retry(&stale, 5, Utc::now(), "late").await,
            broker.archive(&stale, "late").await,
        ] {
            assert!(matches!(result, Err(BrokerError::LeaseLost(id)) if id == info.id));
        }
        let task = broker.get(info.id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Active);
        assert_eq!(task.retried, 1);
        assert_eq!(task.lease_expires_at, fresh.lease_expires_at);

        broker.complete(&fresh).await.unwrap();
        assert!(broker.is_empty());
    }

    #[tokio::test]
    async fn test_recover_expired_lease() {
        let broker = MemoryBroker::new();
        let first = broker
            .enqueue(TaskMessage::new(
                "t",
                vec![],
                &TaskOptions::default().max_retry(1),
            ))
            .await
            .unwrap();

        broker.claim(QUEUE_DEFAULT, LEASE).await.unwrap().unwrap();
        assert_eq!(broker.recover_expired().await.unwrap(), 0);

        broker.expire_lease(first.id).unwrap();
        assert_eq!(broker.recover_expired().await.unwrap(), 1);
        let task = broker.get(first.id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.retried, 1);
        assert_eq!(task.last_error.as_deref(), Some(LEASE_EXPIRED_ERROR));

        // Second expiry exhausts the budget of one retry
        broker.claim(QUEUE_DEFAULT, LEASE).await.unwrap().unwrap();
        broker.expire_lease(first.id).unwrap();
        broker.recover_expired().await.unwrap();
        let task = broker.get(first.id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Archived);
    }
}
