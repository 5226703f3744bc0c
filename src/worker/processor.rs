//! Task Processor
//!
//! Consumer side of the broker: a pool of workers that claim tasks across the
//! configured queues, dispatch them to handlers by task type and record the
//! outcome (delete, retry with backoff, or archive).

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::broker::Broker;
use super::error::{BrokerError, TaskError};
use super::task::{QUEUE_CRITICAL, QUEUE_DEFAULT, Task, TaskMessage, after_delay};

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn process_task(&self, task: &Task) -> Result<(), TaskError>;
}

/// Routes task types to handlers.
#[derive(Clone, Default)]
pub struct ServeMux {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl ServeMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `task_type`, replacing any previous one.
    pub fn handle(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_type.into(), handler);
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }
}

pub type RetryDelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Backoff before the n-th retry: `n^4 + 15 + rand(0..30) * (n + 1)` seconds.
pub fn default_retry_delay(n: u32) -> Duration {
    let n = u64::from(n);
    let jitter = rand::thread_rng().gen_range(0..30u64);
    let secs = n
        .saturating_pow(4)
        .saturating_add(15)
        .saturating_add(jitter.saturating_mul(n + 1));
    Duration::from_secs(secs)
}

#[derive(Clone)]
pub struct ProcessorConfig {
    /// Number of concurrent workers
    pub concurrency: usize,
    /// Queue name and weight. Weight 0 disables a queue.
    pub queues: Vec<(String, u32)>,
    /// Idle sleep when no queue has a due task
    pub poll_interval: Duration,
    /// Upper bound on one handler run
    pub task_timeout: Duration,
    /// Extra lease time beyond `task_timeout` before a claim is recovered
    pub lease_grace: Duration,
    pub recovery_interval: Duration,
    pub retry_delay: RetryDelayFn,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            queues: vec![
                (QUEUE_CRITICAL.to_string(), 6),
                (QUEUE_DEFAULT.to_string(), 3),
            ],
            poll_interval: Duration::from_secs(1),
            task_timeout: Duration::from_secs(60),
            lease_grace: Duration::from_secs(30),
            recovery_interval: Duration::from_secs(15),
            retry_delay: Arc::new(default_retry_delay),
        }
    }
}

impl ProcessorConfig {
    pub fn lease(&self) -> Duration {
        self.task_timeout + self.lease_grace
    }
}

/// Smooth weighted round-robin over queues.
///
/// Over any `Σ weights` consecutive calls each queue leads the polling order
/// exactly `weight` times, so low-priority queues are never starved.
pub struct QueueSelector {
    queues: Vec<(String, i64)>,
    current: Mutex<Vec<i64>>,
}

impl QueueSelector {
    pub fn new(queues: &[(String, u32)]) -> Self {
        let queues: Vec<(String, i64)> = queues
            .iter()
            .filter(|(_, w)| *w > 0)
            .map(|(q, w)| (q.clone(), i64::from(*w)))
            .collect();
        let current = Mutex::new(vec![0; queues.len()]);
        Self { queues, current }
    }

    /// Queue names in the order one worker should try them on this poll.
    pub fn next_order(&self) -> Vec<String> {
        if self.queues.is_empty() {
            return Vec::new();
        }

        let total: i64 = self.queues.iter().map(|(_, w)| w).sum();
        let lead = {
            let mut current = self.current.lock();
            let mut best = 0;
            for (i, (_, weight)) in self.queues.iter().enumerate() {
                current[i] += weight;
                if current[i] > current[best] {
                    best = i;
                }
            }
            current[best] -= total;
            best
        };

        let mut rest: Vec<usize> = (0..self.queues.len()).filter(|&i| i != lead).collect();
        // Stable sort keeps configuration order among equal weights
        rest.sort_by_key(|&i| std::cmp::Reverse(self.queues[i].1));

        std::iter::once(lead)
            .chain(rest)
            .map(|i| self.queues[i].0.clone())
            .collect()
    }
}

/// Pool of workers executing tasks from a shared broker.
#[derive(Clone)]
pub struct TaskProcessor {
    broker: Arc<dyn Broker>,
    mux: Arc<ServeMux>,
    config: ProcessorConfig,
    selector: Arc<QueueSelector>,
}

impl TaskProcessor {
    pub fn new(broker: Arc<dyn Broker>, mux: ServeMux, config: ProcessorConfig) -> Self {
        let selector = Arc::new(QueueSelector::new(&config.queues));
        Self {
            broker,
            mux: Arc::new(mux),
            config,
            selector,
        }
    }

    /// Claim and run at most one task. Returns `false` when nothing was due.
    pub async fn process_next(&self) -> Result<bool, BrokerError> {
        let lease = self.config.lease();
        for queue in self.selector.next_order() {
            if let Some(msg) = self.broker.claim(&queue, lease).await? {
                match self.execute(&msg).await {
                    Err(BrokerError::LeaseLost(id)) => {
                        warn!(
                            task_id = %id,
                            task_type = %msg.task_type,
                            "Lease lost before outcome was recorded, dropping result"
                        );
                    }
                    other => other?,
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn execute(&self, msg: &TaskMessage) -> Result<(), BrokerError> {
        let Some(handler) = self.mux.get(&msg.task_type) else {
            error!(
                task_id = %msg.id,
                task_type = %msg.task_type,
                queue = %msg.queue,
                "No handler registered for task type, archiving"
            );
            let reason = format!("no handler registered for task type {}", msg.task_type);
            return self.broker.archive(msg, &reason).await;
        };

        let task = Task::from(msg);
        debug!(task_id = %task.id, task_type = %task.task_type, retried = task.retried, "Processing task");

        let outcome = match tokio::time::timeout(self.config.task_timeout, handler.process_task(&task)).await {
            Ok(result) => result,
            Err(_) => Err(TaskError::retry(anyhow::anyhow!(
                "task timed out after {:?}",
                self.config.task_timeout
            ))),
        };

        match outcome {
            Ok(()) => {
                debug!(task_id = %msg.id, task_type = %msg.task_type, "Task completed");
                self.broker.complete(msg).await
            }
            Err(err) if err.is_skip_retry() => {
                warn!(
                    task_id = %msg.id,
                    task_type = %msg.task_type,
                    queue = %msg.queue,
                    error = %err,
                    "Task failed without retry, archiving"
                );
                self.broker.archive(msg, &err.to_string()).await
            }
            Err(err) if msg.retries_exhausted() => {
                error!(
                    task_id = %msg.id,
                    task_type = %msg.task_type,
                    queue = %msg.queue,
                    retried = msg.retried,
                    max_retry = msg.max_retry,
                    error = %err,
                    "Task retries exhausted, archiving"
                );
                self.broker.archive(msg, &err.to_string()).await
            }
            Err(err) => {
                let retried = msg.retried + 1;
                let delay = (self.config.retry_delay)(retried);
                let process_at = after_delay(Utc::now(), delay);
                warn!(
                    task_id = %msg.id,
                    task_type = %msg.task_type,
                    queue = %msg.queue,
                    retried,
                    max_retry = msg.max_retry,
                    delay_secs = delay.as_secs(),
                    error = %err,
                    "Task failed, scheduling retry"
                );
                self.broker
                    .retry(msg, retried, process_at, &err.to_string())
                    .await
            }
        }
    }

    /// Return expired leases to their queues.
    pub async fn recover_expired(&self) -> Result<u64, BrokerError> {
        let recovered = self.broker.recover_expired().await?;
        if recovered > 0 {
            warn!(count = recovered, "Recovered tasks with expired leases");
        }
        Ok(recovered)
    }

    /// Spawn the worker pool and the lease recovery loop.
    pub fn start(&self) -> ProcessorHandle {
        info!(
            concurrency = self.config.concurrency,
            queues = ?self.config.queues,
            task_timeout_secs = self.config.task_timeout.as_secs(),
            "Starting task processor"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(self.config.concurrency + 1);

        for worker_id in 0..self.config.concurrency {
            let processor = self.clone();
            let shutdown = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                processor.worker_loop(worker_id, shutdown).await;
            }));
        }

        let processor = self.clone();
        handles.push(tokio::spawn(async move {
            processor.recovery_loop(shutdown_rx).await;
        }));

        ProcessorHandle {
            shutdown_tx,
            handles,
        }
    }

    async fn worker_loop(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker_id, "Worker started");
        while !*shutdown.borrow() {
            let idle = match self.process_next().await {
                Ok(processed) => !processed,
                Err(e) => {
                    error!(worker_id, error = %e, "Broker error while processing");
                    true
                }
            };
            if idle {
                tokio::select! {
                    changed = shutdown.changed() => if changed.is_err() { break },
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
        debug!(worker_id, "Worker stopped");
    }

    async fn recovery_loop(&self, mut shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            if let Err(e) = self.recover_expired().await {
                error!(error = %e, "Lease recovery failed");
            }
            tokio::select! {
                changed = shutdown.changed() => if changed.is_err() { break },
                _ = tokio::time::sleep(self.config.recovery_interval) => {}
            }
        }
    }
}

/// Running processor. Dropping it stops the workers without waiting for them.
pub struct ProcessorHandle {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl ProcessorHandle {
    /// Stop claiming new tasks and wait for in-flight tasks to finish.
    pub async fn shutdown(self) {
        info!("Shutting down task processor");
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker terminated abnormally");
            }
        }
        info!("Task processor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::broker::{LEASE_EXPIRED_ERROR, MemoryBroker};
    use crate::worker::task::{TaskOptions, TaskState};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHandler {
        calls: AtomicU32,
        fail_with: Option<fn() -> TaskError>,
    }

    impl CountingHandler {
        fn new(fail_with: Option<fn() -> TaskError>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail_with,
            })
        }
    }

    #[async_trait]
    impl TaskHandler for CountingHandler {
        async fn process_task(&self, _task: &Task) -> Result<(), TaskError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(f) => Err(f()),
                None => Ok(()),
            }
        }
    }

    fn processor(broker: Arc<MemoryBroker>, handler: Arc<dyn TaskHandler>) -> TaskProcessor {
        let mut mux = ServeMux::new();
        mux.handle("test:task", handler);
        let config = ProcessorConfig {
            retry_delay: Arc::new(|_| Duration::ZERO),
            ..Default::default()
        };
        TaskProcessor::new(broker, mux, config)
    }

    async fn enqueue(broker: &MemoryBroker, task_type: &str, max_retry: u32) -> uuid::Uuid {
        let msg = TaskMessage::new(task_type, vec![], &TaskOptions::default().max_retry(max_retry));
        broker.enqueue(msg).await.unwrap().id
    }

    #[tokio::test]
    async fn test_success_deletes_task() {
        let broker = Arc::new(MemoryBroker::new());
        let handler = CountingHandler::new(None);
        let processor = processor(broker.clone(), handler.clone());
        enqueue(&broker, "test:task", 3).await;

        assert!(processor.process_next().await.unwrap());
        assert!(!processor.process_next().await.unwrap());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(broker.is_empty());
    }

    #[tokio::test]
    async fn test_retry_exhaustion_archives_after_max_retry_plus_one_runs() {
        let broker = Arc::new(MemoryBroker::new());
        let handler = CountingHandler::new(Some(|| TaskError::retry(anyhow::anyhow!("smtp down"))));
        let processor = processor(broker.clone(), handler.clone());
        let id = enqueue(&broker, "test:task", 3).await;

        while processor.process_next().await.unwrap() {}

        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
        let task = broker.get(id).await.unwrap().expect("archived task is retained");
        assert_eq!(task.state, TaskState::Archived);
        assert_eq!(task.retried, 3);
        assert_eq!(task.last_error.as_deref(), Some("smtp down"));
    }

    #[tokio::test]
    async fn test_skip_retry_runs_once() {
        let broker = Arc::new(MemoryBroker::new());
        let handler =
            CountingHandler::new(Some(|| TaskError::skip_retry(anyhow::anyhow!("bad payload"))));
        let processor = processor(broker.clone(), handler.clone());
        let id = enqueue(&broker, "test:task", 10).await;

        while processor.process_next().await.unwrap() {}

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let task = broker.get(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Archived);
        assert_eq!(task.retried, 0);
    }

    #[tokio::test]
    async fn test_retry_waits_for_backoff() {
        let broker = Arc::new(MemoryBroker::new());
        let handler = CountingHandler::new(Some(|| TaskError::retry(anyhow::anyhow!("later"))));
        let mut mux = ServeMux::new();
        mux.handle("test:task", handler.clone());
        let config = ProcessorConfig {
            retry_delay: Arc::new(|_| Duration::from_secs(3600)),
            ..Default::default()
        };
        let processor = TaskProcessor::new(broker.clone(), mux, config);
        let id = enqueue(&broker, "test:task", 5).await;

        assert!(processor.process_next().await.unwrap());
        assert!(!processor.process_next().await.unwrap());
        let task = broker.get(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.retried, 1);
        assert!(task.process_at > Utc::now() + chrono::Duration::minutes(59));
    }

    #[tokio::test]
    async fn test_unbounded_backoff_is_capped() {
        let broker = Arc::new(MemoryBroker::new());
        let handler = CountingHandler::new(Some(|| TaskError::retry(anyhow::anyhow!("later"))));
        let mut mux = ServeMux::new();
        mux.handle("test:task", handler);
        let config = ProcessorConfig {
            retry_delay: Arc::new(|_| Duration::MAX),
            ..Default::default()
        };
        let processor = TaskProcessor::new(broker.clone(), mux, config);
        let id = enqueue(&broker, "test:task", 5).await;

        assert!(processor.process_next().await.unwrap());
        let task = broker.get(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert!(task.process_at <= Utc::now() + chrono::Duration::days(366));
    }

    /// Lets the lease run out mid-task and hands the task to another claimer.
    struct LeaseStealingHandler {
        broker: Arc<MemoryBroker>,
        new_claim: Mutex<Option<TaskMessage>>,
    }

    #[async_trait]
    impl TaskHandler for LeaseStealingHandler {
        async fn process_task(&self, task: &Task) -> Result<(), TaskError> {
            self.broker.expire_lease(task.id).unwrap();
            self.broker.recover_expired().await.unwrap();
            let claim = self
                .broker
                .claim(QUEUE_DEFAULT, Duration::from_secs(60))
                .await
                .unwrap();
            *self.new_claim.lock() = claim;
            Err(TaskError::skip_retry(anyhow::anyhow!("too late")))
        }
    }

    #[tokio::test]
    async fn test_outcome_after_lost_lease_is_dropped() {
        let broker = Arc::new(MemoryBroker::new());
        let handler = Arc::new(LeaseStealingHandler {
            broker: broker.clone(),
            new_claim: Mutex::new(None),
        });
        let processor = processor(broker.clone(), handler.clone());
        let id = enqueue(&broker, "test:task", 3).await;

        assert!(processor.process_next().await.unwrap());

        let new_claim = handler.new_claim.lock().clone().expect("task was reclaimed");
        let task = broker.get(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Active);
        assert_eq!(task.retried, 1);
        assert_eq!(task.last_error.as_deref(), Some(LEASE_EXPIRED_ERROR));
        broker.complete(&new_claim).await.unwrap();
        assert!(broker.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_task_type_is_archived() {
        let broker = Arc::new(MemoryBroker::new());
        let processor = processor(broker.clone(), CountingHandler::new(None));
        let id = enqueue(&broker, "test:unknown", 3).await;

        assert!(processor.process_next().await.unwrap());
        let task = broker.get(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Archived);
        assert!(task.last_error.unwrap().contains("no handler"));
    }

    #[tokio::test]
    async fn test_handler_timeout_is_retried() {
        struct Slow;

        #[async_trait]
        impl TaskHandler for Slow {
            async fn process_task(&self, _task: &Task) -> Result<(), TaskError> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }
        }

        let broker = Arc::new(MemoryBroker::new());
        let mut mux = ServeMux::new();
        mux.handle("test:task", Arc::new(Slow));
        let config = ProcessorConfig {
            task_timeout: Duration::from_millis(20),
            retry_delay: Arc::new(|_| Duration::from_secs(60)),
            ..Default::default()
        };
        let processor = TaskProcessor::new(broker.clone(), mux, config);
        let id = enqueue(&broker, "test:task", 2).await;

        assert!(processor.process_next().await.unwrap());
        let task = broker.get(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.retried, 1);
        assert!(task.last_error.unwrap().contains("timed out"));
    }

    #[test]
    fn test_selector_weighted_without_starvation() {
        let selector = QueueSelector::new(&[
            (QUEUE_CRITICAL.to_string(), 6),
            (QUEUE_DEFAULT.to_string(), 3),
        ]);

        let mut leads = HashMap::new();
        for _ in 0..9 {
            let order = selector.next_order();
            assert_eq!(order.len(), 2);
            *leads.entry(order[0].clone()).or_insert(0) += 1;
        }
        assert_eq!(leads[QUEUE_CRITICAL], 6);
        assert_eq!(leads[QUEUE_DEFAULT], 3);
    }

    #[test]
    fn test_selector_skips_zero_weight() {
        let selector = QueueSelector::new(&[
            (QUEUE_CRITICAL.to_string(), 1),
            ("disabled".to_string(), 0),
        ]);
        assert_eq!(selector.next_order(), vec![QUEUE_CRITICAL.to_string()]);
        assert!(QueueSelector::new(&[]).next_order().is_empty());
    }

    #[tokio::test]
    async fn test_low_priority_queue_is_drained_under_load() {
        let broker = Arc::new(MemoryBroker::new());
        let handler = CountingHandler::new(None);
        let processor = processor(broker.clone(), handler.clone());

        let critical = TaskOptions::default().queue(QUEUE_CRITICAL);
        for _ in 0..20 {
            let msg = TaskMessage::new("test:task", vec![], &critical);
            broker.enqueue(msg).await.unwrap();
        }
        let low = broker
            .enqueue(TaskMessage::new("test:task", vec![], &TaskOptions::default()))
            .await
            .unwrap();

        // Within one full weight cycle the default queue gets a turn
        for _ in 0..9 {
            processor.process_next().await.unwrap();
        }
        assert!(broker.get(low.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let broker = Arc::new(MemoryBroker::new());
        let handler = CountingHandler::new(None);
        let mut mux = ServeMux::new();
        mux.handle("test:task", handler.clone());
        let config = ProcessorConfig {
            concurrency: 4,
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
        for _ in 0..10 {
            enqueue(&broker, "test:task", 1).await;
        }

        let handle = TaskProcessor::new(broker.clone(), mux, config).start();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !broker.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;

        assert!(broker.is_empty());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 10);
    }
}
