//! Task Types
//!
//! What the broker stores and what handlers receive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

pub const QUEUE_CRITICAL: &str = "critical";
pub const QUEUE_DEFAULT: &str = "default";

pub const DEFAULT_MAX_RETRY: u32 = 25;

/// Longest delay, backoff or lease the worker schedules.
pub const MAX_SCHEDULE_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// `now + delay`, with `delay` capped at [`MAX_SCHEDULE_DELAY`].
pub fn after_delay(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let delay = chrono::Duration::from_std(delay.min(MAX_SCHEDULE_DELAY))
        .unwrap_or_else(|_| chrono::Duration::zero());
    now.checked_add_signed(delay).unwrap_or(now)
}

/// Broker-side lifecycle of a task. Completed tasks are deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Waiting for `process_at` and a free worker
    Pending,
    /// Claimed by exactly one worker until its lease expires
    Active,
    /// Terminal: retries exhausted or skipped. Kept for audit.
    Archived,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Active => "active",
            TaskState::Archived => "archived",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskState::Pending),
            "active" => Some(TaskState::Active),
            "archived" => Some(TaskState::Archived),
            _ => None,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enqueue options. Built with chained setters:
///
/// ```
/// use simple_bank::worker::{TaskOptions, QUEUE_CRITICAL};
/// use std::time::Duration;
///
/// let opts = TaskOptions::default()
///     .queue(QUEUE_CRITICAL)
///     .max_retry(10)
///     .process_in(Duration::from_secs(10));
/// assert_eq!(opts.max_retry, 10);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOptions {
    pub queue: String,
    pub max_retry: u32,
    pub process_in: Option<Duration>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            queue: QUEUE_DEFAULT.to_string(),
            max_retry: DEFAULT_MAX_RETRY,
            process_in: None,
        }
    }
}

impl TaskOptions {
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Delay the first attempt. Capped at [`MAX_SCHEDULE_DELAY`].
    pub fn process_in(mut self, delay: Duration) -> Self {
        self.process_in = Some(delay.min(MAX_SCHEDULE_DELAY));
        self
    }
}

/// Stored task record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskMessage {
    pub id: Uuid,
    pub task_type: String,
    pub payload: Vec<u8>,
    pub queue: String,
    pub max_retry: u32,
    pub retried: u32,
    pub last_error: Option<String>,
    pub state: TaskState,
    pub process_at: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TaskMessage {
    pub fn new(task_type: &str, payload: Vec<u8>, opts: &TaskOptions) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.to_string(),
            payload,
            queue: opts.queue.clone(),
            max_retry: opts.max_retry,
            retried: 0,
            last_error: None,
            state: TaskState::Pending,
            process_at: after_delay(now, opts.process_in.unwrap_or(Duration::ZERO)),
            lease_expires_at: None,
            created_at: now,
        }
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id,
            task_type: self.task_type.clone(),
            queue: self.queue.clone(),
            max_retry: self.max_retry,
            retried: self.retried,
            state: self.state,
            process_at: self.process_at,
        }
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retried >= self.max_retry
    }
}

/// Handle returned by enqueue, for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskInfo {
    pub id: Uuid,
    pub task_type: String,
    pub queue: String,
    pub max_retry: u32,
    pub retried: u32,
    pub state: TaskState,
    pub process_at: DateTime<Utc>,
}

/// What a handler sees.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    pub task_type: String,
    pub payload: Vec<u8>,
    pub retried: u32,
    pub max_retry: u32,
}

impl From<&TaskMessage> for Task {
    fn from(msg: &TaskMessage) -> Self {
        Self {
            id: msg.id,
            task_type: msg.task_type.clone(),
            payload: msg.payload.clone(),
            retried: msg.retried,
            max_retry: msg.max_retry,
        }
    }
}
