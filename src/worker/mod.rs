//! Background task queue
//!
//! - [`distributor`] - producer side, enqueues typed payloads
//! - [`broker`] / [`postgres`] - persistent task store with leases
//! - [`processor`] - worker pool, retry policy, weighted queue polling
//! - [`task_verify_email`] - the verification email task

pub mod broker;
pub mod distributor;
pub mod error;
pub mod postgres;
pub mod processor;
pub mod task;
pub mod task_verify_email;

pub use broker::{Broker, MemoryBroker};
pub use distributor::{BrokerTaskDistributor, TaskDistributor};
pub use error::{BrokerError, TaskError};
pub use postgres::PgBroker;
pub use processor::{
    ProcessorConfig, ProcessorHandle, QueueSelector, ServeMux, TaskHandler, TaskProcessor,
    default_retry_delay,
};
pub use task::{
    DEFAULT_MAX_RETRY, QUEUE_CRITICAL, QUEUE_DEFAULT, Task, TaskInfo, TaskMessage, TaskOptions,
    TaskState,
};
pub use task_verify_email::{
    EnqueueVerifyEmail, PayloadSendVerifyEmail, SendVerifyEmailHandler, TASK_SEND_VERIFY_EMAIL,
};
