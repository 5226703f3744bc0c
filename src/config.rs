use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::worker::{ProcessorConfig, QUEUE_CRITICAL, QUEUE_DEFAULT, default_retry_delay};

/// Log file rotation period.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    Hourly,
    Daily,
    Never,
}

fn default_sql_log_level() -> String {
    "warn".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    /// Level for sqlx, which logs every statement at info
    #[serde(default = "default_sql_log_level")]
    pub sql_log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: Rotation,
    /// PostgreSQL connection URL. Without one the worker runs on the
    /// in-memory backend.
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub email: EmailConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    /// Upper bound on one transaction, 0 disables it
    pub tx_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout_secs: 5,
            tx_timeout_ms: 0,
        }
    }
}

impl DatabaseConfig {
    pub fn tx_timeout(&self) -> Option<Duration> {
        (self.tx_timeout_ms > 0).then(|| Duration::from_millis(self.tx_timeout_ms))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QueueWeight {
    pub name: String,
    pub weight: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub queues: Vec<QueueWeight>,
    pub poll_interval_ms: u64,
    pub task_timeout_secs: u64,
    pub lease_grace_secs: u64,
    pub recovery_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            queues: vec![
                QueueWeight {
                    name: QUEUE_CRITICAL.to_string(),
                    weight: 6,
                },
                QueueWeight {
                    name: QUEUE_DEFAULT.to_string(),
                    weight: 3,
                },
            ],
            poll_interval_ms: 1000,
            task_timeout_secs: 60,
            lease_grace_secs: 30,
            recovery_interval_secs: 15,
        }
    }
}

impl WorkerConfig {
    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            concurrency: self.concurrency.max(1),
            queues: self
                .queues
                .iter()
                .map(|q| (q.name.clone(), q.weight))
                .collect(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            task_timeout: Duration::from_secs(self.task_timeout_secs),
            lease_grace: Duration::from_secs(self.lease_grace_secs),
            recovery_interval: Duration::from_secs(self.recovery_interval_secs),
            retry_delay: std::sync::Arc::new(default_retry_delay),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EmailConfig {
    pub sender_name: String,
    pub sender_address: String,
    /// Page that receives `email_id` and `secret_code` query parameters
    pub verify_url: String,
    pub code_ttl_secs: u64,
    pub subject: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            sender_name: "Simple Bank".to_string(),
            sender_address: "noreply@simplebank.dev".to_string(),
            verify_url: "http://localhost:8080/v1/verify_email".to_string(),
            code_ttl_secs: 15 * 60,
            subject: "Welcome to Simple Bank".to_string(),
        }
    }
}

/// Longest lifetime of a verification code.
pub const MAX_CODE_TTL_SECS: u64 = 30 * 24 * 60 * 60;

impl EmailConfig {
    /// Code lifetime, capped at [`MAX_CODE_TTL_SECS`].
    pub fn code_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.code_ttl_secs.min(MAX_CODE_TTL_SECS) as i64)
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml_str(&content).with_context(|| format!("Invalid config: {}", config_path))
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: AppConfig =
            serde_yaml::from_str(content).context("Failed to parse config yaml")?;
        if config.worker.queues.iter().all(|q| q.weight == 0) {
            anyhow::bail!("worker.queues must contain at least one queue with weight > 0");
        }
        if config.email.code_ttl_secs == 0 || config.email.code_ttl_secs > MAX_CODE_TTL_SECS {
            anyhow::bail!(
                "email.code_ttl_secs must be between 1 and {}",
                MAX_CODE_TTL_SECS
            );
        }
        Ok(config)
    }
}
