//! Verification email workflow
//!
//! Registration enqueues `task:send_verify_email` through [`EnqueueVerifyEmail`];
//! [`SendVerifyEmailHandler`] later issues the secret code and mails the link.

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::distributor::TaskDistributor;
use super::error::TaskError;
use super::processor::TaskHandler;
use super::task::{QUEUE_CRITICAL, Task, TaskOptions};
use crate::config::EmailConfig;
use crate::db::{AfterCreate, Backend, CreateVerifyEmailParams, Store, User};
use crate::mail::{Email, EmailSender};

pub const TASK_SEND_VERIFY_EMAIL: &str = "task:send_verify_email";

pub const SECRET_CODE_LEN: usize = 32;

const SECRET_CODE_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSendVerifyEmail {
    pub username: String,
}

pub fn random_string(n: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| SECRET_CODE_ALPHABET[rng.gen_range(0..SECRET_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Registration callback that schedules the verification email.
pub struct EnqueueVerifyEmail {
    distributor: Arc<dyn TaskDistributor>,
    opts: TaskOptions,
}

impl EnqueueVerifyEmail {
    /// Critical queue, 10 retries, first attempt after 10 seconds so the
    /// registration transaction has committed.
    pub fn new(distributor: Arc<dyn TaskDistributor>) -> Self {
        Self {
            distributor,
            opts: TaskOptions::default()
                .queue(QUEUE_CRITICAL)
                .max_retry(10)
                .process_in(Duration::from_secs(10)),
        }
    }

    pub fn with_options(mut self, opts: TaskOptions) -> Self {
        self.opts = opts;
        self
    }
}

#[async_trait]
impl AfterCreate for EnqueueVerifyEmail {
    async fn after_create(&self, user: &User) -> anyhow::Result<()> {
        let payload = PayloadSendVerifyEmail {
            username: user.username.clone(),
        };
        self.distributor
            .distribute_task_send_verify_email(&payload, self.opts.clone())
            .await
            .context("failed to distribute task to send verify email")?;
        Ok(())
    }
}

pub struct SendVerifyEmailHandler<B: Backend> {
    store: Arc<Store<B>>,
    mailer: Arc<dyn EmailSender>,
    config: EmailConfig,
}

impl<B: Backend> SendVerifyEmailHandler<B> {
    pub fn new(store: Arc<Store<B>>, mailer: Arc<dyn EmailSender>, config: EmailConfig) -> Self {
        Self {
            store,
            mailer,
            config,
        }
    }

    fn verify_link(&self, email_id: i64, secret_code: &str) -> String {
        format!(
            "{}?email_id={}&secret_code={}",
            self.config.verify_url, email_id, secret_code
        )
    }
}

fn verify_email_body(full_name: &str, secret_code: &str, link: &str) -> String {
    format!(
        "Hello {full_name},<br/>\
         Thanks for opening an account with Simple Bank.<br/>\
         Your verification code is <b>{secret_code}</b>.<br/>\
         Please <a href=\"{link}\">confirm your email address</a> to finish signing up.<br/>"
    )
}

#[async_trait]
impl<B: Backend> TaskHandler for SendVerifyEmailHandler<B> {
    async fn process_task(&self, task: &Task) -> Result<(), TaskError> {
        let payload: PayloadSendVerifyEmail = serde_json::from_slice(&task.payload)
            .context("failed to unmarshal payload")
            .map_err(TaskError::skip_retry)?;

        // Not found is retried: the task may run before registration commits
        let user = self
            .store
            .get_user(&payload.username)
            .await
            .context("failed to get user")
            .map_err(TaskError::retry)?;

        let verify_email = self
            .store
            .create_verify_email(CreateVerifyEmailParams {
                username: user.username.clone(),
                email: user.email.clone(),
                secret_code: random_string(SECRET_CODE_LEN),
                expired_at: Utc::now() + self.config.code_ttl(),
            })
            .await
            .context("failed to create verify email")
            .map_err(TaskError::retry)?;

        let link = self.verify_link(verify_email.id, &verify_email.secret_code);
        let email = Email {
            subject: self.config.subject.clone(),
            content: verify_email_body(&user.full_name, &verify_email.secret_code, &link),
            to: vec![user.email.clone()],
            ..Default::default()
        };
        self.mailer
            .send_email(&email)
            .await
            .context("failed to send verify email")
            .map_err(TaskError::retry)?;

        tracing::info!(
            task_id = %task.id,
            username = %user.username,
            email = %user.email,
            email_id = verify_email.id,
            "Processed send verify email task"
        );
        Ok(())
    }
}
