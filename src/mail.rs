//! Outgoing email
//!
//! The core only depends on [`EmailSender`]. SMTP delivery lives outside this
//! crate; [`LogSender`] is the bundled development sender.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Email {
    pub subject: String,
    /// HTML body
    pub content: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    /// Paths of files to attach
    pub attach_files: Vec<String>,
}

/// Potentially slow, potentially failing external mail delivery.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_email(&self, email: &Email) -> Result<()>;
}

/// Writes messages to the log instead of delivering them.
pub struct LogSender {
    name: String,
    from_address: String,
}

impl LogSender {
    pub fn new(name: impl Into<String>, from_address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            from_address: from_address.into(),
        }
    }
}

#[async_trait]
impl EmailSender for LogSender {
    async fn send_email(&self, email: &Email) -> Result<()> {
        if email.to.is_empty() {
            anyhow::bail!("email has no recipients");
        }
        for file in &email.attach_files {
            tokio::fs::metadata(file)
                .await
                .with_context(|| format!("failed to attach file {}", file))?;
        }

        tracing::info!(
            from = %format!("{} <{}>", self.name, self.from_address),
            to = ?email.to,
            cc = ?email.cc,
            bcc = ?email.bcc,
            subject = %email.subject,
            attachments = email.attach_files.len(),
            "Email sent (log sender)"
        );
        tracing::debug!(content = %email.content, "Email body");
        Ok(())
    }
}
