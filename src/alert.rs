//! Operator alerts raised when a run stops on its own.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Channel through which the operator is told that a run aborted.
#[async_trait]
pub trait OperatorAlert: Send + Sync {
    /// Deliver one message.
    async fn send(&self, subject: &str, body: &str) -> Result<()>;
}

/// Alert that only writes an error event to the log.
#[derive(Debug, Default, Clone)]
pub struct LogAlert;

#[async_trait]
impl OperatorAlert for LogAlert {
    async fn send(&self, subject: &str, body: &str) -> Result<()> {
        tracing::error!(subject, body, "operator alert");
        Ok(())
    }
}

/// Alert mailed through the local `sendmail` binary.
#[derive(Debug, Clone)]
pub struct SendmailAlert {
    recipient: String,
    program: String,
}

impl SendmailAlert {
    /// Alert mailing `recipient`.
    pub fn new(recipient: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            program: "sendmail".to_string(),
        }
    }

    /// Use a different mail transfer program (must accept `-t` and a message on stdin).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn message(&self, subject: &str, body: &str) -> String {
        format!("To: {}\nSubject: {}\n\n{}\n", self.recipient, subject, body)
    }
}

#[async_trait]
impl OperatorAlert for SendmailAlert {
    async fn send(&self, subject: &str, body: &str) -> Result<()> {
        let mut child = Command::new(&self.program)
            .arg("-t")
            .stdin(std::process::Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(self.message(subject, body).as_bytes()).await?;
        }
        let status = child.wait().await?;
        if !status.success() {
            bail!("{} exited with {}", self.program, status);
        }
        tracing::info!(recipient = %self.recipient, subject, "operator alert mailed");
        Ok(())
    }
}
