//! Built-in jobs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Job, JobContext, JobError, JobResult, RetryPolicy, ShouldQueue};

/// Severity used by [`LogMessageJob`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Warn,
    Error,
}

/// Job: Write a message to the log. Used to check a queue end to end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessageJob {
    pub message: String,
    #[serde(default)]
    pub level: LogLevel,
}

impl LogMessageJob {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: LogLevel::Info,
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }
}

#[async_trait]
impl Job for LogMessageJob {
    fn name(&self) -> &'static str {
        "log_message"
    }

    async fn handle(&self, ctx: &JobContext) -> JobResult {
        if self.message.is_empty() {
            return Err(JobError::fatal("log message is empty").with_code("EMPTY_MESSAGE"));
        }

        match self.level {
            LogLevel::Info => ctx.log_info(&self.message),
            LogLevel::Warn => ctx.log_warn(&self.message),
            LogLevel::Error => ctx.log_error(&self.message),
        }
        Ok(())
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        Some(RetryPolicy::no_retry())
    }
}

impl ShouldQueue for LogMessageJob {
    const JOB_TYPE: &'static str = "mantle.log_message";
}
