//! Error handling for the Mantle queue.
//!
//! This module provides:
//! - A single error type with machine-readable codes and context chaining
//! - Retryability and severity classification per code
//! - User-facing messages vs detailed internal messages
//! - Error logging with tracing integration
//! - Metrics integration for error tracking
//!
//! # Usage
//!
//! ```rust,ignore
//! use mantle_queue::error::{ErrorCode, ErrorContext, Result};
//!
//! fn load_payload(raw: &str) -> Result<serde_json::Value> {
//!     serde_json::from_str(raw).with_error_code(ErrorCode::DeserializationError)
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::jobs::{JobError, JobId};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Queue Errors (1000-1099)
    EnqueueFailed,
    JobNotFound,
    ClaimLost,
    InvalidStateTransition,
    UnknownJobType,

    // Execution Errors (1100-1199)
    JobExecutionFailed,

    // Storage Errors (2000-2099)
    DatabaseError,
    DatabaseConnectionFailed,
    DatabaseQueryFailed,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,

    // Configuration Errors (5000-5099)
    ProviderNotRegistered,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::EnqueueFailed => 1000,
            Self::JobNotFound => 1001,
            Self::ClaimLost => 1002,
            Self::InvalidStateTransition => 1003,
            Self::UnknownJobType => 1004,

            Self::JobExecutionFailed => 1100,

            Self::DatabaseError => 2000,
            Self::DatabaseConnectionFailed => 2001,
            Self::DatabaseQueryFailed => 2002,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::ProviderNotRegistered => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            Self::InternalError => 9000,
        }
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DatabaseConnectionFailed | Self::DatabaseQueryFailed | Self::EnqueueFailed
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "queue",
            1100..=1199 => "execution",
            2000..=2099 => "database",
            2200..=2299 => "serialization",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Expected conditions (missing jobs, lost claims)
    Low,
    /// Operational issues (job failures, enqueue failures)
    Medium,
    /// System errors (storage, serialization)
    High,
    /// Errors that stop the queue from working at all
    Critical,
}

impl ErrorSeverity {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::JobNotFound | ErrorCode::ClaimLost | ErrorCode::InvalidStateTransition => {
                Self::Low
            }

            ErrorCode::EnqueueFailed
            | ErrorCode::JobExecutionFailed
            | ErrorCode::UnknownJobType => Self::Medium,

            ErrorCode::DatabaseError
            | ErrorCode::DatabaseQueryFailed
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError => Self::High,

            ErrorCode::DatabaseConnectionFailed
            | ErrorCode::ProviderNotRegistered
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration
            | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Structured context carried by a [`QueueError`]: the entity it concerns
/// (a job, provider, queue or job type) and free-form key/value pairs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl ErrorDetails {
    pub fn entity(entity_type: impl Into<String>, entity_id: impl ToString) -> Self {
        Self {
            entity_type: Some(entity_type.into()),
            entity_id: Some(entity_id.to_string()),
            context: HashMap::new(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the queue.
#[derive(Error, Debug)]
pub struct QueueError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-facing error message
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl QueueError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Replace the structured details, keeping any context already added.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        let context = std::mem::take(&mut self.details.context);
        self.details = details;
        self.details.context.extend(context);
        self
    }

    /// Attach a context value. Values that fail to serialize are skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => {
                self.details.context.insert(key.into(), value);
            }
            Err(e) => tracing::trace!(error = %e, "Dropped unserializable error context"),
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-facing message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the error details.
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    /// Whether this is a configuration error (never retried, aborts the caller).
    pub fn is_configuration(&self) -> bool {
        self.code.category() == "configuration"
    }

    /// The job failure that caused this error, if the error came from `handle()`.
    pub fn job_error(&self) -> Option<&JobError> {
        self.source
            .as_deref()
            .and_then(|source| source.downcast_ref::<JobError>())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error at the level its severity calls for.
    pub fn log(&self) {
        macro_rules! emit {
            ($level:ident, $label:literal) => {
                tracing::$level!(
                    error_code = %self.code,
                    numeric_code = self.code.numeric_code(),
                    category = self.code.category(),
                    user_message = %self.user_message,
                    internal_message = self.internal_message.as_deref().unwrap_or_default(),
                    entity = self.details.entity_id.as_deref().unwrap_or_default(),
                    context = ?self.details.context,
                    $label
                )
            };
        }

        match self.severity() {
            ErrorSeverity::Critical => emit!(error, "Queue unusable"),
            ErrorSeverity::High => emit!(error, "Queue operation failed"),
            ErrorSeverity::Medium => emit!(warn, "Job operation failed"),
            ErrorSeverity::Low => emit!(debug, "Expected queue condition"),
        }
    }

    fn record_metrics(&self) {
        counter!(
            "mantle_queue_errors_total",
            "code" => self.code.to_string(),
            "severity" => self.severity().as_str(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| QueueError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| QueueError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| QueueError::new(ErrorCode::JobNotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| QueueError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for QueueError {
    fn from(error: sqlx::Error) -> Self {
        let (code, user_msg) = match &error {
            sqlx::Error::RowNotFound => (ErrorCode::JobNotFound, "The requested job was not found"),
            sqlx::Error::Database(_) => (ErrorCode::DatabaseQueryFailed, "A database error occurred"),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => (
                ErrorCode::DatabaseConnectionFailed,
                "Unable to connect to the database",
            ),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string()).with_source(error)
    }
}

impl From<std::io::Error> for QueueError {
    fn from(error: std::io::Error) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An I/O error occurred", error.to_string())
            .with_source(error)
    }
}

impl From<anyhow::Error> for QueueError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<QueueError>() {
            Ok(queue_error) => queue_error,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for QueueError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => (
                ErrorCode::MissingConfiguration,
                "Required configuration not found",
            ),
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => (
                ErrorCode::InvalidConfiguration,
                "Configuration file is invalid",
            ),
            _ => (ErrorCode::InvalidConfiguration, "Configuration error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string())
    }
}

impl From<JobError> for QueueError {
    fn from(error: JobError) -> Self {
        let mut queue_error = Self::new(
            ErrorCode::JobExecutionFailed,
            format!("Job failed: {}", error.message),
        );
        if let Some(code) = &error.code {
            queue_error = queue_error.with_context("job_error_code", code);
        }
        queue_error.with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors for Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl QueueError {
    /// No provider is registered under the requested name.
    pub fn provider_not_registered(name: &str) -> Self {
        Self::new(
            ErrorCode::ProviderNotRegistered,
            format!("No queue provider registered for '{}'", name),
        )
        .with_details(ErrorDetails::entity("provider", name))
    }

    /// Invalid configuration value.
    pub fn invalid_configuration(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message)
    }

    /// The provider could not persist a job.
    pub fn enqueue_failed(queue: &str, reason: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::EnqueueFailed,
            format!("Failed to enqueue job on queue '{}'", queue),
            reason,
        )
        .with_details(ErrorDetails::entity("queue", queue))
    }

    /// A job record does not exist.
    pub fn job_not_found(id: JobId) -> Self {
        Self::new(ErrorCode::JobNotFound, format!("Job not found: {}", id))
            .with_details(ErrorDetails::entity("job", id))
    }

    /// The caller no longer holds the claim on a job (its lock expired and
    /// another runner reclaimed it, or the job already finished).
    pub fn claim_lost(id: JobId) -> Self {
        Self::new(
            ErrorCode::ClaimLost,
            format!("Claim on job {} is no longer held", id),
        )
        .with_details(ErrorDetails::entity("job", id))
    }

    /// A stored record carries a status the transition does not allow.
    pub fn invalid_state_transition(id: JobId, from: &str, to: &str) -> Self {
        Self::new(
            ErrorCode::InvalidStateTransition,
            format!("Invalid job state transition for {}: {} -> {}", id, from, to),
        )
        .with_context("from_state", from)
        .with_context("to_state", to)
    }

    /// No decoder is registered for a stored job type.
    pub fn unknown_job_type(job_type: &str) -> Self {
        Self::new(
            ErrorCode::UnknownJobType,
            format!("No job registered for type '{}'", job_type),
        )
        .with_details(ErrorDetails::entity("job_type", job_type))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
