//! Error handling for Tributary Core.
//!
//! This module provides:
//! - A single crate error type with machine-readable codes and chaining
//! - Severity levels that drive how an error is logged
//! - Metrics integration for error tracking
//!
//! # Usage
//!
//! ```rust,ignore
//! use tributary_core::error::{TributaryError, Result};
//!
//! fn lookup(aggregate: &Aggregate) -> Result<()> {
//!     if aggregate.id.is_empty() {
//!         return Err(TributaryError::invalid_aggregate("aggregate id is empty"));
//!     }
//!     Ok(())
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Tributary operations.
pub type Result<T> = std::result::Result<T, TributaryError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Event store errors (1000-1099)
    EncodingError,
    InvalidAggregate,

    // Transport errors (2000-2099)
    TransportError,
    TransportClosed,

    // Controller errors (3000-3099)
    ActionApplicationError,
    ConvergenceError,

    // Function errors (4000-4099)
    FunctionInputError,
    FunctionNotFound,

    // Configuration errors (5000-5099)
    ConfigurationError,

    // Internal errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::EncodingError => 1000,
            Self::InvalidAggregate => 1001,

            Self::TransportError => 2000,
            Self::TransportClosed => 2001,

            Self::ActionApplicationError => 3000,
            Self::ConvergenceError => 3001,

            Self::FunctionInputError => 4000,
            Self::FunctionNotFound => 4001,

            Self::ConfigurationError => 5000,

            Self::InternalError => 9000,
        }
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self {
            Self::EncodingError | Self::InvalidAggregate => "event_store",
            Self::TransportError | Self::TransportClosed => "transport",
            Self::ActionApplicationError | Self::ConvergenceError => "controller",
            Self::FunctionInputError | Self::FunctionNotFound => "function",
            Self::ConfigurationError => "configuration",
            Self::InternalError => "internal",
        }
    }

    /// Whether a caller may reasonably retry the failed operation.
    ///
    /// Nothing in this crate retries on its own; this is advice for callers.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransportError)
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
    /// Caller errors (bad input)
    Low,
    /// Operational issues (a single event or action failed)
    Medium,
    /// System errors (transport failures)
    High,
    /// Critical errors requiring immediate attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::InvalidAggregate
            | ErrorCode::FunctionInputError
            | ErrorCode::FunctionNotFound => Self::Low,

            ErrorCode::EncodingError
            | ErrorCode::ActionApplicationError
            | ErrorCode::TransportClosed => Self::Medium,

            ErrorCode::TransportError
            | ErrorCode::ConvergenceError
            | ErrorCode::ConfigurationError => Self::High,

            ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Subject the failing operation addressed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Tributary Core.
#[derive(Error, Debug)]
pub struct TributaryError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Human-readable message
    message: Cow<'static, str>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for TributaryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(ref subject) = self.details.subject {
            write!(f, " (subject: {})", subject)?;
        }
        Ok(())
    }
}

impl TributaryError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and message.
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            message: message.into(),
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Event payload failed to serialize or deserialize.
    pub fn encoding(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::EncodingError, message)
    }

    /// Malformed aggregate identity.
    pub fn invalid_aggregate(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidAggregate, message)
    }

    /// Underlying publish/subscribe/read failure.
    pub fn transport(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::TransportError, message)
    }

    /// The transport connection has been closed.
    pub fn transport_closed() -> Self {
        Self::new(ErrorCode::TransportClosed, "transport connection is closed")
    }

    /// A terminal error action's cause, surfaced by the controller.
    pub fn action(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ActionApplicationError, message)
    }

    /// Action refinement did not reach a fixed point in time.
    pub fn convergence(iterations: usize) -> Self {
        Self::new(
            ErrorCode::ConvergenceError,
            format!("action did not converge after {} iterations", iterations),
        )
        .with_context("iterations", iterations)
    }

    /// Invalid function invocation inputs.
    pub fn function_input(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::FunctionInputError, message)
    }

    /// No function registered under a name.
    pub fn function_not_found(name: &str) -> Self {
        Self::new(
            ErrorCode::FunctionNotFound,
            format!("function '{}' is not registered", name),
        )
        .with_context("function", name)
    }

    /// Invalid or missing configuration.
    pub fn configuration(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message)
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InternalError, message)
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

    /// Record the subject the failing operation addressed.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.details.subject = Some(subject.into());
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
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

    /// Get the message.
    pub fn message(&self) -> &str {
        &self.message
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

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical | ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    details = ?self.details,
                    source = ?self.source,
                    "Tributary error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    source = ?self.source,
                    "Tributary error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    "Tributary error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category()
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<serde_json::Error> for TributaryError {
    fn from(err: serde_json::Error) -> Self {
        Self::encoding(format!("event payload encoding failed: {}", err)).with_source(err)
    }
}

impl From<redis::RedisError> for TributaryError {
    fn from(err: redis::RedisError) -> Self {
        Self::transport(format!("redis operation failed: {}", err)).with_source(err)
    }
}

impl From<config::ConfigError> for TributaryError {
    fn from(err: config::ConfigError) -> Self {
        Self::configuration(err.to_string()).with_source(err)
    }
}

impl From<tokio::sync::AcquireError> for TributaryError {
    fn from(err: tokio::sync::AcquireError) -> Self {
        Self::internal("evaluation permit pool closed").with_source(err)
    }
}
