//! Error types for the invocation pipeline.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use toolgate_core::{CallError, CircuitOpenError, RateLimitExceeded, Retryable};
use toolgate_policy::ReasonCode;

/// Stable codes surfaced to callers of [`Gateway::invoke`](crate::Gateway::invoke).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ToolNotFound,
    ConnectorNotFound,
    ValidationError,
    PolicyDenied,
    ExecutionError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolNotFound => "TOOL_NOT_FOUND",
            Self::ConnectorNotFound => "CONNECTOR_NOT_FOUND",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::PolicyDenied => "POLICY_DENIED",
            Self::ExecutionError => "EXECUTION_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a tool handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ToolError {
    pub message: String,
    /// Downstream HTTP status, when the tool wraps an HTTP API.
    pub status: Option<u16>,
    retryable: bool,
}

impl ToolError {
    /// A failure a later attempt may not fix (bad request, conflict).
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            retryable: false,
        }
    }

    /// A transient failure (timeout, connection reset).
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            retryable: true,
        }
    }

    /// Classify by HTTP status: 429, 408 and 5xx are transient.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: Some(status),
            retryable: status == 429 || status == 408 || status >= 500,
        }
    }
}

impl Retryable for ToolError {
    fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// Why the execute step failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionFailure {
    /// The tool handler returned an error (after any retries).
    #[error("{0}")]
    Tool(ToolError),

    #[error(transparent)]
    RateLimited(RateLimitExceeded),

    #[error(transparent)]
    CircuitOpen(CircuitOpenError),

    /// A duplicate of this step is still executing.
    #[error("operation '{key}' is already in progress")]
    InProgress { key: String },
}

impl ExecutionFailure {
    pub fn is_admission_control(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::CircuitOpen(_))
    }
}

impl From<CallError<ToolError>> for ExecutionFailure {
    fn from(e: CallError<ToolError>) -> Self {
        match e {
            CallError::RateLimited(e) => Self::RateLimited(e),
            CallError::CircuitOpen(e) => Self::CircuitOpen(e),
            CallError::Failed(e) => Self::Tool(e),
        }
    }
}

/// Input or output side of a tool contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaStage {
    Input,
    Output,
}

impl fmt::Display for SchemaStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Input => "input",
            Self::Output => "output",
        })
    }
}

/// Failure of one invocation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvocationError {
    #[error("Tool '{tool_name}' not found")]
    ToolNotFound { tool_name: String },

    #[error("Connector '{connector_id}' not found")]
    ConnectorNotFound { connector_id: String },

    #[error("{stage} validation failed: {}", .errors.join("; "))]
    Validation {
        stage: SchemaStage,
        errors: Vec<String>,
    },

    #[error("Policy denied ({reason_code}): {message}")]
    PolicyDenied {
        reason_code: ReasonCode,
        rule_id: Option<String>,
        message: String,
    },

    #[error("Execution failed: {0}")]
    Execution(#[from] ExecutionFailure),
}

impl InvocationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ToolNotFound { .. } => ErrorCode::ToolNotFound,
            Self::ConnectorNotFound { .. } => ErrorCode::ConnectorNotFound,
            Self::Validation { .. } => ErrorCode::ValidationError,
            Self::PolicyDenied { .. } => ErrorCode::PolicyDenied,
            Self::Execution(_) => ErrorCode::ExecutionError,
        }
    }

    /// Wait suggested by a rate limiter or open circuit.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Execution(ExecutionFailure::RateLimited(e)) => Some(e.retry_after),
            Self::Execution(ExecutionFailure::CircuitOpen(e)) => Some(e.retry_after),
            _ => None,
        }
    }

    /// When an open circuit will admit a probe.
    pub fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Execution(ExecutionFailure::CircuitOpen(e)) => Some(e.next_attempt_at),
            _ => None,
        }
    }

    /// Returns `true` if the caller may usefully retry later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Execution(ExecutionFailure::Tool(e)) => e.is_retryable(),
            Self::Execution(f) => f.is_admission_control(),
            _ => false,
        }
    }
}

/// Audit sink failure. Logged by the pipeline, never propagated.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Audit sink unavailable: {0}")]
    Unavailable(String),
}

/// Configuration loading failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading config '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error in config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
