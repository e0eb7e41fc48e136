use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The transient failure categories that the retry advisor is allowed to retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientKind {
    Timeout,
    Connection,
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransientKind::Timeout => write!(f, "timeout"),
            TransientKind::Connection => write!(f, "connection"),
        }
    }
}

/// A single reason why a model reply could not be mapped onto an output shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldIssue {
    pub field: String,
    pub problem: String,
}

impl FieldIssue {
    pub fn new<F: Into<String>, P: Into<String>>(field: F, problem: P) -> Self {
        Self {
            field: field.into(),
            problem: problem.into(),
        }
    }
}

impl fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}` {}", self.field, self.problem)
    }
}

/// Caller-facing error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    InvalidRequest,
    TransientUpstream,
    FatalUpstream,
    ConversionFailure,
    ToolExecutionFailure,
    ObservationFailure,
    Cancelled,
    Configuration,
}

impl ErrorCategory {
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::InvalidRequest => "invalid_request",
            ErrorCategory::TransientUpstream => "transient_upstream",
            ErrorCategory::FatalUpstream => "fatal_upstream",
            ErrorCategory::ConversionFailure => "conversion_failure",
            ErrorCategory::ToolExecutionFailure => "tool_execution_failure",
            ErrorCategory::ObservationFailure => "observation_failure",
            ErrorCategory::Cancelled => "cancelled",
            ErrorCategory::Configuration => "configuration",
        }
    }
}

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Upstream {kind} failure: {message}")]
    TransientUpstream { kind: TransientKind, message: String },

    #[error("Upstream failure: {0}")]
    FatalUpstream(String),

    #[error("Failed to convert response to {target}: {}", join_issues(.issues))]
    Conversion {
        target: String,
        issues: Vec<FieldIssue>,
    },

    #[error("Tool `{tool}` failed for input {input}: {message}")]
    ToolExecution {
        tool: String,
        input: String,
        message: String,
    },

    #[error("Observation failed: {0}")]
    Observation(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

fn join_issues(issues: &[FieldIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl GatewayError {
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        GatewayError::TransientUpstream {
            kind: TransientKind::Timeout,
            message: message.into(),
        }
    }

    pub fn connection<S: Into<String>>(message: S) -> Self {
        GatewayError::TransientUpstream {
            kind: TransientKind::Connection,
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            GatewayError::InvalidRequest(_) => ErrorCategory::InvalidRequest,
            GatewayError::TransientUpstream { .. } => ErrorCategory::TransientUpstream,
            GatewayError::FatalUpstream(_) => ErrorCategory::FatalUpstream,
            GatewayError::Conversion { .. } => ErrorCategory::ConversionFailure,
            GatewayError::ToolExecution { .. } => ErrorCategory::ToolExecutionFailure,
            GatewayError::Observation(_) => ErrorCategory::ObservationFailure,
            GatewayError::Cancelled => ErrorCategory::Cancelled,
            GatewayError::Config(_) => ErrorCategory::Configuration,
        }
    }

    /// Only timeouts and transport failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::TransientUpstream { .. })
    }

    /// Field names named by a conversion failure, in report order
    pub fn offending_fields(&self) -> Vec<&str> {
        match self {
            GatewayError::Conversion { issues, .. } => {
                issues.iter().map(|issue| issue.field.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::timeout(err.to_string())
        } else if err.is_connect() || err.is_request() || err.is_body() {
            GatewayError::connection(err.to_string())
        } else if err.is_decode() {
            GatewayError::FatalUpstream(format!("malformed response body: {}", err))
        } else {
            GatewayError::FatalUpstream(err.to_string())
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
