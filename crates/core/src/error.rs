//! Error types for the Anjia domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; the loop only ever sees
//! tool errors as data (folded into a `ToolOutcome`), never as a failure.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures surfaced by a model gateway.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("Rate limited by model backend{}", retry_after_secs.map(|s| format!(", retry after {s}s")).unwrap_or_default())]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Model backend unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed model response: {0}")]
    Protocol(String),

    #[error("Model call timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Authentication failed: {0}")]
    Authentication(String),
}

/// How the agent loop may retry a failed gateway call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Retry with exponential backoff up to the attempt cap.
    Backoff,
    /// Retry exactly once, immediately.
    Once,
    /// Fail the turn right away.
    Never,
}

impl GatewayError {
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::RateLimited { .. } | Self::Unavailable(_) | Self::Timeout { .. } => {
                RetryClass::Backoff
            }
            Self::Protocol(_) => RetryClass::Once,
            Self::Authentication(_) => RetryClass::Never,
        }
    }
}

/// Failures of a single tool invocation. Always recoverable from the
/// loop's point of view: they are reported back to the model.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for {tool_name}: {reason}")]
    InvalidArguments { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },
}

/// Wire-level classification of a tool failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    InvalidArguments,
    UnknownTool,
    Timeout,
    ExecutionError,
}

impl ToolError {
    pub fn kind(&self) -> ToolErrorKind {
        match self {
            Self::UnknownTool(_) => ToolErrorKind::UnknownTool,
            Self::InvalidArguments { .. } => ToolErrorKind::InvalidArguments,
            Self::Timeout { .. } => ToolErrorKind::Timeout,
            Self::ExecutionFailed { .. } => ToolErrorKind::ExecutionError,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Conversation {0} is busy with another request, retry later")]
    ConversationBusy(String),

    #[error("Conversation not found: {0}")]
    NotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_error_displays_correctly() {
        let err = GatewayError::RateLimited {
            retry_after_secs: Some(5),
        };
        assert!(err.to_string().contains("retry after 5s"));

        let err = GatewayError::RateLimited {
            retry_after_secs: None,
        };
        assert_eq!(err.to_string(), "Rate limited by model backend");
    }

    #[test]
    fn retry_classes() {
        assert_eq!(
            GatewayError::Unavailable("503".into()).retry_class(),
            RetryClass::Backoff
        );
        assert_eq!(
            GatewayError::Timeout { timeout_secs: 1 }.retry_class(),
            RetryClass::Backoff
        );
        assert_eq!(
            GatewayError::Protocol("bad json".into()).retry_class(),
            RetryClass::Once
        );
        assert_eq!(
            GatewayError::Authentication("bad key".into()).retry_class(),
            RetryClass::Never
        );
    }

    #[test]
    fn tool_error_kinds() {
        let err = ToolError::Timeout {
            tool_name: "policy_lookup".into(),
            timeout_secs: 30,
        };
        assert_eq!(err.kind(), ToolErrorKind::Timeout);
        assert!(err.to_string().contains("policy_lookup"));
        assert_eq!(
            serde_json::to_string(&ToolErrorKind::InvalidArguments).unwrap(),
            r#""invalid_arguments""#
        );
    }

    #[test]
    fn busy_error_mentions_id() {
        let err = SessionError::ConversationBusy("conv_1234abcd".into());
        assert!(err.to_string().contains("conv_1234abcd"));
    }
}
