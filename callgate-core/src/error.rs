use crate::request::Response;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Timeout,
    Cancel,
    Http,
    Parse,
    Validation,
    QueueFull,
    QueueTimeout,
    MutationPending,
    MethodNotFound,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Network => "network_error",
            ErrorKind::Timeout => "timeout_error",
            ErrorKind::Cancel => "cancel_error",
            ErrorKind::Http => "http_error",
            ErrorKind::Parse => "parse_error",
            ErrorKind::Validation => "validation_error",
            ErrorKind::QueueFull => "queue_full_error",
            ErrorKind::QueueTimeout => "queue_timeout_error",
            ErrorKind::MutationPending => "mutation_pending_error",
            ErrorKind::MethodNotFound => "method_not_found",
            ErrorKind::Unknown => "unknown_error",
        };
        write!(f, "{}", s)
    }
}

/// Diagnostic context attached to errors that leave the engine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorContext {
    pub method_name: String,
    pub params: Value,
    pub timestamp: DateTime<Utc>,
}

/// The single error type surfaced by the request pipeline.
///
/// Errors are `Clone` because one failed execution is delivered to every
/// caller joined on the same deduplicated request.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct CallError {
    pub kind: ErrorKind,
    pub message: String,
    /// HTTP status for `ErrorKind::Http`, or the status of an attached response
    pub status: Option<u16>,
    /// Transport-specific error code (e.g. `ECONNRESET`)
    pub code: Option<String>,
    pub response: Option<Box<Response>>,
    pub context: Option<Box<ErrorContext>>,
}

impl CallError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        CallError {
            kind,
            message: message.into(),
            status: None,
            code: None,
            response: None,
            context: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancel, message)
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorKind::Http, message);
        err.status = Some(status);
        err
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parse, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn queue_full(max_queue_size: usize) -> Self {
        Self::new(
            ErrorKind::QueueFull,
            format!("Queue is full (max {} queued requests)", max_queue_size),
        )
    }

    pub fn queue_timeout(waited_ms: u128) -> Self {
        Self::new(
            ErrorKind::QueueTimeout,
            format!("Request timed out after {}ms in queue", waited_ms),
        )
    }

    pub fn mutation_pending() -> Self {
        Self::new(ErrorKind::MutationPending, "Mutation is pending")
    }

    pub fn method_not_found(name: &str) -> Self {
        Self::new(ErrorKind::MethodNotFound, format!("Method not found: {}", name))
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_response(mut self, response: Response) -> Self {
        if self.status.is_none() {
            self.status = Some(response.status);
        }
        self.response = Some(Box::new(response));
        self
    }

    /// Tag the error with the method and params that produced it.
    /// An existing context is kept so the innermost call site wins.
    pub fn with_context(mut self, method_name: &str, params: &Value) -> Self {
        if self.context.is_none() {
            self.context = Some(Box::new(ErrorContext {
                method_name: method_name.to_string(),
                params: params.clone(),
                timestamp: Utc::now(),
            }));
        }
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancel
    }

    /// Default retry eligibility: network and timeout failures, HTTP 5xx,
    /// 408 and 429. Local capacity limits and client errors are final.
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            ErrorKind::Network | ErrorKind::Timeout => true,
            ErrorKind::Http => match self.status {
                Some(408) | Some(429) => true,
                Some(status) => (500..600).contains(&status),
                None => false,
            },
            _ => false,
        }
    }
}

impl From<serde_json::Error> for CallError {
    fn from(err: serde_json::Error) -> Self {
        CallError::parse(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_convenience_constructors() {
        assert_eq!(CallError::network("down").kind, ErrorKind::Network);
        assert_eq!(CallError::timeout("slow").kind, ErrorKind::Timeout);
        assert_eq!(CallError::cancelled("stop").kind, ErrorKind::Cancel);
        assert_eq!(CallError::parse("bad").kind, ErrorKind::Parse);
        assert_eq!(CallError::validation("shape").kind, ErrorKind::Validation);
        assert_eq!(CallError::queue_full(3).kind, ErrorKind::QueueFull);
        assert_eq!(CallError::queue_timeout(10).kind, ErrorKind::QueueTimeout);
        assert_eq!(CallError::unknown("?").kind, ErrorKind::Unknown);

        let err = CallError::http(503, "unavailable");
        assert_eq!(err.kind, ErrorKind::Http);
        assert_eq!(err.status, Some(503));
    }

    #[test]
    fn test_mutation_pending_message() {
        let err = CallError::mutation_pending();
        assert_eq!(err.kind, ErrorKind::MutationPending);
        assert_eq!(err.message, "Mutation is pending");
    }

    #[test]
    fn test_retry_eligibility() {
        assert!(CallError::network("reset").is_retryable());
        assert!(CallError::timeout("slow").is_retryable());
        assert!(CallError::http(500, "").is_retryable());
        assert!(CallError::http(503, "").is_retryable());
        assert!(CallError::http(408, "").is_retryable());
        assert!(CallError::http(429, "").is_retryable());

        for status in [400, 401, 403, 404, 405, 422] {
            assert!(!CallError::http(status, "").is_retryable(), "{}", status);
        }

        assert!(!CallError::cancelled("x").is_retryable());
        assert!(!CallError::validation("x").is_retryable());
        assert!(!CallError::queue_full(1).is_retryable());
        assert!(!CallError::queue_timeout(1).is_retryable());
    }

    #[test]
    fn test_context_keeps_innermost() {
        let err = CallError::network("down")
            .with_context("item.list", &json!({"page": 1}))
            .with_context("outer", &json!(null));

        let ctx = err.context.unwrap();
        assert_eq!(ctx.method_name, "item.list");
        assert_eq!(ctx.params, json!({"page": 1}));
    }

    #[test]
    fn test_error_display() {
        let err = CallError::http(404, "Not Found");
        let display = format!("{}", err);
        assert!(display.contains("http_error"));
        assert!(display.contains("Not Found"));
    }
}
