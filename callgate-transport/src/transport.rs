use async_trait::async_trait;
use callgate_core::{CallError, ErrorKind, RequestSpec, Response};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    Network,
    Timeout,
    Http,
    Parse,
    Cancelled,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportErrorKind::Network => "network",
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Http => "http",
            TransportErrorKind::Parse => "parse",
            TransportErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Failure reported by an adapter before a usable response was produced
#[derive(Debug, Clone, Error)]
#[error("{kind} error: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    /// Low-level error code such as `ECONNREFUSED`
    pub code: Option<String>,
    pub response: Option<Box<Response>>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        TransportError {
            kind,
            message: message.into(),
            code: None,
            response: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Parse, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Cancelled, message)
    }

    /// An HTTP failure carrying the response that caused it
    pub fn http(response: Response) -> Self {
        let message = format!("Request failed with status {}", response.status);
        TransportError {
            response: Some(Box::new(response)),
            ..Self::new(TransportErrorKind::Http, message)
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl From<TransportError> for CallError {
    fn from(err: TransportError) -> Self {
        let kind = match err.kind {
            TransportErrorKind::Network => ErrorKind::Network,
            TransportErrorKind::Timeout => ErrorKind::Timeout,
            TransportErrorKind::Http => ErrorKind::Http,
            TransportErrorKind::Parse => ErrorKind::Parse,
            TransportErrorKind::Cancelled => ErrorKind::Cancel,
        };

        let mut call_err = match (&err.response, kind) {
            (Some(response), ErrorKind::Http) => CallError::http(response.status, err.message),
            _ => CallError::new(kind, err.message),
        };
        if let Some(code) = err.code {
            call_err = call_err.with_code(code);
        }
        if let Some(response) = err.response {
            call_err = call_err.with_response(*response);
        }
        call_err
    }
}

/// Performs one HTTP exchange. Any status the server answered with is an
/// `Ok` response; the pipeline decides what counts as failure.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn request(&self, request: &RequestSpec) -> Result<Response, TransportError>;
}

#[async_trait]
impl<T: HttpTransport + ?Sized> HttpTransport for Arc<T> {
    async fn request(&self, request: &RequestSpec) -> Result<Response, TransportError> {
        (**self).request(request).await
    }
}
