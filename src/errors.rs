use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Attached to a failure that was retried at least once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryMetadata {
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Structured validation/configuration error raised before any network call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{field}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<String> for ValidationError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for ValidationError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Error envelope returned by the DingTalk open API (`{"code", "message", "requestid"}`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct APIError {
    pub status: u16,
    pub code: Option<String>,
    pub message: String,
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<RetryMetadata>,
    /// Raw response body for debugging (when available).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_body: Option<String>,
}

impl APIError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            code: None,
            message: message.into(),
            request_id: None,
            retries: None,
            raw_body: None,
        }
    }
}

impl fmt::Display for APIError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{code} ({}): {}", self.status, self.message),
            None => write!(f, "{}: {}", self.status, self.message),
        }
    }
}

impl std::error::Error for APIError {}

/// Transport-level error (timeouts, DNS/TLS/connectivity, broken streams).
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    #[source]
    pub source: Option<reqwest::Error>,
    pub retries: Option<RetryMetadata>,
}

impl TransportError {
    pub(crate) fn from_reqwest(err: reqwest::Error, retries: Option<RetryMetadata>) -> Self {
        let kind = if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::Connect
        } else if err.is_request() {
            TransportErrorKind::Request
        } else {
            TransportErrorKind::Other
        };
        Self {
            kind,
            message: err.to_string(),
            source: Some(err),
            retries,
        }
    }

    pub(crate) fn connect(message: impl Into<String>, err: reqwest::Error) -> Self {
        Self {
            kind: TransportErrorKind::Connect,
            message: message.into(),
            source: Some(err),
            retries: None,
        }
    }
}

/// Broad transport error kinds for classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Request,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Connect => "connect",
            TransportErrorKind::Request => "request",
            TransportErrorKind::Other => "transport",
        };
        write!(f, "{label}")
    }
}

/// Failure of a single unary request, before it is attributed to an operation.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("{0}")]
    Api(#[from] APIError),

    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("response did not include {0}")]
    MissingField(&'static str),
}

impl RequestError {
    /// HTTP status reported by the remote service, if the request got that far.
    pub fn status(&self) -> Option<u16> {
        match self {
            RequestError::Api(err) => Some(err.status),
            _ => None,
        }
    }
}

/// Unified error type surfaced by the crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ValidationError),

    #[error("failed to acquire access token: {0}")]
    TokenAcquisition(#[source] RequestError),

    #[error("failed to create assistant thread: {0}")]
    SessionCreation(#[source] RequestError),

    #[error("failed to create message: {0}")]
    MessageCreation(#[source] RequestError),

    #[error("failed to start run: {0}")]
    RunStart(#[source] RequestError),

    #[error("failed to delete thread {thread_id}: {source}")]
    SessionDeletion {
        thread_id: String,
        #[source]
        source: RequestError,
    },

    #[error("malformed {event} payload: {source}")]
    StreamDecode {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("stream {0}")]
    Transport(#[from] TransportError),
}

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Config(ValidationError::new(message))
    }

    /// Whether this error aborts an invocation (everything except decode/cleanup noise).
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::StreamDecode { .. } | Error::SessionDeletion { .. }
        )
    }
}

/// Convenience alias for fallible results.
pub type Result<T, E = Error> = std::result::Result<T, E>;
