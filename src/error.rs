use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Failures of the inspection pipeline.
///
/// `Configuration` is fatal and stops the run before any task starts. Every
/// other variant is scoped to a single image: the driver records it in that
/// image's result and moves on.
#[derive(Error, Debug)]
pub enum InspectError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Image read error: {path}: {reason}")]
    ImageRead { path: PathBuf, reason: String },

    #[error("Inference unavailable after {attempts} attempt(s): {source}")]
    InferenceUnavailable {
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("Response format error: {0}")]
    ResponseFormat(String),

    #[error("Render error: {0}")]
    Render(String),

    #[error("Output error: {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl InspectError {
    pub fn config(msg: impl Into<String>) -> Self {
        InspectError::Configuration(msg.into())
    }

    pub fn image_read(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        InspectError::ImageRead {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn output(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        InspectError::Output {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            InspectError::Configuration(_) => ErrorKind::ConfigurationError,
            InspectError::ImageRead { .. } => ErrorKind::ImageReadError,
            InspectError::InferenceUnavailable { .. } => ErrorKind::InferenceUnavailableError,
            InspectError::ResponseFormat(_) => ErrorKind::ResponseFormatError,
            InspectError::Render(_) => ErrorKind::RenderError,
            InspectError::Output { .. } => ErrorKind::OutputError,
        }
    }
}

/// Error category as persisted in result files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    ConfigurationError,
    ImageReadError,
    InferenceUnavailableError,
    ResponseFormatError,
    RenderError,
    OutputError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConfigurationError => "ConfigurationError",
            ErrorKind::ImageReadError => "ImageReadError",
            ErrorKind::InferenceUnavailableError => "InferenceUnavailableError",
            ErrorKind::ResponseFormatError => "ResponseFormatError",
            ErrorKind::RenderError => "RenderError",
            ErrorKind::OutputError => "OutputError",
        }
    }
}

/// A single failed exchange with the inference endpoint.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("server returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("transport failure: {0}")]
    Other(String),
}

impl TransportError {
    /// Whether another attempt may succeed.
    ///
    /// Timeouts, refused connections, 5xx and 429 are transient. Any other
    /// status and malformed requests fail immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Timeout(_) | TransportError::Connect(_) => true,
            TransportError::Status { status, .. } => *status == 429 || (500..600).contains(status),
            TransportError::InvalidRequest(_) => false,
            TransportError::Other(_) => true,
        }
    }

    /// Truncates long error bodies so they stay readable in logs and results.
    pub fn status(status: u16, body: &str) -> Self {
        const MAX_BODY: usize = 512;
        let body = match body.char_indices().nth(MAX_BODY) {
            Some((idx, _)) => format!("{}...", &body[..idx]),
            None => body.to_string(),
        };
        TransportError::Status { status, body }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout(err.to_string())
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else if err.is_builder() {
            TransportError::InvalidRequest(err.to_string())
        } else if let Some(status) = err.status() {
            TransportError::status(status.as_u16(), &err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, InspectError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::Timeout("t".into()).is_transient());
        assert!(TransportError::Connect("refused".into()).is_transient());
        assert!(TransportError::status(503, "busy").is_transient());
        assert!(TransportError::status(500, "").is_transient());
        assert!(TransportError::status(429, "slow down").is_transient());

        assert!(!TransportError::status(400, "bad").is_transient());
        assert!(!TransportError::status(404, "missing").is_transient());
        assert!(!TransportError::status(401, "").is_transient());
        assert!(!TransportError::InvalidRequest("bad url".into()).is_transient());
    }

    #[test]
    fn test_status_body_truncated() {
        let body = "x".repeat(2000);
        match TransportError::status(500, &body) {
            TransportError::Status { body, .. } => assert_eq!(body.len(), 515),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_error_kinds_serialize_as_taxonomy_names() {
        let err = InspectError::InferenceUnavailable {
            attempts: 3,
            source: TransportError::Timeout("slow".into()),
        };
        assert_eq!(err.kind(), ErrorKind::InferenceUnavailableError);
        assert_eq!(
            serde_json::to_string(&err.kind()).unwrap(),
            "\"InferenceUnavailableError\""
        );
        assert!(err.to_string().contains("3 attempt(s)"));
        assert_eq!(ErrorKind::RenderError.as_str(), "RenderError");
    }
}
