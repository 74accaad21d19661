//! # Failure Types
//!
//! The structured failure value that guarded operations return, and the
//! internal error type used by the layer's own plumbing (configuration,
//! queue transport, metric and alert delivery).

use std::error::Error as StdError;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::monitoring::SinkError;
use crate::queue::QueueError;

/// A type alias for Result with the error type defaulting to [`ResilienceError`]
pub type Result<T, E = ResilienceError> = std::result::Result<T, E>;

/// Structured kind of a failed operation, checked before the message text
/// when a failure is classified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The dependency did not answer in time
    Timeout,
    /// Connection refused, reset or otherwise unreachable
    Connection,
    /// Throttled by the dependency
    RateLimited,
    /// Credentials missing or rejected
    Unauthorized,
    /// Authenticated but not allowed
    Forbidden,
    /// The requested resource does not exist
    NotFound,
    /// The request or payload failed validation
    InvalidArgument,
    /// A security violation was detected
    Security,
    /// The dependency reported itself unavailable
    Unavailable,
    /// Rejected by an open circuit without calling the dependency
    CircuitOpen,
    /// Local I/O failure
    Io,
    /// Payload could not be encoded or decoded
    Serialization,
    /// Anything else
    Other,
}

impl ErrorKind {
    /// Short type name used as the `ErrorType` metric dimension and as the
    /// per-type statistics key
    pub fn type_name(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Connection => "ConnectionError",
            ErrorKind::RateLimited => "RateLimitError",
            ErrorKind::Unauthorized => "UnauthorizedError",
            ErrorKind::Forbidden => "ForbiddenError",
            ErrorKind::NotFound => "NotFoundError",
            ErrorKind::InvalidArgument => "InvalidArgumentError",
            ErrorKind::Security => "SecurityError",
            ErrorKind::Unavailable => "UnavailableError",
            ErrorKind::CircuitOpen => "CircuitOpenError",
            ErrorKind::Io => "IoError",
            ErrorKind::Serialization => "SerializationError",
            ErrorKind::Other => "Error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Connection => "Connection Error",
            ErrorKind::RateLimited => "Rate Limited",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::NotFound => "Not Found",
            ErrorKind::InvalidArgument => "Invalid Argument",
            ErrorKind::Security => "Security Violation",
            ErrorKind::Unavailable => "Service Unavailable",
            ErrorKind::CircuitOpen => "Circuit Open",
            ErrorKind::Io => "I/O Error",
            ErrorKind::Serialization => "Serialization Error",
            ErrorKind::Other => "Error",
        };
        f.write_str(label)
    }
}

/// Failure of a guarded operation
///
/// `Clone` drops the opaque `cause`, keeping every structured field.
#[derive(Debug, Serialize, Deserialize)]
pub struct Failure {
    /// Unique id of this failure instance
    pub id: Uuid,
    /// Structured kind
    pub kind: ErrorKind,
    /// Human readable message
    pub message: String,
    /// When the failure was created
    pub timestamp: DateTime<Utc>,
    /// Additional context as key-value pairs
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    /// Underlying error (not serialized)
    #[serde(skip)]
    pub cause: Option<Box<dyn StdError + Send + Sync>>,
}

impl Clone for Failure {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            kind: self.kind,
            message: self.message.clone(),
            timestamp: self.timestamp,
            context: self.context.clone(),
            cause: None,
        }
    }
}

impl Failure {
    /// Creates a new failure with the specified kind and message
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            message: message.into(),
            timestamp: Utc::now(),
            context: serde_json::Map::new(),
            cause: None,
        }
    }

    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn rate_limited<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Other, message)
    }

    /// Failure reported when an open circuit rejects a call for `key`
    pub fn circuit_open(key: &str) -> Self {
        Self::new(ErrorKind::CircuitOpen, format!("Circuit open for {}", key))
            .context("circuit", key)
    }

    /// Adds context information to the failure
    pub fn context<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Serialize,
    {
        if let Ok(value) = serde_json::to_value(value) {
            self.context.insert(key.into(), value);
        }
        self
    }

    /// Chains this failure with its cause
    pub fn cause<E>(mut self, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Type name of the failure, see [`ErrorKind::type_name`]
    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl StdError for Failure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_ref().map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Failure {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected => ErrorKind::Connection,
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::Forbidden,
            std::io::ErrorKind::InvalidInput | std::io::ErrorKind::InvalidData => {
                ErrorKind::InvalidArgument
            }
            _ => ErrorKind::Io,
        };
        Self::new(kind, err.to_string()).cause(err)
    }
}

impl From<reqwest::Error> for Failure {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else if err.is_connect() {
            ErrorKind::Connection
        } else {
            match err.status().map(|s| s.as_u16()) {
                Some(401) => ErrorKind::Unauthorized,
                Some(403) => ErrorKind::Forbidden,
                Some(404) => ErrorKind::NotFound,
                Some(400) | Some(422) => ErrorKind::InvalidArgument,
                Some(429) => ErrorKind::RateLimited,
                Some(503) => ErrorKind::Unavailable,
                _ => ErrorKind::Other,
            }
        };

        Self::new(kind, format!("HTTP request error: {}", err)).cause(err)
    }
}

impl From<serde_json::Error> for Failure {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::Serialization, format!("JSON error: {}", err)).cause(err)
    }
}

impl From<ResilienceError> for Failure {
    fn from(err: ResilienceError) -> Self {
        match err {
            ResilienceError::Http(e) => Failure::from(e),
            ResilienceError::Json(e) => Failure::from(e),
            other => {
                let kind = match &other {
                    ResilienceError::Queue(QueueError::Transport(_)) => ErrorKind::Connection,
                    ResilienceError::Queue(QueueError::ShuttingDown) => ErrorKind::Unavailable,
                    ResilienceError::Malformed(_) => ErrorKind::Serialization,
                    ResilienceError::InvalidConfig(_) | ResilienceError::ConfigSource(_) => ErrorKind::InvalidArgument,
                    _ => ErrorKind::Other,
                };
                Self::new(kind, other.to_string()).cause(other)
            }
        }
    }
}

/// Errors raised by the layer's own plumbing
#[derive(Debug, Error)]
pub enum ResilienceError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("metric sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("alert delivery failed: {0}")]
    Alert(String),

    #[error("failed to initialize logging: {0}")]
    Logging(String),

    #[error("failed to install metrics exporter: {0}")]
    Metrics(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_creation() {
        let failure = Failure::new(ErrorKind::InvalidArgument, "Invalid input format")
            .context("field", "username")
            .context("attempt", 2);

        assert_eq!(failure.kind, ErrorKind::InvalidArgument);
        assert_eq!(failure.message, "Invalid input format");
        assert_eq!(failure.context["field"], "username");
        assert_eq!(failure.context["attempt"], 2);
    }

    #[test]
    fn test_failure_display() {
        let failure = Failure::timeout("upstream took 31s");
        assert_eq!(failure.to_string(), "Timeout: upstream took 31s");
    }

    #[test]
    fn test_clone_drops_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let failure = Failure::from(io);
        assert_eq!(failure.kind, ErrorKind::Connection);
        assert!(failure.source().is_some());

        let cloned = failure.clone();
        assert_eq!(cloned.id, failure.id);
        assert!(cloned.source().is_none());
    }

    #[test]
    fn test_failure_from_plumbing_error() {
        let failure = Failure::from(ResilienceError::Queue(QueueError::Transport("reset".to_string())));
        assert_eq!(failure.kind, ErrorKind::Connection);
        assert!(failure.source().is_some());

        let failure = Failure::from(ResilienceError::Malformed("missing eventId".to_string()));
        assert_eq!(failure.kind, ErrorKind::Serialization);
        assert_eq!(failure.message, "malformed message: missing eventId");
    }

    #[test]
    fn test_circuit_open_failure() {
        let failure = Failure::circuit_open("payments");
        assert_eq!(failure.kind, ErrorKind::CircuitOpen);
        assert_eq!(failure.context["circuit"], "payments");
        assert_eq!(failure.type_name(), "CircuitOpenError");
    }
}
