//! # Failure Classification
//!
//! Maps a failure to a category and a severity. The structured kind is
//! consulted first; when it is not conclusive the message is matched
//! case-insensitively against keyword groups in a fixed priority order and
//! the first group that matches wins.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{ErrorKind, Failure};

/// Category of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Timeout,
    Network,
    RateLimit,
    ServiceUnavailable,
    Authentication,
    NotFound,
    Validation,
    Unknown,
}

impl ErrorCategory {
    /// Categories worth retrying: the dependency may recover on its own
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Timeout
                | ErrorCategory::Network
                | ErrorCategory::RateLimit
                | ErrorCategory::ServiceUnavailable
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Timeout => "TIMEOUT",
            ErrorCategory::Network => "NETWORK",
            ErrorCategory::RateLimit => "RATE_LIMIT",
            ErrorCategory::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCategory::Authentication => "AUTHENTICATION",
            ErrorCategory::NotFound => "NOT_FOUND",
            ErrorCategory::Validation => "VALIDATION",
            ErrorCategory::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a failure, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "LOW"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::High => write!(f, "HIGH"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Derived classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub severity: Severity,
}

// Keyword groups in priority order
const MESSAGE_RULES: &[(ErrorCategory, &[&str])] = &[
    (ErrorCategory::Timeout, &["timeout", "timed out"]),
    (ErrorCategory::Network, &["connection", "network"]),
    (ErrorCategory::RateLimit, &["throttl", "rate limit", "too many requests"]),
    (
        ErrorCategory::ServiceUnavailable,
        &["service unavailable", "temporarily unavailable"],
    ),
    (ErrorCategory::Authentication, &["unauthorized", "forbidden", "authentication"]),
    (ErrorCategory::NotFound, &["not found", "404"]),
    (ErrorCategory::Validation, &["validation", "invalid"]),
];

/// Classifies a failure from its structured kind and message
pub fn classify(kind: ErrorKind, message: &str) -> ErrorCategory {
    if let Some(category) = category_for_kind(kind) {
        return category;
    }
    classify_message(message)
}

/// Classifies a bare message, as recorded in a dead-letter body
pub fn classify_message(message: &str) -> ErrorCategory {
    let lowered = message.to_lowercase();
    MESSAGE_RULES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| lowered.contains(k)))
        .map(|(category, _)| *category)
        .unwrap_or(ErrorCategory::Unknown)
}

fn category_for_kind(kind: ErrorKind) -> Option<ErrorCategory> {
    match kind {
        ErrorKind::Timeout => Some(ErrorCategory::Timeout),
        ErrorKind::Connection => Some(ErrorCategory::Network),
        ErrorKind::RateLimited => Some(ErrorCategory::RateLimit),
        ErrorKind::Unavailable | ErrorKind::CircuitOpen => Some(ErrorCategory::ServiceUnavailable),
        ErrorKind::Unauthorized | ErrorKind::Forbidden => Some(ErrorCategory::Authentication),
        ErrorKind::NotFound => Some(ErrorCategory::NotFound),
        ErrorKind::InvalidArgument => Some(ErrorCategory::Validation),
        ErrorKind::Security | ErrorKind::Io | ErrorKind::Serialization | ErrorKind::Other => None,
    }
}

/// Severity of a category; security violations are always critical
pub fn assess_severity(category: ErrorCategory, kind: ErrorKind) -> Severity {
    if kind == ErrorKind::Security {
        return Severity::Critical;
    }
    match category {
        ErrorCategory::Authentication | ErrorCategory::Validation => Severity::Critical,
        ErrorCategory::Network | ErrorCategory::Timeout | ErrorCategory::ServiceUnavailable => {
            Severity::High
        }
        ErrorCategory::RateLimit | ErrorCategory::NotFound => Severity::Medium,
        ErrorCategory::Unknown => Severity::Low,
    }
}

/// Full classification of a failure
pub fn classify_failure(failure: &Failure) -> ErrorClassification {
    let category = classify(failure.kind, &failure.message);
    ErrorClassification {
        category,
        severity: assess_severity(category, failure.kind),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wins_over_message() {
        assert_eq!(
            classify(ErrorKind::InvalidArgument, "connection refused"),
            ErrorCategory::Validation
        );
        assert_eq!(classify(ErrorKind::Timeout, "invalid token"), ErrorCategory::Timeout);
    }

    #[test]
    fn test_message_priority_order() {
        // Timeout beats network when both keywords are present
        assert_eq!(
            classify_message("Connection timed out after 30s"),
            ErrorCategory::Timeout
        );
        assert_eq!(
            classify_message("network error: Too Many Requests"),
            ErrorCategory::Network
        );
        assert_eq!(classify_message("Request THROTTLED by upstream"), ErrorCategory::RateLimit);
        assert_eq!(
            classify_message("Service Unavailable, try later"),
            ErrorCategory::ServiceUnavailable
        );
        assert_eq!(classify_message("403 Forbidden"), ErrorCategory::Authentication);
        assert_eq!(classify_message("user 42 not found"), ErrorCategory::NotFound);
        assert_eq!(classify_message("HTTP 404"), ErrorCategory::NotFound);
        assert_eq!(classify_message("Invalid payload"), ErrorCategory::Validation);
        assert_eq!(classify_message("something odd"), ErrorCategory::Unknown);
    }

    #[test]
    fn test_other_kind_falls_back_to_message() {
        assert_eq!(classify(ErrorKind::Other, "rate limit exceeded"), ErrorCategory::RateLimit);
        assert_eq!(classify(ErrorKind::Io, ""), ErrorCategory::Unknown);
    }

    #[test]
    fn test_severity_mapping() {
        use ErrorCategory::*;
        assert_eq!(assess_severity(Authentication, ErrorKind::Other), Severity::Critical);
        assert_eq!(assess_severity(Validation, ErrorKind::Other), Severity::Critical);
        assert_eq!(assess_severity(Network, ErrorKind::Other), Severity::High);
        assert_eq!(assess_severity(Timeout, ErrorKind::Other), Severity::High);
        assert_eq!(assess_severity(ServiceUnavailable, ErrorKind::Other), Severity::High);
        assert_eq!(assess_severity(RateLimit, ErrorKind::Other), Severity::Medium);
        assert_eq!(assess_severity(NotFound, ErrorKind::Other), Severity::Medium);
        assert_eq!(assess_severity(Unknown, ErrorKind::Other), Severity::Low);
        assert_eq!(assess_severity(Unknown, ErrorKind::Security), Severity::Critical);
    }

    #[test]
    fn test_retryable_categories() {
        assert!(ErrorCategory::Timeout.is_retryable());
        assert!(ErrorCategory::Network.is_retryable());
        assert!(ErrorCategory::RateLimit.is_retryable());
        assert!(ErrorCategory::ServiceUnavailable.is_retryable());
        assert!(!ErrorCategory::Validation.is_retryable());
        assert!(!ErrorCategory::Authentication.is_retryable());
        assert!(!ErrorCategory::NotFound.is_retryable());
        assert!(!ErrorCategory::Unknown.is_retryable());
    }

    #[test]
    fn test_classify_failure() {
        let c = classify_failure(&Failure::other("Unauthorized: bad key"));
        assert_eq!(c.category, ErrorCategory::Authentication);
        assert_eq!(c.severity, Severity::Critical);
    }
}
