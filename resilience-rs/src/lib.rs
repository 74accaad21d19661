//! # Resilience Layer
//!
//! Failure handling for the analytics backend: calls to external
//! dependencies (model inference, storage, queues) are guarded so that their
//! failures are classified, counted, alerted on and recovered from instead of
//! cascading.
//!
//! ## Components
//!
//! - Per-dependency circuit breakers (CLOSED / OPEN / HALF_OPEN)
//! - Retries with exponential backoff that consult the breaker
//! - A dead-letter processor that resubmits or permanently fails queued work
//! - An error handling service that classifies failures, keeps statistics,
//!   emits metrics and routes alerts by severity
//! - Structured logging with correlation ids and message sanitization
//!
//! Everything is assembled by [`ResilienceLayer`] from a
//! [`ResilienceConfig`] and injected adapters.

pub mod types;
pub mod classification;
pub mod logging;
pub mod sanitization;
pub mod lifecycle;
pub mod queue;
pub mod monitoring;
pub mod reporting;
pub mod circuit_breaker;
pub mod retry;
pub mod handler;
pub mod dead_letter;
pub mod config;
pub mod layer;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use types::{ErrorKind, Failure, ResilienceError, Result};
pub use classification::{classify_failure, ErrorCategory, ErrorClassification, Severity};
pub use logging::{current_correlation_id, init_logging, with_correlation_id, LoggingConfig};
pub use lifecycle::ShutdownSignal;
pub use queue::{InMemoryQueue, QueueClient, QueueError, QueueMessage, SendRequest};
pub use monitoring::{init_metrics_exporter, MetricDatum, MetricSink, RecorderSink, SinkError};
pub use reporting::{Alert, AlertLevel, AlertSink, LogAlertSink, WebhookAlertSink};
pub use circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitState, CircuitStatus};
pub use retry::{RetryConfig, RetryExecutor};
pub use handler::{DataProcessingOutcome, ErrorHandlingService, ErrorResponse};
pub use dead_letter::{DeadLetterProcessor, DlqConfig, DlqStatistics, FailureStore, InMemoryFailureStore, WorkItem};
pub use config::ResilienceConfig;
pub use layer::{HealthReport, HealthStatus, ResilienceLayer};

/// Initializes logging and the metrics exporter from `config`
pub fn init(config: &ResilienceConfig) -> Result<()> {
    init_logging(Some(config.logging.clone()))?;
    init_metrics_exporter(&config.metrics)?;
    Ok(())
}

/// Loads configuration from `path` and the environment, then initializes
/// logging and metrics
pub fn init_from_env(path: Option<&std::path::Path>) -> Result<ResilienceConfig> {
    let config = ResilienceConfig::load(path)?;
    init(&config)?;
    Ok(config)
}
