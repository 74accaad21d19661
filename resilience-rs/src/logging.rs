//! # Structured Logging
//!
//! Subscriber setup and correlation ids. The correlation id lives in a
//! task-local scope so that it follows a unit of work across `.await`
//! points instead of sticking to a worker thread.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::NonBlocking;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};
use uuid::Uuid;

use crate::types::{ResilienceError, Result};

tokio::task_local! {
    static CORRELATION_ID: String;
}

// Flag to track if logging has been initialized
static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Configuration for the logging system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// The log level to use (trace, debug, info, warn, error)
    pub level: String,
    /// The service name, also used as the log file prefix
    pub service_name: String,
    /// Whether to use JSON formatting
    pub json_format: bool,
    /// Directory for daily-rolling log files; none disables file output
    pub log_dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "resilience".to_string(),
            json_format: true,
            log_dir: None,
        }
    }
}

/// Initializes the global tracing subscriber; later calls are no-ops
pub fn init_logging(config: Option<LoggingConfig>) -> Result<()> {
    if LOGGING_INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let config = config.unwrap_or_default();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},warn", config.level)));

    let console_layer = if config.json_format {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer().with_target(true).with_thread_ids(true).boxed()
    };

    let file_layer = config.log_dir.as_ref().map(|dir| {
        let appender = RollingFileAppender::new(Rotation::DAILY, dir, format!("{}.log", config.service_name));
        let (writer, guard) = NonBlocking::new(appender);
        // The guard flushes on drop; the subscriber lives for the whole process
        Box::leak(Box::new(guard));
        fmt::layer().with_writer(writer).with_ansi(false).boxed()
    });

    let subscriber = Registry::default()
        .with(filter)
        .with(console_layer)
        .with(file_layer);

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        LOGGING_INITIALIZED.store(false, Ordering::SeqCst);
        return Err(ResilienceError::Logging(e.to_string()));
    }

    tracing::info!(
        service = %config.service_name,
        level = %config.level,
        json = %config.json_format,
        "Structured logging initialized"
    );

    Ok(())
}

/// Generates a new correlation id
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// The correlation id of the current task, if one is in scope
pub fn current_correlation_id() -> Option<String> {
    CORRELATION_ID.try_with(|id| id.clone()).ok()
}

/// Runs `future` with `correlation_id` in scope
pub async fn with_correlation_id<F, S>(correlation_id: S, future: F) -> F::Output
where
    F: Future,
    S: Into<String>,
{
    CORRELATION_ID.scope(correlation_id.into(), future).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_correlation_id_scope() {
        assert!(current_correlation_id().is_none());

        let result = with_correlation_id("outer-id", async {
            assert_eq!(current_correlation_id().as_deref(), Some("outer-id"));

            let inner = with_correlation_id("inner-id", async { current_correlation_id() }).await;
            assert_eq!(inner.as_deref(), Some("inner-id"));

            // Restored after the nested scope
            current_correlation_id()
        })
        .await;

        assert_eq!(result.as_deref(), Some("outer-id"));
        assert!(current_correlation_id().is_none());
    }

    #[tokio::test]
    async fn test_correlation_id_survives_await() {
        let id = generate_correlation_id();
        let seen = with_correlation_id(id.clone(), async {
            tokio::task::yield_now().await;
            current_correlation_id()
        })
        .await;
        assert_eq!(seen, Some(id));
    }

    #[test]
    fn test_logging_config_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert!(config.json_format);
        assert!(config.log_dir.is_none());
    }
}
