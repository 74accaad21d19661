//! # Resilience Layer
//!
//! Composition root: builds the circuit breaker, retry executor, error
//! handling service and dead-letter processor from one [`ResilienceConfig`]
//! and the injected adapters, and owns the shutdown signal they share.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::ResilienceConfig;
use crate::dead_letter::{DeadLetterProcessor, DlqStatistics, FailureStore, InMemoryFailureStore};
use crate::handler::{ErrorHandlingDeps, ErrorHandlingService};
use crate::lifecycle::ShutdownSignal;
use crate::logging::{current_correlation_id, generate_correlation_id, with_correlation_id};
use crate::monitoring::{MetricSink, RecorderSink};
use crate::queue::QueueClient;
use crate::reporting::{AlertSink, LogAlertSink, WebhookAlertSink};
use crate::retry::RetryExecutor;
use crate::types::{ErrorKind, Failure, ResilienceError, Result};

/// Overall health of the layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    /// At least one circuit is open
    Degraded,
}

/// Operator summary of the layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub open_circuits: Vec<String>,
    pub half_open_circuits: Vec<String>,
    pub total_errors: u64,
    pub dead_letter: Option<DlqStatistics>,
}

/// Builder for [`ResilienceLayer`]
///
/// Adapters left unset default to the `metrics` recorder, the log (or the
/// configured webhook) for alerts and an in-memory failure store. A queue
/// client is required when dead-letter processing is enabled.
pub struct ResilienceLayerBuilder {
    config: ResilienceConfig,
    queue: Option<Arc<dyn QueueClient>>,
    metric_sink: Option<Arc<dyn MetricSink>>,
    alert_sink: Option<Arc<dyn AlertSink>>,
    failure_store: Option<Arc<dyn FailureStore>>,
}

impl ResilienceLayerBuilder {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            queue: None,
            metric_sink: None,
            alert_sink: None,
            failure_store: None,
        }
    }

    pub fn queue(mut self, queue: Arc<dyn QueueClient>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn metric_sink(mut self, sink: Arc<dyn MetricSink>) -> Self {
        self.metric_sink = Some(sink);
        self
    }

    pub fn alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink = Some(sink);
        self
    }

    pub fn failure_store(mut self, store: Arc<dyn FailureStore>) -> Self {
        self.failure_store = Some(store);
        self
    }

    pub fn build(self) -> Result<ResilienceLayer> {
        let config = self.config;
        config.validate()?;

        if config.dlq.enabled && self.queue.is_none() {
            return Err(ResilienceError::InvalidConfig(
                "dlq.enabled requires a queue client".to_string(),
            ));
        }

        let alert_sink: Arc<dyn AlertSink> = match (self.alert_sink, config.alerting.webhook_url.as_deref()) {
            (Some(sink), _) => sink,
            (None, Some(url)) => Arc::new(WebhookAlertSink::new(&config.alerting, url)?),
            (None, None) => Arc::new(LogAlertSink),
        };
        let metric_sink: Arc<dyn MetricSink> = match self.metric_sink {
            Some(sink) => sink,
            None => Arc::new(RecorderSink),
        };
        let failure_store: Arc<dyn FailureStore> = match self.failure_store {
            Some(store) => store,
            None => Arc::new(InMemoryFailureStore::new()),
        };

        let shutdown = ShutdownSignal::new();
        let breaker = Arc::new(CircuitBreaker::new());
        let retry = RetryExecutor::with_circuit_breaker(Arc::clone(&breaker), config.circuit_breaker.clone());

        let errors = Arc::new(ErrorHandlingService::new(ErrorHandlingDeps {
            breaker: Arc::clone(&breaker),
            breaker_config: config.circuit_breaker.clone(),
            data_processing_retry: config.data_processing_retry.clone(),
            metric_sink,
            metrics: config.metrics.clone(),
            alert_sink,
            alerting: config.alerting.clone(),
            queue: self.queue.clone(),
            dead_letter_url: config.dlq.queue_url.clone(),
            shutdown: shutdown.clone(),
        }));

        let dead_letter = match (&self.queue, config.dlq.enabled) {
            (Some(queue), true) => Some(Arc::new(DeadLetterProcessor::new(
                config.dlq.clone(),
                Arc::clone(queue),
                failure_store,
                Arc::clone(&errors),
                shutdown.clone(),
            ))),
            _ => None,
        };

        Ok(ResilienceLayer {
            config,
            breaker,
            retry,
            errors,
            dead_letter,
            shutdown,
            dead_letter_task: Mutex::new(None),
        })
    }
}

/// The assembled resilience layer
pub struct ResilienceLayer {
    config: ResilienceConfig,
    breaker: Arc<CircuitBreaker>,
    retry: RetryExecutor,
    errors: Arc<ErrorHandlingService>,
    dead_letter: Option<Arc<DeadLetterProcessor>>,
    shutdown: ShutdownSignal,
    dead_letter_task: Mutex<Option<JoinHandle<()>>>,
}

impl ResilienceLayer {
    pub fn builder(config: ResilienceConfig) -> ResilienceLayerBuilder {
        ResilienceLayerBuilder::new(config)
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn retry_executor(&self) -> &RetryExecutor {
        &self.retry
    }

    pub fn errors(&self) -> &Arc<ErrorHandlingService> {
        &self.errors
    }

    pub fn dead_letter(&self) -> Option<&Arc<DeadLetterProcessor>> {
        self.dead_letter.as_ref()
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Runs `operation` under the circuit for `key` with the configured
    /// breaker settings
    ///
    /// Operation failures are recorded with the error handling service and
    /// the fallback is served as a graceful degradation of `key`.
    pub async fn execute<F, Fut, T, FB>(&self, key: &str, operation: F, fallback: FB) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, Failure>>,
        FB: FnOnce() -> T,
    {
        let correlation_id = current_correlation_id().unwrap_or_else(generate_correlation_id);
        with_correlation_id(correlation_id.clone(), async {
            let failure = match self.breaker.call(key, operation, &self.config.circuit_breaker).await {
                Ok(value) => return value,
                Err(failure) => failure,
            };

            let reason = if failure.kind == ErrorKind::CircuitOpen {
                warn!(circuit = %key, correlation_id = %correlation_id, "Circuit open, using fallback");
                "Circuit breaker protection"
            } else {
                self.errors
                    .handle(
                        key,
                        "execute",
                        &failure,
                        json!({ "correlationId": correlation_id, "operation": key }),
                    )
                    .await;
                "Circuit breaker fallback"
            };

            self.errors
                .handle_graceful_degradation(key, &failure, fallback(), reason)
                .await
        })
        .await
    }

    /// Runs `operation` with the configured retry policy, guarded by the
    /// circuit for `operation_id`
    ///
    /// Every failed attempt is recorded with the error handling service and
    /// the fallback's value is served as a graceful degradation.
    pub async fn execute_with_retry<F, Fut, T, FB, FbFut>(&self, operation_id: &str, operation: F, fallback: FB) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, Failure>>,
        FB: FnOnce(Failure) -> FbFut,
        FbFut: Future<Output = T>,
    {
        let correlation_id = current_correlation_id().unwrap_or_else(generate_correlation_id);
        let errors = &self.errors;

        let mut operation = operation;
        let recorded = move || {
            let attempt = operation();
            async move {
                let result = attempt.await;
                if let Err(failure) = &result {
                    errors
                        .handle(
                            operation_id,
                            "execute_with_retry",
                            failure,
                            json!({ "correlationId": current_correlation_id(), "operation": operation_id }),
                        )
                        .await;
                }
                result
            }
        };
        let degrade = move |failure: Failure| async move {
            if failure.kind == ErrorKind::CircuitOpen {
                debug!(operation = %operation_id, "Circuit open, using fallback");
            }
            let degraded = fallback(failure.clone()).await;
            errors
                .handle_graceful_degradation(operation_id, &failure, degraded, "Retry fallback")
                .await
        };

        with_correlation_id(
            correlation_id,
            self.retry
                .execute_with_retry(operation_id, recorded, degrade, &self.config.retry),
        )
        .await
    }

    /// Starts the dead-letter loop, if dead-letter processing is enabled
    ///
    /// Calling it again while the loop runs has no effect.
    pub fn start(&self) {
        let Some(processor) = &self.dead_letter else {
            return;
        };

        let mut task = self.dead_letter_task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().map_or(false, |t| !t.is_finished()) {
            return;
        }
        *task = Some(Arc::clone(processor).spawn(self.shutdown.clone()));
        info!("Resilience layer started");
    }

    /// Fires the shutdown signal and waits for the dead-letter loop to stop
    pub async fn shutdown(&self) {
        self.shutdown.trigger();

        let task = self
            .dead_letter_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Dead-letter loop ended abnormally");
            }
        }
        info!("Resilience layer stopped");
    }

    /// Summarises circuits, error totals and dead-letter statistics
    pub fn health(&self) -> HealthReport {
        let mut open_circuits = Vec::new();
        let mut half_open_circuits = Vec::new();
        for (key, status) in self.breaker.all_statuses() {
            match status.state {
                CircuitState::Open => open_circuits.push(key),
                CircuitState::HalfOpen => half_open_circuits.push(key),
                CircuitState::Closed => {}
            }
        }
        open_circuits.sort();
        half_open_circuits.sort();

        let status = if open_circuits.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        HealthReport {
            status,
            open_circuits,
            half_open_circuits,
            total_errors: self.errors.total_errors(),
            dead_letter: self.dead_letter.as_ref().map(|p| p.statistics()),
        }
    }

    /// Closes every circuit and clears all statistics
    pub fn reset_all(&self) {
        self.breaker.reset_all();
        self.errors.clear_statistics();
        if let Some(processor) = &self.dead_letter {
            processor.reset_statistics();
        }
    }
}
