//! # Error Handling Service
//!
//! The entry point application code calls whenever an external call fails.
//! Every failure is classified, counted per `component:operation`, emitted
//! as an `ErrorCount` metric and routed by severity to the log and to the
//! alert sink. The specialised handlers combine this with the circuit
//! breaker, the retry executor and the dead-letter queue.
//!
//! `handle` never fails: metric and alert delivery problems are logged and
//! swallowed.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::{BreakerConfig, CircuitBreaker};
use crate::classification::{classify_failure, ErrorCategory, Severity};
use crate::lifecycle::ShutdownSignal;
use crate::logging::{current_correlation_id, generate_correlation_id};
use crate::monitoring::{MetricDatum, MetricSink, MetricsConfig};
use crate::queue::{QueueClient, SendRequest};
use crate::reporting::{Alert, AlertLevel, AlertSink, AlertingConfig};
use crate::retry::{RetryConfig, RetryExecutor};
use crate::sanitization::{sanitize_context, sanitize_message};
use crate::types::Failure;

/// Result of handling one failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// `component:operation`
    pub error_key: String,
    pub category: ErrorCategory,
    pub severity: Severity,
    /// Sanitized failure message
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Sanitized caller context
    pub context: Value,
    pub correlation_id: String,
}

/// What became of a failed data-processing event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataProcessingOutcome {
    /// A retry of the caller's processing succeeded
    Reprocessed,
    /// The event was appended to the dead-letter queue
    DeadLettered,
    /// No dead-letter queue accepted the event; it is only logged
    Dropped,
}

/// Aggregated failures for one `component:operation`
#[derive(Debug, Clone)]
struct ErrorMetrics {
    count: u64,
    last_occurrence: DateTime<Utc>,
    error_types: HashMap<String, u64>,
    recent: VecDeque<Instant>,
}

impl ErrorMetrics {
    fn new() -> Self {
        Self {
            count: 0,
            last_occurrence: Utc::now(),
            error_types: HashMap::new(),
            recent: VecDeque::new(),
        }
    }

    /// Only the newest `keep` timestamps are retained; the rate check never
    /// needs more than one past its threshold.
    fn record(&mut self, error_type: &str, now: Instant, window: Duration, keep: usize) {
        self.count += 1;
        self.last_occurrence = Utc::now();
        *self.error_types.entry(error_type.to_string()).or_insert(0) += 1;
        self.recent.push_back(now);
        while self.recent.len() > keep {
            self.recent.pop_front();
        }
        while let Some(oldest) = self.recent.front() {
            if now.duration_since(*oldest) > window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Snapshot of the failures seen for one `component:operation`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorStatistics {
    pub count: u64,
    pub last_occurrence: DateTime<Utc>,
    pub error_types: HashMap<String, u64>,
    /// Occurrences within the error-rate window
    pub recent_count: usize,
}

/// Collaborators and settings for [`ErrorHandlingService`]
pub struct ErrorHandlingDeps {
    pub breaker: Arc<CircuitBreaker>,
    pub breaker_config: BreakerConfig,
    pub data_processing_retry: RetryConfig,
    pub metric_sink: Arc<dyn MetricSink>,
    pub metrics: MetricsConfig,
    pub alert_sink: Arc<dyn AlertSink>,
    pub alerting: AlertingConfig,
    pub queue: Option<Arc<dyn QueueClient>>,
    pub dead_letter_url: Option<String>,
    pub shutdown: ShutdownSignal,
}

/// Classifies, records and escalates failures
pub struct ErrorHandlingService {
    breaker: Arc<CircuitBreaker>,
    breaker_config: BreakerConfig,
    retry: RetryExecutor,
    data_processing_retry: RetryConfig,
    metric_sink: Arc<dyn MetricSink>,
    metrics: MetricsConfig,
    alert_sink: Arc<dyn AlertSink>,
    alerting: AlertingConfig,
    queue: Option<Arc<dyn QueueClient>>,
    dead_letter_url: Option<String>,
    shutdown: ShutdownSignal,
    error_metrics: DashMap<String, ErrorMetrics>,
    high_alerted_at: DashMap<String, Instant>,
    rate_alerted_at: DashMap<String, Instant>,
}

impl ErrorHandlingService {
    pub fn new(deps: ErrorHandlingDeps) -> Self {
        Self {
            breaker: deps.breaker,
            breaker_config: deps.breaker_config,
            retry: RetryExecutor::new(),
            data_processing_retry: deps.data_processing_retry,
            metric_sink: deps.metric_sink,
            metrics: deps.metrics,
            alert_sink: deps.alert_sink,
            alerting: deps.alerting,
            queue: deps.queue,
            dead_letter_url: deps.dead_letter_url,
            shutdown: deps.shutdown,
            error_metrics: DashMap::new(),
            high_alerted_at: DashMap::new(),
            rate_alerted_at: DashMap::new(),
        }
    }

    /// Records and routes one failure
    pub async fn handle(&self, component: &str, operation: &str, failure: &Failure, context: Value) -> ErrorResponse {
        let classification = classify_failure(failure);
        let error_key = format!("{}:{}", component, operation);
        let message = sanitize_message(&failure.message);
        let context = sanitize_context(context);
        let correlation_id = current_correlation_id().unwrap_or_else(generate_correlation_id);

        self.record(&error_key, failure.type_name());
        self.emit(
            MetricDatum::count(self.metrics.namespace.clone(), "ErrorCount")
                .dimension("Component", component)
                .dimension("Operation", operation)
                .dimension("ErrorType", failure.type_name()),
        )
        .await;

        let response = ErrorResponse {
            error_key,
            category: classification.category,
            severity: classification.severity,
            message,
            timestamp: Utc::now(),
            context,
            correlation_id,
        };

        self.route(&response, failure).await;
        response
    }

    fn record(&self, error_key: &str, error_type: &str) {
        let window = self.alerting.error_rate_window();
        self.error_metrics
            .entry(error_key.to_string())
            .or_insert_with(ErrorMetrics::new)
            .record(error_type, Instant::now(), window, self.alerting.error_rate_threshold.saturating_add(1));
    }

    async fn emit(&self, datum: MetricDatum) {
        if !self.metrics.enabled || self.shutdown.is_shutting_down() {
            return;
        }
        if let Err(e) = self.metric_sink.put_metric(datum).await {
            debug!(error = %e, "Failed to emit metric");
        }
    }

    async fn route(&self, response: &ErrorResponse, failure: &Failure) {
        let key = response.error_key.as_str();
        match response.severity {
            Severity::Critical => {
                error!(
                    error_key = %key,
                    category = %response.category,
                    error_type = %failure.type_name(),
                    correlation_id = %response.correlation_id,
                    message = %response.message,
                    "CRITICAL error"
                );
                self.raise_alert(Alert::new(AlertLevel::Critical, "Critical error", &response.message, key)
                    .with_context(alert_context(response)))
                    .await;
                self.raise_alert(Alert::new(
                    AlertLevel::Emergency,
                    "Escalated to operations",
                    format!("{} failure in {}: {}", response.category, key, response.message),
                    key,
                )
                .with_context(alert_context(response)))
                .await;
            }
            Severity::High => {
                error!(
                    error_key = %key,
                    category = %response.category,
                    error_type = %failure.type_name(),
                    correlation_id = %response.correlation_id,
                    message = %response.message,
                    "HIGH severity error"
                );
                if claim_alert(&self.high_alerted_at, key, self.alerting.high_suppression()) {
                    self.raise_alert(Alert::new(AlertLevel::Warning, "High severity error", &response.message, key)
                        .with_context(alert_context(response)))
                        .await;
                }
            }
            Severity::Medium => {
                warn!(
                    error_key = %key,
                    category = %response.category,
                    error_type = %failure.type_name(),
                    correlation_id = %response.correlation_id,
                    message = %response.message,
                    "MEDIUM severity error"
                );
                if self.is_error_rate_high(key)
                    && claim_alert(&self.rate_alerted_at, key, self.alerting.error_rate_suppression())
                {
                    let recent = self.recent_count(key);
                    self.raise_alert(Alert::new(
                        AlertLevel::Warning,
                        "High error rate",
                        format!(
                            "{} errors for {} in the last {}s",
                            recent, key, self.alerting.error_rate_window_secs
                        ),
                        key,
                    )
                    .with_context(alert_context(response)))
                    .await;
                }
            }
            Severity::Low => {
                info!(
                    error_key = %key,
                    category = %response.category,
                    error_type = %failure.type_name(),
                    correlation_id = %response.correlation_id,
                    message = %response.message,
                    "LOW severity error"
                );
            }
        }
    }

    /// Delivers an alert; delivery failures are logged, never returned
    pub async fn raise_alert(&self, alert: Alert) {
        let alert_id = alert.id;
        if let Err(e) = self.alert_sink.send_alert(alert).await {
            warn!(alert_id = %alert_id, error = %e, "Failed to deliver alert");
        }
    }

    fn recent_count(&self, error_key: &str) -> usize {
        let window = self.alerting.error_rate_window();
        let now = Instant::now();
        self.error_metrics
            .get(error_key)
            .map(|m| m.recent.iter().filter(|t| now.duration_since(**t) <= window).count())
            .unwrap_or(0)
    }

    /// Returns true if `error_key` saw more errors than the threshold within
    /// the error-rate window
    pub fn is_error_rate_high(&self, error_key: &str) -> bool {
        self.recent_count(error_key) > self.alerting.error_rate_threshold
    }

    /// Number of failures recorded for `component:operation`
    pub fn error_count(&self, error_key: &str) -> u64 {
        self.error_metrics.get(error_key).map(|m| m.count).unwrap_or(0)
    }

    /// Handles a failed data-processing event
    ///
    /// Retryable failures are reprocessed through `reprocess` with the
    /// data-processing retry policy and dead-lettered if that gives up;
    /// other failures are dead-lettered directly.
    pub async fn handle_data_processing_error<F, Fut>(
        &self,
        event_id: &str,
        event_data: Value,
        failure: &Failure,
        mut reprocess: F,
    ) -> DataProcessingOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), Failure>>,
    {
        error!(event_id = %event_id, error = %sanitize_message(&failure.message), "Data processing error");

        let response = self
            .handle("DataProcessing", "EventProcessing", failure, json!({ "eventId": event_id }))
            .await;

        if !response.category.is_retryable() {
            return self.send_to_dead_letter(event_id, &event_data, failure, response.category).await;
        }

        let event_data = &event_data;
        let operation_id = format!("processEvent-{}", event_id);
        self.retry
            .execute_with_retry(
                &operation_id,
                || {
                    let attempt = reprocess();
                    async move { attempt.await.map(|_| DataProcessingOutcome::Reprocessed) }
                },
                move |last| async move {
                    let category = classify_failure(&last).category;
                    self.send_to_dead_letter(event_id, event_data, &last, category).await
                },
                &self.data_processing_retry,
            )
            .await
    }

    async fn send_to_dead_letter(
        &self,
        event_id: &str,
        event_data: &Value,
        failure: &Failure,
        category: ErrorCategory,
    ) -> DataProcessingOutcome {
        let (Some(queue), Some(url)) = (&self.queue, self.dead_letter_url.as_deref()) else {
            warn!(event_id = %event_id, "Dead-letter queue not configured, dropping event");
            return DataProcessingOutcome::Dropped;
        };

        let body = json!({
            "eventId": event_id,
            "eventData": event_data,
            "error": failure.message,
            "timestamp": Utc::now().to_rfc3339(),
            "failureReason": category.as_str(),
        });
        let request = SendRequest {
            body: body.to_string(),
            delay_seconds: 0,
            attributes: HashMap::new(),
        };

        match queue.send(url, request).await {
            Ok(message_id) => {
                info!(event_id = %event_id, message_id = %message_id, "Sent event to dead-letter queue");
                DataProcessingOutcome::DeadLettered
            }
            Err(e) => {
                error!(event_id = %event_id, error = %e, "Failed to send event to dead-letter queue");
                DataProcessingOutcome::Dropped
            }
        }
    }

    /// Handles a failed model inference call and returns `fallback`
    ///
    /// When the dependency's circuit is already open nothing else happens.
    pub async fn handle_ai_service_error<T>(&self, service_name: &str, failure: &Failure, fallback: T) -> T {
        if self.breaker.is_open(service_name) {
            return fallback;
        }

        warn!(service = %service_name, error = %sanitize_message(&failure.message), "AI service error");
        self.handle("AIService", service_name, failure, Value::Null).await;
        fallback
    }

    /// Records a dependency timeout and counts it against the dependency's
    /// circuit
    pub async fn handle_service_timeout(&self, service_name: &str, timeout_ms: u64, request: Value) {
        let failure = Failure::timeout(format!("Service {} timed out after {}ms", service_name, timeout_ms))
            .context("timeoutMs", timeout_ms);

        self.handle(
            "ExternalService",
            service_name,
            &failure,
            json!({ "timeoutMs": timeout_ms, "request": request }),
        )
        .await;

        self.breaker
            .execute(
                service_name,
                || async { Err::<(), _>(failure.clone()) },
                || (),
                &self.breaker_config,
            )
            .await;
    }

    /// Records a degraded feature and returns the degraded value
    pub async fn handle_graceful_degradation<T>(
        &self,
        feature: &str,
        failure: &Failure,
        degraded_value: T,
        reason: &str,
    ) -> T {
        warn!(
            feature = %feature,
            reason = %reason,
            error = %sanitize_message(&failure.message),
            "Graceful degradation"
        );

        self.handle("GracefulDegradation", feature, failure, json!({ "reason": reason }))
            .await;
        self.emit(
            MetricDatum::count(self.metrics.namespace.clone(), "GracefulDegradation")
                .dimension("Feature", feature)
                .dimension("Reason", reason),
        )
        .await;

        degraded_value
    }

    /// Per-key failure statistics
    pub fn statistics(&self) -> HashMap<String, ErrorStatistics> {
        let window = self.alerting.error_rate_window();
        let now = Instant::now();
        self.error_metrics
            .iter()
            .map(|entry| {
                let m = entry.value();
                let stats = ErrorStatistics {
                    count: m.count,
                    last_occurrence: m.last_occurrence,
                    error_types: m.error_types.clone(),
                    recent_count: m.recent.iter().filter(|t| now.duration_since(**t) <= window).count(),
                };
                (entry.key().clone(), stats)
            })
            .collect()
    }

    /// Total failures across every key
    pub fn total_errors(&self) -> u64 {
        self.error_metrics.iter().map(|e| e.value().count).sum()
    }

    /// Clears statistics and alert suppression state
    pub fn clear_statistics(&self) {
        self.error_metrics.clear();
        self.high_alerted_at.clear();
        self.rate_alerted_at.clear();
        info!("Error statistics cleared");
    }
}

/// Claims the right to alert for `key`, at most once per `suppression`
fn claim_alert(sent: &DashMap<String, Instant>, key: &str, suppression: Duration) -> bool {
    let now = Instant::now();
    let mut claimed = false;
    sent.entry(key.to_string())
        .and_modify(|last| {
            if now.duration_since(*last) >= suppression {
                *last = now;
                claimed = true;
            }
        })
        .or_insert_with(|| {
            claimed = true;
            now
        });
    claimed
}

fn alert_context(response: &ErrorResponse) -> Value {
    json!({
        "category": response.category,
        "severity": response.severity,
        "correlationId": response.correlation_id,
        "context": response.context,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::monitoring::{InMemoryMetricSink, SinkError};
    use crate::queue::InMemoryQueue;
    use crate::reporting::InMemoryAlertSink;
    use crate::types::ErrorKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    const DLQ: &str = "memory://dlq";

    struct Fixture {
        service: ErrorHandlingService,
        metrics: Arc<InMemoryMetricSink>,
        alerts: Arc<InMemoryAlertSink>,
        queue: Arc<InMemoryQueue>,
        breaker: Arc<CircuitBreaker>,
        shutdown: ShutdownSignal,
    }

    fn fixture() -> Fixture {
        let metrics = Arc::new(InMemoryMetricSink::new());
        let alerts = Arc::new(InMemoryAlertSink::new());
        let queue = Arc::new(InMemoryQueue::new());
        let breaker = Arc::new(CircuitBreaker::new());
        let shutdown = ShutdownSignal::new();

        let service = ErrorHandlingService::new(ErrorHandlingDeps {
            breaker: Arc::clone(&breaker),
            breaker_config: BreakerConfig {
                failure_threshold: 2,
                ..BreakerConfig::default()
            },
            data_processing_retry: RetryConfig {
                max_attempts: 3,
                initial_delay_ms: 1_000,
                ..RetryConfig::default()
            },
            metric_sink: metrics.clone(),
            metrics: MetricsConfig::default(),
            alert_sink: alerts.clone(),
            alerting: AlertingConfig::default(),
            queue: Some(queue.clone()),
            dead_letter_url: Some(DLQ.to_string()),
            shutdown: shutdown.clone(),
        });

        Fixture {
            service,
            metrics,
            alerts,
            queue,
            breaker,
            shutdown,
        }
    }

    #[tokio::test]
    async fn test_handle_counts_and_emits() {
        let f = fixture();
        for _ in 0..4 {
            let response = f
                .service
                .handle("ingest", "parse", &Failure::other("something odd"), Value::Null)
                .await;
            assert_eq!(response.error_key, "ingest:parse");
            assert_eq!(response.severity, Severity::Low);
        }

        assert_eq!(f.service.error_count("ingest:parse"), 4);
        assert_eq!(f.service.error_count("ingest:other"), 0);

        let emitted = f.metrics.named("ErrorCount");
        assert_eq!(emitted.len(), 4);
        assert_eq!(emitted[0].namespace, "UserJourneyAnalytics");
        assert_eq!(emitted[0].dimensions["Component"], "ingest");
        assert_eq!(emitted[0].dimensions["Operation"], "parse");
        assert_eq!(emitted[0].dimensions["ErrorType"], "Error");
        assert!(f.alerts.alerts().is_empty());
    }

    #[tokio::test]
    async fn test_response_is_sanitized_and_correlated() {
        let f = fixture();
        let failure = Failure::new(ErrorKind::Unauthorized, "rejected token=abc123");
        let response = crate::logging::with_correlation_id(
            "req-42",
            f.service.handle("gateway", "login", &failure, json!({ "password": "x", "user": "u1" })),
        )
        .await;

        assert_eq!(response.category, ErrorCategory::Authentication);
        assert_eq!(response.severity, Severity::Critical);
        assert_eq!(response.message, "rejected token=[REDACTED]");
        assert!(response.context.get("password").is_none());
        assert_eq!(response.context["user"], "u1");
        assert_eq!(response.correlation_id, "req-42");
    }

    #[tokio::test]
    async fn test_critical_always_alerts_and_escalates() {
        let f = fixture();
        for _ in 0..2 {
            f.service
                .handle("api", "validate", &Failure::invalid_argument("bad field"), Value::Null)
                .await;
        }
        assert_eq!(f.alerts.count_at(AlertLevel::Critical), 2);
        assert_eq!(f.alerts.count_at(AlertLevel::Emergency), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_alerts_are_suppressed_per_key() {
        let f = fixture();
        let failure = Failure::connection("connection reset");

        f.service.handle("db", "query", &failure, Value::Null).await;
        f.service.handle("db", "query", &failure, Value::Null).await;
        f.service.handle("db", "write", &failure, Value::Null).await;
        assert_eq!(f.alerts.count_at(AlertLevel::Warning), 2);

        tokio::time::advance(Duration::from_secs(300)).await;
        f.service.handle("db", "query", &failure, Value::Null).await;
        assert_eq!(f.alerts.count_at(AlertLevel::Warning), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_medium_alerts_only_on_high_rate() {
        let f = fixture();
        let failure = Failure::rate_limited("throttled");

        for _ in 0..10 {
            f.service.handle("ai", "score", &failure, Value::Null).await;
        }
        assert!(f.alerts.alerts().is_empty());
        assert!(!f.service.is_error_rate_high("ai:score"));

        f.service.handle("ai", "score", &failure, Value::Null).await;
        assert!(f.service.is_error_rate_high("ai:score"));
        assert_eq!(f.alerts.alerts().len(), 1);

        // Suppressed for 15 minutes
        f.service.handle("ai", "score", &failure, Value::Null).await;
        assert_eq!(f.alerts.alerts().len(), 1);

        // Old occurrences leave the window
        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(!f.service.is_error_rate_high("ai:score"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recent_window_is_bounded_for_hot_keys() {
        let f = fixture();
        let failure = Failure::rate_limited("throttled");

        for _ in 0..500 {
            f.service.handle("feed", "poll", &failure, Value::Null).await;
        }

        let stats = f.service.statistics();
        assert_eq!(stats["feed:poll"].count, 500);
        assert_eq!(stats["feed:poll"].recent_count, 11);
        assert!(f.service.is_error_rate_high("feed:poll"));
        assert_eq!(f.alerts.alerts().len(), 1);
    }

    struct FailingSink;

    #[async_trait]
    impl MetricSink for FailingSink {
        async fn put_metric(&self, _datum: MetricDatum) -> Result<(), SinkError> {
            Err(SinkError::Delivery("sink down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_sink_failures_and_shutdown_are_swallowed() {
        let f = fixture();
        f.shutdown.trigger();
        f.service.handle("c", "o", &Failure::other("x"), Value::Null).await;
        assert!(f.metrics.recorded().is_empty());
        assert_eq!(f.service.error_count("c:o"), 1);

        let service = ErrorHandlingService::new(ErrorHandlingDeps {
            breaker: Arc::new(CircuitBreaker::new()),
            breaker_config: BreakerConfig::default(),
            data_processing_retry: RetryConfig::default(),
            metric_sink: Arc::new(FailingSink),
            metrics: MetricsConfig::default(),
            alert_sink: Arc::new(InMemoryAlertSink::new()),
            alerting: AlertingConfig::default(),
            queue: None,
            dead_letter_url: None,
            shutdown: ShutdownSignal::new(),
        });
        let response = service.handle("c", "o", &Failure::other("x"), Value::Null).await;
        assert_eq!(response.error_key, "c:o");
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_processing_retry_then_success() {
        let f = fixture();
        let attempts = Arc::new(AtomicU32::new(0));

        let attempts_clone = Arc::clone(&attempts);
        let outcome = f
            .service
            .handle_data_processing_error(
                "evt-1",
                json!({ "eventType": "page_view" }),
                &Failure::timeout("timed out"),
                move || {
                    let n = attempts_clone.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            Err(Failure::timeout("still slow"))
                        } else {
                            Ok(())
                        }
                    }
                },
            )
            .await;

        assert_eq!(outcome, DataProcessingOutcome::Reprocessed);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(f.queue.ready_messages(DLQ).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_processing_exhausted_goes_to_dead_letter() {
        let f = fixture();
        let outcome = f
            .service
            .handle_data_processing_error(
                "evt-2",
                json!({ "eventType": "struggle_signal" }),
                &Failure::connection("connection refused"),
                || async { Err(Failure::connection("connection refused")) },
            )
            .await;

        assert_eq!(outcome, DataProcessingOutcome::DeadLettered);
        let messages = f.queue.ready_messages(DLQ);
        assert_eq!(messages.len(), 1);
        let body: Value = serde_json::from_str(&messages[0].body).unwrap();
        assert_eq!(body["eventId"], "evt-2");
        assert_eq!(body["eventData"]["eventType"], "struggle_signal");
        assert_eq!(body["error"], "connection refused");
        assert_eq!(body["failureReason"], "NETWORK");
        assert!(body["timestamp"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_data_processing_non_retryable_skips_reprocess() {
        let f = fixture();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let outcome = f
            .service
            .handle_data_processing_error(
                "evt-3",
                json!({}),
                &Failure::invalid_argument("validation failed: missing userId"),
                move || {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
            )
            .await;

        assert_eq!(outcome, DataProcessingOutcome::DeadLettered);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.service.error_count("DataProcessing:EventProcessing"), 1);
    }

    #[tokio::test]
    async fn test_ai_service_error_short_circuits_when_open() {
        let f = fixture();
        let failure = Failure::other("Prediction failed");

        assert_eq!(f.service.handle_ai_service_error("predictor", &failure, 0.5).await, 0.5);
        assert_eq!(f.service.error_count("AIService:predictor"), 1);

        // Trip the circuit
        f.service.handle_service_timeout("predictor", 5_000, Value::Null).await;
        f.service.handle_service_timeout("predictor", 5_000, Value::Null).await;
        assert_eq!(f.breaker.state("predictor"), CircuitState::Open);

        assert_eq!(f.service.handle_ai_service_error("predictor", &failure, 0.5).await, 0.5);
        assert_eq!(f.service.error_count("AIService:predictor"), 1);
    }

    #[tokio::test]
    async fn test_service_timeout_records_and_trips() {
        let f = fixture();
        f.service
            .handle_service_timeout("recommendations", 3_000, json!({ "user": "u1" }))
            .await;

        assert_eq!(f.service.error_count("ExternalService:recommendations"), 1);
        let status = f.breaker.status("recommendations");
        assert_eq!(status.failure_count, 1);
        assert_eq!(status.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_graceful_degradation() {
        let f = fixture();
        let value = f
            .service
            .handle_graceful_degradation(
                "recommendations",
                &Failure::timeout("model timed out"),
                vec!["popular-1"],
                "model unavailable",
            )
            .await;

        assert_eq!(value, vec!["popular-1"]);
        assert_eq!(f.service.error_count("GracefulDegradation:recommendations"), 1);
        let degraded = f.metrics.named("GracefulDegradation");
        assert_eq!(degraded.len(), 1);
        assert_eq!(degraded[0].dimensions["Feature"], "recommendations");
        assert_eq!(degraded[0].dimensions["Reason"], "model unavailable");
    }

    #[tokio::test]
    async fn test_statistics_and_clear() {
        let f = fixture();
        f.service.handle("a", "b", &Failure::timeout("t"), Value::Null).await;
        f.service.handle("a", "b", &Failure::connection("c"), Value::Null).await;

        let stats = f.service.statistics();
        let ab = &stats["a:b"];
        assert_eq!(ab.count, 2);
        assert_eq!(ab.error_types["TimeoutError"], 1);
        assert_eq!(ab.error_types["ConnectionError"], 1);
        assert_eq!(f.service.total_errors(), 2);

        f.service.clear_statistics();
        assert!(f.service.statistics().is_empty());
        assert_eq!(f.service.error_count("a:b"), 0);
    }

    #[tokio::test]
    async fn test_concurrent_handles_are_all_counted() {
        let f = Arc::new(fixture());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let f = Arc::clone(&f);
            handles.push(tokio::spawn(async move {
                f.service.handle("hot", "path", &Failure::other("boom"), Value::Null).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(f.service.error_count("hot:path"), 50);
    }
}
