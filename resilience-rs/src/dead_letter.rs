//! # Dead-Letter Processing
//!
//! Drains the dead-letter queue on a timer. Each message is parsed into a
//! [`WorkItem`], reclassified with the same rules as live failures and then
//! either resubmitted to the retry queue with a longer delay or recorded as a
//! permanent failure. A message is removed from the dead-letter queue only
//! after its disposition completed, so a crash in between leads to a
//! redelivery, which is recognised by message id.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::classification::{classify_message, ErrorCategory};
use crate::handler::ErrorHandlingService;
use crate::lifecycle::ShutdownSignal;
use crate::logging::{generate_correlation_id, with_correlation_id};
use crate::queue::{QueueClient, QueueError, QueueMessage, SendRequest};
use crate::reporting::{Alert, AlertLevel};
use crate::types::{ErrorKind, Failure, ResilienceError, Result};

/// Message attribute carrying the number of retries already made
pub const RETRY_COUNT_ATTRIBUTE: &str = "RetryCount";
/// Message attribute carrying the id of the event being retried
pub const ORIGINAL_EVENT_ID_ATTRIBUTE: &str = "OriginalEventId";

/// Dead-letter processing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    pub enabled: bool,
    /// Queue holding failed work
    pub queue_url: Option<String>,
    /// Queue receiving resubmitted work
    pub retry_queue_url: Option<String>,
    /// Messages received per drain
    pub batch_size: usize,
    pub processing_interval_ms: u64,
    /// Longest wait for the first message of a drain
    pub wait_seconds: u64,
    /// Items with this many retries are never resubmitted
    pub max_retry_attempts: u32,
    /// Items that first failed longer ago than this are never resubmitted
    pub max_item_age_hours: i64,
    pub base_retry_delay_secs: u64,
    pub max_retry_delay_secs: u64,
    /// Event types whose permanent failure raises a critical alert
    pub critical_event_types: Vec<String>,
    /// Warn every this many occurrences of one failure category
    pub pattern_warning_interval: u64,
    /// Number of completed message ids remembered for redelivery detection
    pub completed_id_capacity: usize,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            queue_url: None,
            retry_queue_url: None,
            batch_size: 10,
            processing_interval_ms: 60_000,
            wait_seconds: 5,
            max_retry_attempts: 3,
            max_item_age_hours: 24,
            base_retry_delay_secs: 30,
            max_retry_delay_secs: 300,
            critical_event_types: vec!["struggle_signal".to_string(), "exit_risk_high".to_string()],
            pattern_warning_interval: 10,
            completed_id_capacity: 10_000,
        }
    }
}

impl DlqConfig {
    pub fn processing_interval(&self) -> Duration {
        Duration::from_millis(self.processing_interval_ms)
    }

    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_seconds)
    }
}

/// Body of a dead-lettered message
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeadLetterBody {
    event_id: String,
    #[serde(default)]
    event_data: Value,
    #[serde(default)]
    error: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    failure_reason: Option<String>,
}

/// A failed unit of work read from the dead-letter queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Queue message id, the idempotency key of this delivery
    pub id: String,
    pub original_event_id: String,
    pub payload: Value,
    /// Summary of the error that dead-lettered the work
    pub error: String,
    pub failure_reason: Option<String>,
    pub retry_count: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    #[serde(skip)]
    pub receipt_handle: String,
}

impl WorkItem {
    /// Parses a received message
    pub fn parse(message: &QueueMessage) -> Result<Self> {
        let body: DeadLetterBody = serde_json::from_str(&message.body)
            .map_err(|e| ResilienceError::Malformed(format!("message {}: {}", message.message_id, e)))?;

        let retry_count = match message.attributes.get(RETRY_COUNT_ATTRIBUTE) {
            Some(raw) => raw.trim().parse::<u32>().map_err(|_| {
                ResilienceError::Malformed(format!(
                    "message {}: {} attribute {:?} is not a count",
                    message.message_id, RETRY_COUNT_ATTRIBUTE, raw
                ))
            })?,
            None => 0,
        };

        Ok(Self {
            id: message.message_id.clone(),
            original_event_id: body.event_id,
            payload: body.event_data,
            error: body.error,
            failure_reason: body.failure_reason,
            retry_count,
            first_failed_at: body.timestamp,
            last_attempt_at: Utc::now(),
            receipt_handle: message.receipt_handle.clone(),
        })
    }

    /// Category of the recorded error
    ///
    /// The message decides; the recorded failure reason is used when the
    /// message matches no rule.
    pub fn category(&self) -> ErrorCategory {
        match classify_message(&self.error) {
            ErrorCategory::Unknown => self
                .failure_reason
                .as_deref()
                .and_then(category_from_reason)
                .unwrap_or(ErrorCategory::Unknown),
            category => category,
        }
    }

    /// Event type of the payload, if it carries one
    pub fn event_type(&self) -> Option<&str> {
        self.payload.get("eventType").and_then(Value::as_str)
    }
}

fn category_from_reason(reason: &str) -> Option<ErrorCategory> {
    serde_json::from_value(Value::String(reason.to_string())).ok()
}

/// Lifecycle of one item within a drain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemState {
    Received,
    Classified,
    RetryScheduled,
    PermanentlyFailed,
    RemovedFromQueue,
}

/// Why an item will never be resubmitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermanentReason {
    /// The retry budget is spent
    Exhausted,
    /// The input is invalid and cannot succeed on a retry
    Validation,
    /// The item first failed too long ago
    Stale,
    /// The category is not one that recovers on its own
    NonRetryable,
    /// The message could not be parsed
    Malformed,
}

/// Decision for one classified item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry { delay_secs: u64 },
    Permanent(PermanentReason),
}

/// Decides what to do with a classified item
pub fn decide(item: &WorkItem, category: ErrorCategory, now: DateTime<Utc>, config: &DlqConfig) -> Disposition {
    if item.retry_count >= config.max_retry_attempts {
        return Disposition::Permanent(PermanentReason::Exhausted);
    }
    if category == ErrorCategory::Validation || item.error.to_lowercase().contains("validation") {
        return Disposition::Permanent(PermanentReason::Validation);
    }
    if now.signed_duration_since(item.first_failed_at) > chrono::Duration::hours(config.max_item_age_hours) {
        return Disposition::Permanent(PermanentReason::Stale);
    }
    if !category.is_retryable() {
        return Disposition::Permanent(PermanentReason::NonRetryable);
    }
    Disposition::Retry {
        delay_secs: retry_delay_secs(item.retry_count, config),
    }
}

/// Returns true if the item should be resubmitted
pub fn should_retry(item: &WorkItem, category: ErrorCategory, now: DateTime<Utc>, config: &DlqConfig) -> bool {
    matches!(decide(item, category, now, config), Disposition::Retry { .. })
}

/// Delay before the next retry: `min(base * 2^retry_count, max)` seconds
pub fn retry_delay_secs(retry_count: u32, config: &DlqConfig) -> u64 {
    let factor = 2u64.checked_pow(retry_count).unwrap_or(u64::MAX);
    config
        .base_retry_delay_secs
        .saturating_mul(factor)
        .min(config.max_retry_delay_secs)
}

/// Occurrences of one failure category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailurePattern {
    pub error_type: ErrorCategory,
    pub count: u64,
    pub last_occurrence: DateTime<Utc>,
}

/// A work item that will never be resubmitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermanentFailure {
    pub message_id: String,
    /// None when the message could not be parsed
    pub event_id: Option<String>,
    pub payload: Value,
    pub error: String,
    pub category: ErrorCategory,
    pub reason: PermanentReason,
    pub retry_count: u32,
    pub recorded_at: DateTime<Utc>,
}

/// Durable record of permanent failures
#[async_trait]
pub trait FailureStore: Send + Sync {
    async fn record(&self, failure: PermanentFailure) -> Result<()>;
}

/// Keeps the most recent permanent failures in memory
#[derive(Debug)]
pub struct InMemoryFailureStore {
    capacity: usize,
    records: Mutex<VecDeque<PermanentFailure>>,
}

impl Default for InMemoryFailureStore {
    fn default() -> Self {
        Self::with_capacity(1_000)
    }
}

impl InMemoryFailureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::new()),
        }
    }

    pub fn records(&self) -> Vec<PermanentFailure> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FailureStore for InMemoryFailureStore {
    async fn record(&self, failure: PermanentFailure) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(failure);
        Ok(())
    }
}

/// Bounded set of message ids whose disposition completed
#[derive(Debug, Default)]
struct CompletedIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl CompletedIds {
    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: String, capacity: usize) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > capacity.max(1) {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

/// Counters kept by the processor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqStatistics {
    pub processed: u64,
    pub retried: u64,
    pub permanent_failures: u64,
    pub duplicates_skipped: u64,
    pub patterns: HashMap<ErrorCategory, FailurePattern>,
}

/// Outcome of one drain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub received: usize,
    pub retried: usize,
    pub permanently_failed: usize,
    pub duplicates: usize,
    /// Items left in the queue after an error
    pub failed: usize,
}

enum ItemOutcome {
    Retried,
    PermanentlyFailed,
    Duplicate,
}

// Clears the running flag when a drain ends, including by panic
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drains the dead-letter queue and disposes of each item
pub struct DeadLetterProcessor {
    config: DlqConfig,
    queue: Arc<dyn QueueClient>,
    store: Arc<dyn FailureStore>,
    errors: Arc<ErrorHandlingService>,
    shutdown: ShutdownSignal,
    running: AtomicBool,
    processed: AtomicU64,
    retried: AtomicU64,
    permanent_failures: AtomicU64,
    duplicates_skipped: AtomicU64,
    patterns: DashMap<ErrorCategory, FailurePattern>,
    completed: Mutex<CompletedIds>,
}

impl DeadLetterProcessor {
    pub fn new(
        config: DlqConfig,
        queue: Arc<dyn QueueClient>,
        store: Arc<dyn FailureStore>,
        errors: Arc<ErrorHandlingService>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            config,
            queue,
            store,
            errors,
            shutdown,
            running: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            permanent_failures: AtomicU64::new(0),
            duplicates_skipped: AtomicU64::new(0),
            patterns: DashMap::new(),
            completed: Mutex::new(CompletedIds::default()),
        }
    }

    pub fn config(&self) -> &DlqConfig {
        &self.config
    }

    fn completed(&self) -> MutexGuard<'_, CompletedIds> {
        self.completed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs one drain
    ///
    /// Returns `Ok(None)` without touching the queue when processing is
    /// disabled, no queue is configured, the process is shutting down or
    /// another drain is still running.
    pub async fn drain_once(&self) -> Result<Option<DrainReport>> {
        if !self.config.enabled || self.shutdown.is_shutting_down() {
            return Ok(None);
        }
        let Some(queue_url) = self.config.queue_url.as_deref() else {
            return Ok(None);
        };

        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Dead-letter drain already running, skipping");
            return Ok(None);
        }
        let _running = RunningGuard(&self.running);

        let messages = match self
            .queue
            .receive(queue_url, self.config.batch_size, self.config.wait())
            .await
        {
            Ok(messages) => messages,
            Err(QueueError::ShuttingDown) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut report = DrainReport {
            received: messages.len(),
            ..DrainReport::default()
        };
        if messages.is_empty() {
            return Ok(Some(report));
        }
        info!(count = %messages.len(), "Processing dead-letter messages");

        for message in messages {
            let message_id = message.message_id.clone();
            let outcome = with_correlation_id(generate_correlation_id(), self.process_message(queue_url, message)).await;

            match outcome {
                Ok(ItemOutcome::Retried) => report.retried += 1,
                Ok(ItemOutcome::PermanentlyFailed) => report.permanently_failed += 1,
                Ok(ItemOutcome::Duplicate) => report.duplicates += 1,
                Err(ResilienceError::Queue(QueueError::ShuttingDown)) => {
                    debug!(message_id = %message_id, "Queue shutting down, ending drain");
                    report.failed += 1;
                    break;
                }
                Err(e) => {
                    report.failed += 1;
                    error!(message_id = %message_id, error = %e, "Failed to process dead-letter message");
                    let failure = Failure::from(e);
                    self.errors
                        .handle("DLQProcessor", "processMessage", &failure, json!({ "messageId": message_id }))
                        .await;
                }
            }
        }

        info!(
            received = %report.received,
            retried = %report.retried,
            permanently_failed = %report.permanently_failed,
            duplicates = %report.duplicates,
            failed = %report.failed,
            "Dead-letter drain complete"
        );
        Ok(Some(report))
    }

    async fn process_message(&self, queue_url: &str, message: QueueMessage) -> Result<ItemOutcome> {
        self.processed.fetch_add(1, Ordering::Relaxed);
        counter!("dlq.processed", 1);
        debug!(message_id = %message.message_id, state = ?ItemState::Received, "Dead-letter item");

        if self.completed().contains(&message.message_id) {
            self.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
            counter!("dlq.duplicates", 1);
            debug!(message_id = %message.message_id, "Redelivered item already handled, removing");
            self.queue.delete(queue_url, &message.receipt_handle).await?;
            return Ok(ItemOutcome::Duplicate);
        }

        let outcome = match WorkItem::parse(&message) {
            Ok(item) => self.dispose(item).await?,
            Err(e) => {
                warn!(message_id = %message.message_id, error = %e, "Malformed dead-letter message");
                self.record_permanent(PermanentFailure {
                    message_id: message.message_id.clone(),
                    event_id: None,
                    payload: Value::String(message.body.clone()),
                    error: e.to_string(),
                    category: ErrorCategory::Unknown,
                    reason: PermanentReason::Malformed,
                    retry_count: 0,
                    recorded_at: Utc::now(),
                })
                .await?;
                ItemOutcome::PermanentlyFailed
            }
        };

        let capacity = self.config.completed_id_capacity;
        self.completed().insert(message.message_id.clone(), capacity);
        self.queue.delete(queue_url, &message.receipt_handle).await?;
        debug!(message_id = %message.message_id, state = ?ItemState::RemovedFromQueue, "Dead-letter item");

        Ok(outcome)
    }

    async fn dispose(&self, item: WorkItem) -> Result<ItemOutcome> {
        let category = item.category();
        self.track_pattern(category);
        debug!(
            message_id = %item.id,
            event_id = %item.original_event_id,
            category = %category,
            retry_count = %item.retry_count,
            state = ?ItemState::Classified,
            "Dead-letter item"
        );

        match decide(&item, category, Utc::now(), &self.config) {
            Disposition::Retry { delay_secs } => {
                self.schedule_retry(&item, delay_secs).await?;
                Ok(ItemOutcome::Retried)
            }
            Disposition::Permanent(reason) => {
                self.record_permanent(PermanentFailure {
                    message_id: item.id.clone(),
                    event_id: Some(item.original_event_id.clone()),
                    payload: item.payload.clone(),
                    error: item.error.clone(),
                    category,
                    reason,
                    retry_count: item.retry_count,
                    recorded_at: Utc::now(),
                })
                .await?;

                if item
                    .event_type()
                    .map_or(false, |t| self.config.critical_event_types.iter().any(|c| c == t))
                {
                    self.alert_critical_event(&item).await;
                }
                Ok(ItemOutcome::PermanentlyFailed)
            }
        }
    }

    async fn schedule_retry(&self, item: &WorkItem, delay_secs: u64) -> Result<()> {
        let retry_queue_url = self.config.retry_queue_url.as_deref().ok_or_else(|| {
            ResilienceError::InvalidConfig("dlq.retry_queue_url is not configured".to_string())
        })?;

        let next_attempt = item.retry_count + 1;
        let body = json!({
            "eventId": item.original_event_id,
            "eventData": item.payload,
            "error": item.error,
            "timestamp": item.first_failed_at.to_rfc3339(),
            "retryAttempt": next_attempt,
        });

        let mut attributes = HashMap::new();
        attributes.insert(RETRY_COUNT_ATTRIBUTE.to_string(), next_attempt.to_string());
        attributes.insert(ORIGINAL_EVENT_ID_ATTRIBUTE.to_string(), item.original_event_id.clone());

        self.queue
            .send(
                retry_queue_url,
                SendRequest {
                    body: body.to_string(),
                    delay_seconds: u32::try_from(delay_secs).unwrap_or(u32::MAX),
                    attributes,
                },
            )
            .await?;

        self.retried.fetch_add(1, Ordering::Relaxed);
        counter!("dlq.retried", 1);
        info!(
            event_id = %item.original_event_id,
            retry_attempt = %next_attempt,
            delay_secs = %delay_secs,
            state = ?ItemState::RetryScheduled,
            "Scheduled retry"
        );
        Ok(())
    }

    async fn record_permanent(&self, failure: PermanentFailure) -> Result<()> {
        let event_id = failure.event_id.clone().unwrap_or_else(|| "-".to_string());
        let message_id = failure.message_id.clone();
        let category = failure.category;
        let reason = failure.reason;
        let retry_count = failure.retry_count;

        self.store.record(failure).await?;

        self.permanent_failures.fetch_add(1, Ordering::Relaxed);
        counter!("dlq.permanent_failures", 1, "category" => category.as_str());
        error!(
            message_id = %message_id,
            event_id = %event_id,
            category = %category,
            reason = ?reason,
            retry_count = %retry_count,
            state = ?ItemState::PermanentlyFailed,
            "Dead-letter item permanently failed"
        );
        Ok(())
    }

    async fn alert_critical_event(&self, item: &WorkItem) {
        let failure = Failure::new(ErrorKind::Other, "Critical event permanently failed")
            .context("eventId", &item.original_event_id)
            .context("retryCount", item.retry_count);
        let context = json!({
            "eventId": item.original_event_id,
            "eventType": item.event_type(),
            "retryCount": item.retry_count,
        });

        self.errors
            .handle("DLQProcessor", "criticalFailure", &failure, context.clone())
            .await;
        self.errors
            .raise_alert(
                Alert::new(
                    AlertLevel::Critical,
                    "Critical event permanently failed",
                    format!(
                        "Event {} ({}) failed permanently after {} retries: {}",
                        item.original_event_id,
                        item.event_type().unwrap_or("unknown"),
                        item.retry_count,
                        item.error
                    ),
                    item.original_event_id.as_str(),
                )
                .with_context(context),
            )
            .await;
    }

    fn track_pattern(&self, category: ErrorCategory) {
        let count = {
            let mut pattern = self.patterns.entry(category).or_insert_with(|| FailurePattern {
                error_type: category,
                count: 0,
                last_occurrence: Utc::now(),
            });
            pattern.count += 1;
            pattern.last_occurrence = Utc::now();
            pattern.count
        };

        let interval = self.config.pattern_warning_interval;
        if interval > 0 && count % interval == 0 {
            warn!(error_type = %category, count = %count, "Recurring dead-letter failure pattern");
        }
    }

    /// Starts the periodic drain loop; it ends when `shutdown` fires
    pub fn spawn(self: Arc<Self>, shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.processing_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_ms = %self.config.processing_interval_ms, "Dead-letter processor started");

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.wait() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.drain_once().await {
                            error!(error = %e, "Dead-letter drain failed");
                        }
                    }
                }
            }

            info!("Dead-letter processor stopped");
        })
    }

    pub fn statistics(&self) -> DlqStatistics {
        DlqStatistics {
            processed: self.processed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            permanent_failures: self.permanent_failures.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            patterns: self
                .patterns
                .iter()
                .map(|entry| (*entry.key(), entry.value().clone()))
                .collect(),
        }
    }

    pub fn reset_statistics(&self) {
        self.processed.store(0, Ordering::Relaxed);
        self.retried.store(0, Ordering::Relaxed);
        self.permanent_failures.store(0, Ordering::Relaxed);
        self.duplicates_skipped.store(0, Ordering::Relaxed);
        self.patterns.clear();
        info!("Dead-letter statistics reset");
    }
}
