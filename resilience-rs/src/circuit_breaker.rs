//! # Circuit Breaker
//!
//! Per-dependency circuit breakers for preventing cascading failures.
//!
//! Each dependency key owns one record guarded by its own mutex, so keys
//! never contend with each other. A call goes through three steps:
//!
//! 1. admission under the record lock (an expired OPEN circuit moves to
//!    HALF_OPEN here),
//! 2. the operation itself, run with no lock held and timed,
//! 3. the outcome applied under the lock against whatever state the
//!    record is in by then.
//!
//! While HALF_OPEN every admitted call is a probe; concurrent probes are
//! allowed and the first failing one reopens the circuit.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::types::{ErrorKind, Failure};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation, requests allowed
    Closed,
    /// Failing, requests blocked
    Open,
    /// Testing recovery, probes allowed
    HalfOpen,
}

impl CircuitState {
    fn gauge_value(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for a circuit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures in CLOSED before the circuit opens
    pub failure_threshold: u32,
    /// How long the circuit stays OPEN before a probe is allowed
    pub open_timeout_ms: u64,
    /// Successes in HALF_OPEN needed to close the circuit
    pub success_threshold: u32,
    /// Calls slower than this count as failures, even when they return a value
    pub call_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout_ms: 60_000,
            success_threshold: 3,
            call_timeout_ms: 30_000,
        }
    }
}

impl BreakerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Point-in-time view of one circuit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitStatus {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
}

impl Default for CircuitStatus {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
        }
    }
}

#[derive(Debug)]
struct CircuitStats {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
    state_changed_at: Instant,
    /// Bumped on every transition; outcomes admitted under an older epoch are dropped
    epoch: u64,
}

impl CircuitStats {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            state_changed_at: Instant::now(),
            epoch: 0,
        }
    }

    fn status(&self) -> CircuitStatus {
        CircuitStatus {
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            last_failure_time: self.last_failure_time,
        }
    }
}

/// One record per dependency key. Thresholds and the open timeout are fixed
/// when the record is created; the call timeout is taken from each call.
#[derive(Debug)]
struct BreakerRecord {
    config: BreakerConfig,
    stats: Mutex<CircuitStats>,
}

impl BreakerRecord {
    fn lock(&self) -> MutexGuard<'_, CircuitStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Admission {
    Allowed(u64),
    Rejected,
}

/// Registry of per-key circuit breakers
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    circuits: DashMap<String, Arc<BreakerRecord>>,
}

impl CircuitBreaker {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `operation` under the circuit for `key`
    ///
    /// Returns the operation's value, or `fallback()` when the circuit
    /// rejects the call or the operation fails, overruns the call timeout or
    /// panics. Never fails itself.
    pub async fn execute<F, Fut, T, FB>(
        &self,
        key: &str,
        operation: F,
        fallback: FB,
        config: &BreakerConfig,
    ) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
        FB: FnOnce() -> T,
    {
        match self.call(key, operation, config).await {
            Ok(value) => value,
            Err(failure) => {
                debug!(circuit = %key, error = %failure, "Returning fallback");
                fallback()
            }
        }
    }

    /// Runs `operation` under the circuit for `key`, surfacing the failure
    ///
    /// A rejected call yields a [`ErrorKind::CircuitOpen`] failure without
    /// invoking `operation`.
    pub async fn call<F, Fut, T>(&self, key: &str, operation: F, config: &BreakerConfig) -> Result<T, Failure>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
    {
        let record = self.record(key, config);

        let epoch = match self.admit(key, &record) {
            Admission::Allowed(epoch) => epoch,
            Admission::Rejected => {
                counter!("circuit_breaker.rejected", 1, "circuit" => key.to_string());
                return Err(Failure::circuit_open(key));
            }
        };

        let started = Instant::now();
        let outcome = AssertUnwindSafe(async move { operation().await })
            .catch_unwind()
            .await;
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok(Ok(value)) if elapsed > config.call_timeout() => {
                warn!(
                    circuit = %key,
                    elapsed_ms = %elapsed.as_millis(),
                    timeout_ms = %config.call_timeout_ms,
                    "Call exceeded timeout, counting as failure"
                );
                drop(value);
                Err(Failure::timeout(format!(
                    "Call to {} took {}ms, limit is {}ms",
                    key,
                    elapsed.as_millis(),
                    config.call_timeout_ms
                )))
            }
            Ok(result) => result,
            Err(_) => Err(Failure::new(ErrorKind::Other, format!("Call to {} panicked", key))),
        };

        match &result {
            Ok(_) => self.on_success(key, &record, epoch),
            Err(_) => self.on_failure(key, &record, epoch),
        }
        result
    }

    fn record(&self, key: &str, config: &BreakerConfig) -> Arc<BreakerRecord> {
        if let Some(record) = self.circuits.get(key) {
            return Arc::clone(record.value());
        }
        let record = self
            .circuits
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!(circuit = %key, "Creating circuit");
                Arc::new(BreakerRecord {
                    config: config.clone(),
                    stats: Mutex::new(CircuitStats::new()),
                })
            });
        Arc::clone(record.value())
    }

    fn admit(&self, key: &str, record: &BreakerRecord) -> Admission {
        let mut stats = record.lock();
        match stats.state {
            CircuitState::Closed | CircuitState::HalfOpen => Admission::Allowed(stats.epoch),
            CircuitState::Open => {
                if stats.state_changed_at.elapsed() >= record.config.open_timeout() {
                    stats.success_count = 0;
                    self.transition(key, &mut stats, CircuitState::HalfOpen);
                    Admission::Allowed(stats.epoch)
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    fn on_success(&self, key: &str, record: &BreakerRecord, epoch: u64) {
        let mut stats = record.lock();
        if stats.epoch != epoch {
            debug!(circuit = %key, "Dropping success admitted before the last transition");
            return;
        }
        match stats.state {
            CircuitState::Closed => {
                stats.success_count = stats.success_count.saturating_add(1);
                stats.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                stats.success_count += 1;
                if stats.success_count >= record.config.success_threshold {
                    stats.failure_count = 0;
                    stats.success_count = 0;
                    self.transition(key, &mut stats, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, key: &str, record: &BreakerRecord, epoch: u64) {
        let mut stats = record.lock();
        if stats.epoch != epoch {
            debug!(circuit = %key, "Dropping failure admitted before the last transition");
            return;
        }
        stats.failure_count = stats.failure_count.saturating_add(1);
        stats.success_count = 0;
        stats.last_failure_time = Some(Utc::now());

        match stats.state {
            CircuitState::Closed if stats.failure_count >= record.config.failure_threshold => {
                self.transition(key, &mut stats, CircuitState::Open);
            }
            CircuitState::HalfOpen => {
                self.transition(key, &mut stats, CircuitState::Open);
            }
            _ => {}
        }
    }

    fn transition(&self, key: &str, stats: &mut CircuitStats, to: CircuitState) {
        let from = stats.state;
        stats.state = to;
        stats.state_changed_at = Instant::now();
        stats.epoch = stats.epoch.wrapping_add(1);

        match to {
            CircuitState::Open => warn!(
                circuit = %key,
                from = %from,
                failures = %stats.failure_count,
                "Circuit OPEN"
            ),
            CircuitState::HalfOpen => info!(circuit = %key, from = %from, "Circuit HALF_OPEN, probing"),
            CircuitState::Closed => info!(circuit = %key, from = %from, "Circuit CLOSED"),
        }

        counter!(
            "circuit_breaker.transitions",
            1,
            "circuit" => key.to_string(),
            "to" => to.to_string()
        );
        gauge!("circuit_breaker.state", to.gauge_value(), "circuit" => key.to_string());
    }

    /// Status of one circuit; unknown keys report a fresh CLOSED circuit
    pub fn status(&self, key: &str) -> CircuitStatus {
        match self.circuits.get(key) {
            Some(record) => {
                let status = record.lock().status();
                status
            }
            None => CircuitStatus::default(),
        }
    }

    /// Current state of one circuit
    pub fn state(&self, key: &str) -> CircuitState {
        self.status(key).state
    }

    /// Returns true if the circuit for `key` is currently OPEN
    pub fn is_open(&self, key: &str) -> bool {
        self.state(key) == CircuitState::Open
    }

    /// Status of every known circuit
    pub fn all_statuses(&self) -> HashMap<String, CircuitStatus> {
        self.circuits
            .iter()
            .map(|entry| {
                let status = entry.value().lock().status();
                (entry.key().clone(), status)
            })
            .collect()
    }

    /// Forces a circuit back to CLOSED with cleared counters
    pub fn reset(&self, key: &str) {
        if let Some(record) = self.circuits.get(key) {
            let mut stats = record.lock();
            stats.failure_count = 0;
            stats.success_count = 0;
            if stats.state != CircuitState::Closed {
                self.transition(key, &mut stats, CircuitState::Closed);
            }
            info!(circuit = %key, "Circuit reset by operator");
        }
    }

    /// Resets every known circuit
    pub fn reset_all(&self) {
        let keys: Vec<String> = self.circuits.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.reset(&key);
        }
    }
}
