//! # Retry Mechanism
//!
//! Bounded retries with exponential backoff. Only failures whose category
//! is retryable are attempted again; everything else, an exhausted budget or
//! an open circuit goes to the caller's fallback together with the failure
//! that caused it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::circuit_breaker::{BreakerConfig, CircuitBreaker};
use crate::classification::classify_failure;
use crate::types::{ErrorKind, Failure};

/// Configuration for a retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay_ms: u64,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
    /// Random spread (0.0 - 1.0) applied around each delay; 0 keeps delays exact
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter_factor: 0.0,
        }
    }
}

impl RetryConfig {
    /// Delay after failed attempt `attempt` (1-based):
    /// `min(initial * multiplier^(attempt-1), max)`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw_ms = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped_ms = raw_ms.min(self.max_delay_ms as f64);
        Duration::from_millis(capped_ms as u64)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if self.jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }

        let spread = self.jitter_factor.min(1.0);
        let factor = rand::thread_rng().gen_range((1.0 - spread)..=(1.0 + spread));
        delay
            .mul_f64(factor)
            .min(Duration::from_millis(self.max_delay_ms))
    }
}

/// Runs operations with retries, optionally guarded by a circuit breaker
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    breaker: Option<Arc<CircuitBreaker>>,
    breaker_config: BreakerConfig,
}

impl RetryExecutor {
    /// Creates an executor without a circuit breaker
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an executor that consults `breaker`, keyed by operation id,
    /// before every attempt
    pub fn with_circuit_breaker(breaker: Arc<CircuitBreaker>, breaker_config: BreakerConfig) -> Self {
        Self {
            breaker: Some(breaker),
            breaker_config,
        }
    }

    /// Runs `operation` until it succeeds or the policy gives up, in which
    /// case the result of `fallback` is returned
    pub async fn execute_with_retry<F, Fut, T, FB, FbFut>(
        &self,
        operation_id: &str,
        mut operation: F,
        fallback: FB,
        config: &RetryConfig,
    ) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Failure>>,
        FB: FnOnce(Failure) -> FbFut,
        FbFut: Future<Output = T>,
    {
        let max_attempts = config.max_attempts.max(1);
        let started = Instant::now();
        let mut attempt = 0;

        let failure = loop {
            attempt += 1;
            counter!("retry.attempts", 1, "operation" => operation_id.to_string());

            let result = match &self.breaker {
                Some(breaker) => {
                    breaker
                        .call(operation_id, || operation(), &self.breaker_config)
                        .await
                }
                None => operation().await,
            };

            let failure = match result {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            operation = %operation_id,
                            attempt = %attempt,
                            duration_ms = %started.elapsed().as_millis(),
                            "Operation succeeded after retries"
                        );
                    }
                    counter!("retry.success", 1, "operation" => operation_id.to_string());
                    histogram!("retry.attempts_used", attempt as f64);
                    return value;
                }
                Err(failure) => failure,
            };

            if failure.kind == ErrorKind::CircuitOpen {
                debug!(operation = %operation_id, attempt = %attempt, "Circuit open, skipping retries");
                break failure;
            }

            let classification = classify_failure(&failure);
            if !classification.category.is_retryable() {
                debug!(
                    operation = %operation_id,
                    category = %classification.category,
                    error = %failure,
                    "Failure is not retryable"
                );
                break failure;
            }

            if attempt >= max_attempts {
                warn!(
                    operation = %operation_id,
                    attempts = %attempt,
                    duration_ms = %started.elapsed().as_millis(),
                    error = %failure,
                    "Giving up after retries"
                );
                counter!("retry.exhausted", 1, "operation" => operation_id.to_string());
                break failure;
            }

            if let Some(breaker) = &self.breaker {
                if breaker.is_open(operation_id) {
                    debug!(operation = %operation_id, attempt = %attempt, "Circuit opened, skipping backoff");
                    break Failure::circuit_open(operation_id);
                }
            }

            let delay = config.backoff(attempt);
            debug!(
                operation = %operation_id,
                attempt = %attempt,
                max_attempts = %max_attempts,
                backoff_ms = %delay.as_millis(),
                error = %failure,
                "Retrying after error"
            );
            sleep(delay).await;
        };

        histogram!("retry.attempts_used", attempt as f64);
        fallback(failure.context("attempts", attempt)).await
    }
}
