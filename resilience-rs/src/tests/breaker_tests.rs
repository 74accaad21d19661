//! Tests for circuit breaking and retries working together

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitState};
    use crate::retry::{RetryConfig, RetryExecutor};
    use crate::types::{ErrorKind, Failure};

    #[tokio::test]
    async fn test_payments_circuit_opens_after_threshold() {
        let breaker = CircuitBreaker::new();
        let config = BreakerConfig {
            failure_threshold: 5,
            ..BreakerConfig::default()
        };
        let invocations = Arc::new(AtomicUsize::new(0));

        let mut results = Vec::new();
        for _ in 0..6 {
            let invocations = Arc::clone(&invocations);
            let value = breaker
                .execute(
                    "payments",
                    move || async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        Err::<&str, _>(Failure::connection("payment gateway unreachable"))
                    },
                    || "fallback",
                    &config,
                )
                .await;
            results.push(value);
        }

        assert_eq!(invocations.load(Ordering::SeqCst), 5);
        assert!(results.iter().all(|r| *r == "fallback"));

        let status = breaker.status("payments");
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.failure_count, 5);
        assert!(status.last_failure_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_cycle() {
        let breaker = CircuitBreaker::new();
        let config = BreakerConfig {
            failure_threshold: 2,
            open_timeout_ms: 60_000,
            success_threshold: 3,
            ..BreakerConfig::default()
        };

        for _ in 0..2 {
            breaker
                .execute("inference", || async { Err::<u8, _>(Failure::timeout("slow")) }, || 0, &config)
                .await;
        }
        assert_eq!(breaker.state("inference"), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(60)).await;

        for expected in [CircuitState::HalfOpen, CircuitState::HalfOpen, CircuitState::Closed] {
            let value = breaker
                .execute("inference", || async { Ok::<u8, Failure>(7) }, || 0, &config)
                .await;
            assert_eq!(value, 7);
            assert_eq!(breaker.state("inference"), expected);
        }

        let status = breaker.status("inference");
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.success_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_trips_shared_breaker_and_short_circuits() {
        let breaker = Arc::new(CircuitBreaker::new());
        let breaker_config = BreakerConfig {
            failure_threshold: 2,
            ..BreakerConfig::default()
        };
        let executor = RetryExecutor::with_circuit_breaker(Arc::clone(&breaker), breaker_config);
        let retry_config = RetryConfig {
            max_attempts: 5,
            initial_delay_ms: 100,
            ..RetryConfig::default()
        };
        let invocations = Arc::new(AtomicUsize::new(0));

        let counted = Arc::clone(&invocations);
        let fallback_kind = executor
            .execute_with_retry(
                "storage",
                move || {
                    let counted = Arc::clone(&counted);
                    async move {
                        counted.fetch_add(1, Ordering::SeqCst);
                        Err::<ErrorKind, _>(Failure::connection("connection reset"))
                    }
                },
                |failure| async move { failure.kind },
                &retry_config,
            )
            .await;

        // Two real attempts open the circuit; the loop stops without a third
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
        assert_eq!(fallback_kind, ErrorKind::CircuitOpen);
        assert!(breaker.is_open("storage"));
    }

    #[tokio::test]
    async fn test_reset_restores_service() {
        let breaker = CircuitBreaker::new();
        let config = BreakerConfig {
            failure_threshold: 1,
            ..BreakerConfig::default()
        };

        breaker
            .execute("search", || async { Err::<u8, _>(Failure::other("boom")) }, || 0, &config)
            .await;
        assert!(breaker.is_open("search"));

        breaker.reset("search");
        let value = breaker
            .execute("search", || async { Ok::<u8, Failure>(1) }, || 0, &config)
            .await;
        assert_eq!(value, 1);
        assert_eq!(breaker.all_statuses()["search"].state, CircuitState::Closed);
    }
}
