//! # Configuration
//!
//! One document configures the whole layer. Values come from an optional
//! file and from `RESILIENCE__SECTION__KEY` environment variables (a `.env`
//! file is loaded first), each section falling back to its defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::circuit_breaker::BreakerConfig;
use crate::dead_letter::DlqConfig;
use crate::logging::LoggingConfig;
use crate::monitoring::MetricsConfig;
use crate::reporting::AlertingConfig;
use crate::retry::RetryConfig;
use crate::types::{ResilienceError, Result};

const ENV_PREFIX: &str = "RESILIENCE";

/// Upper bound for `dlq.max_item_age_hours` (one year)
pub const MAX_ITEM_AGE_HOURS: i64 = 24 * 365;

/// Configuration for every component of the layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub circuit_breaker: BreakerConfig,
    /// Policy for generic retries
    pub retry: RetryConfig,
    /// Policy used by data-processing failures before dead-lettering
    pub data_processing_retry: RetryConfig,
    pub dlq: DlqConfig,
    pub alerting: AlertingConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
            data_processing_retry: RetryConfig {
                max_attempts: 3,
                initial_delay_ms: 1_000,
                ..RetryConfig::default()
            },
            dlq: DlqConfig::default(),
            alerting: AlertingConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ResilienceConfig {
    /// Loads configuration from `.env`, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Ok(env_file) = dotenv::dotenv() {
            debug!(path = %env_file.display(), "Loaded .env file");
        }

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        Self::try_from(settings)
    }

    /// Rejects settings the components cannot run with
    pub fn validate(&self) -> Result<()> {
        let cb = &self.circuit_breaker;
        if cb.failure_threshold == 0 || cb.success_threshold == 0 {
            return Err(ResilienceError::InvalidConfig(
                "circuit_breaker thresholds must be at least 1".to_string(),
            ));
        }

        for (name, retry) in [("retry", &self.retry), ("data_processing_retry", &self.data_processing_retry)] {
            if retry.max_attempts == 0 {
                return Err(ResilienceError::InvalidConfig(format!("{}.max_attempts must be at least 1", name)));
            }
            if retry.backoff_multiplier < 1.0 {
                return Err(ResilienceError::InvalidConfig(format!(
                    "{}.backoff_multiplier must be at least 1.0",
                    name
                )));
            }
            if !(0.0..=1.0).contains(&retry.jitter_factor) {
                return Err(ResilienceError::InvalidConfig(format!(
                    "{}.jitter_factor must be between 0 and 1",
                    name
                )));
            }
        }

        let dlq = &self.dlq;
        if dlq.enabled {
            if dlq.queue_url.as_deref().map_or(true, str::is_empty) {
                return Err(ResilienceError::InvalidConfig("dlq.queue_url is required when enabled".to_string()));
            }
            if dlq.retry_queue_url.as_deref().map_or(true, str::is_empty) {
                return Err(ResilienceError::InvalidConfig(
                    "dlq.retry_queue_url is required when enabled".to_string(),
                ));
            }
        }
        if dlq.batch_size == 0 || dlq.batch_size > 10 {
            return Err(ResilienceError::InvalidConfig("dlq.batch_size must be between 1 and 10".to_string()));
        }
        if dlq.processing_interval_ms == 0 {
            return Err(ResilienceError::InvalidConfig(
                "dlq.processing_interval_ms must be positive".to_string(),
            ));
        }
        if !(1..=MAX_ITEM_AGE_HOURS).contains(&dlq.max_item_age_hours) {
            return Err(ResilienceError::InvalidConfig(format!(
                "dlq.max_item_age_hours must be between 1 and {}",
                MAX_ITEM_AGE_HOURS
            )));
        }

        Ok(())
    }
}

impl TryFrom<config::Config> for ResilienceConfig {
    type Error = ResilienceError;

    fn try_from(cfg: config::Config) -> std::result::Result<Self, Self::Error> {
        let config: ResilienceConfig = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ResilienceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.open_timeout_ms, 60_000);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.data_processing_retry.initial_delay_ms, 1_000);
        assert_eq!(config.dlq.batch_size, 10);
        assert!(!config.dlq.enabled);
    }

    #[test]
    fn test_partial_sections_fall_back_to_defaults() {
        let settings = config::Config::builder()
            .set_override("circuit_breaker.failure_threshold", 7)
            .unwrap()
            .set_override("dlq.max_retry_attempts", 5)
            .unwrap()
            .build()
            .unwrap();

        let config = ResilienceConfig::try_from(settings).unwrap();
        assert_eq!(config.circuit_breaker.failure_threshold, 7);
        assert_eq!(config.circuit_breaker.success_threshold, 3);
        assert_eq!(config.dlq.max_retry_attempts, 5);
        assert_eq!(config.dlq.batch_size, 10);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = ResilienceConfig::default();
        config.retry.backoff_multiplier = 0.5;
        assert!(matches!(config.validate(), Err(ResilienceError::InvalidConfig(_))));

        let mut config = ResilienceConfig::default();
        config.dlq.enabled = true;
        assert!(config.validate().is_err());
        config.dlq.queue_url = Some("memory://dlq".to_string());
        config.dlq.retry_queue_url = Some("memory://retry".to_string());
        assert!(config.validate().is_ok());

        let mut config = ResilienceConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_item_age_must_be_a_sane_positive_span() {
        for hours in [0, -1, MAX_ITEM_AGE_HOURS + 1, i64::MAX] {
            let mut config = ResilienceConfig::default();
            config.dlq.max_item_age_hours = hours;
            assert!(
                matches!(config.validate(), Err(ResilienceError::InvalidConfig(_))),
                "{} hours accepted",
                hours
            );
        }

        let mut config = ResilienceConfig::default();
        config.dlq.max_item_age_hours = MAX_ITEM_AGE_HOURS;
        assert!(config.validate().is_ok());
    }
}
