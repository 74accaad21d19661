//! # Monitoring
//!
//! Metric sink abstraction used for per-failure metrics, a sink forwarding
//! into the `metrics` facade, and the Prometheus exporter installer.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{Key, Label};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::types::{ResilienceError, Result};

/// Errors reported by a metric sink
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("metric sink is shutting down")]
    ShuttingDown,

    #[error("metric delivery failed: {0}")]
    Delivery(String),
}

/// Unit of a metric value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricUnit {
    Count,
    Milliseconds,
    Seconds,
    None,
}

/// A single metric observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDatum {
    pub namespace: String,
    pub name: String,
    pub value: f64,
    pub unit: MetricUnit,
    pub timestamp: DateTime<Utc>,
    pub dimensions: BTreeMap<String, String>,
}

impl MetricDatum {
    /// A count of one, timestamped now
    pub fn count<N: Into<String>, M: Into<String>>(namespace: N, name: M) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            value: 1.0,
            unit: MetricUnit::Count,
            timestamp: Utc::now(),
            dimensions: BTreeMap::new(),
        }
    }

    pub fn dimension<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.dimensions.insert(key.into(), value.into());
        self
    }
}

/// Destination for metric observations
#[async_trait]
pub trait MetricSink: Send + Sync {
    async fn put_metric(&self, datum: MetricDatum) -> std::result::Result<(), SinkError>;
}

/// Forwards observations to the global `metrics` recorder as counters
/// (for `Count`) or histograms, named `<namespace>.<name>`
#[derive(Debug, Clone, Copy, Default)]
pub struct RecorderSink;

#[async_trait]
impl MetricSink for RecorderSink {
    async fn put_metric(&self, datum: MetricDatum) -> std::result::Result<(), SinkError> {
        let labels: Vec<Label> = datum
            .dimensions
            .into_iter()
            .map(|(k, v)| Label::new(k, v))
            .collect();
        let key = Key::from_parts(format!("{}.{}", datum.namespace, datum.name), labels);

        let recorder = metrics::recorder();
        match datum.unit {
            MetricUnit::Count => recorder.register_counter(&key).increment(datum.value.max(0.0) as u64),
            _ => recorder.register_histogram(&key).record(datum.value),
        }
        Ok(())
    }
}

/// Keeps every observation in memory
#[derive(Debug, Default)]
pub struct InMemoryMetricSink {
    recorded: Mutex<Vec<MetricDatum>>,
}

impl InMemoryMetricSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observations received so far
    pub fn recorded(&self) -> Vec<MetricDatum> {
        self.recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Observations with the given metric name
    pub fn named(&self, name: &str) -> Vec<MetricDatum> {
        self.recorded().into_iter().filter(|d| d.name == name).collect()
    }
}

#[async_trait]
impl MetricSink for InMemoryMetricSink {
    async fn put_metric(&self, datum: MetricDatum) -> std::result::Result<(), SinkError> {
        self.recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(datum);
        Ok(())
    }
}

/// Metrics settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether per-failure metrics are emitted at all
    pub enabled: bool,
    /// Namespace for emitted metrics
    pub namespace: String,
    /// Address for the Prometheus scrape endpoint; none disables the exporter
    pub prometheus_listen: Option<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "UserJourneyAnalytics".to_string(),
            prometheus_listen: None,
        }
    }
}

/// Installs the Prometheus exporter as the global `metrics` recorder
///
/// Does nothing when no listen address is configured. Must be called from
/// within a tokio runtime.
pub fn init_metrics_exporter(config: &MetricsConfig) -> Result<()> {
    let Some(listen) = &config.prometheus_listen else {
        return Ok(());
    };

    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| ResilienceError::InvalidConfig(format!("metrics.prometheus_listen {}: {}", listen, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| ResilienceError::Metrics(e.to_string()))?;

    info!(listen = %addr, "Prometheus exporter installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_sink_records() {
        let sink = InMemoryMetricSink::new();
        sink.put_metric(
            MetricDatum::count("UserJourneyAnalytics", "ErrorCount")
                .dimension("Component", "ingest")
                .dimension("Operation", "parse"),
        )
        .await
        .unwrap();

        let recorded = sink.named("ErrorCount");
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].value, 1.0);
        assert_eq!(recorded[0].dimensions["Component"], "ingest");
    }

    #[tokio::test]
    async fn test_recorder_sink_without_recorder() {
        // No global recorder installed: the noop recorder swallows the datum
        let result = RecorderSink
            .put_metric(MetricDatum::count("ns", "name").dimension("k", "v"))
            .await;
        assert!(result.is_ok());
    }

    #[test]
    fn test_exporter_disabled_without_address() {
        assert!(init_metrics_exporter(&MetricsConfig::default()).is_ok());
    }

    #[test]
    fn test_exporter_rejects_bad_address() {
        let config = MetricsConfig {
            prometheus_listen: Some("not-an-address".to_string()),
            ..MetricsConfig::default()
        };
        assert!(matches!(
            init_metrics_exporter(&config),
            Err(ResilienceError::InvalidConfig(_))
        ));
    }
}
