//! # Alert Reporting
//!
//! Alerts raised by the error handling service and the dead-letter
//! processor, and the sinks that deliver them: the local log, an HTTP
//! webhook, or an in-memory list.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::types::{ResilienceError, Result};

/// Alert levels for monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertLevel {
    /// Informational alert
    Info,
    /// Warning alert
    Warning,
    /// Critical alert
    Critical,
    /// Escalated to operations, requires immediate attention
    Emergency,
}

/// An alert about failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub level: AlertLevel,
    pub title: String,
    pub message: String,
    /// Error key or work item the alert is about
    pub subject: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub context: serde_json::Value,
}

impl Alert {
    pub fn new<T, M, S>(level: AlertLevel, title: T, message: M, subject: S) -> Self
    where
        T: Into<String>,
        M: Into<String>,
        S: Into<String>,
    {
        Self {
            id: Uuid::new_v4(),
            level,
            title: title.into(),
            message: message.into(),
            subject: subject.into(),
            timestamp: Utc::now(),
            context: serde_json::Value::Null,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

/// Delivers alerts to operators
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send_alert(&self, alert: Alert) -> Result<()>;
}

/// Writes alerts to the structured log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send_alert(&self, alert: Alert) -> Result<()> {
        match alert.level {
            AlertLevel::Info => info!(
                alert = true,
                alert_id = %alert.id,
                subject = %alert.subject,
                message = %alert.message,
                "{}", alert.title
            ),
            AlertLevel::Warning => warn!(
                alert = true,
                alert_id = %alert.id,
                subject = %alert.subject,
                message = %alert.message,
                "{}", alert.title
            ),
            AlertLevel::Critical => error!(
                alert = true,
                alert_id = %alert.id,
                subject = %alert.subject,
                message = %alert.message,
                "{}", alert.title
            ),
            AlertLevel::Emergency => error!(
                alert = true,
                emergency = true,
                alert_id = %alert.id,
                subject = %alert.subject,
                message = %alert.message,
                "ESCALATION: {}", alert.title
            ),
        }
        Ok(())
    }
}

/// Posts alerts as JSON to an HTTP endpoint
#[derive(Debug, Clone)]
pub struct WebhookAlertSink {
    client: reqwest::Client,
    endpoint: String,
    auth_token: Option<String>,
    service_name: String,
    environment: String,
}

impl WebhookAlertSink {
    pub fn new(config: &AlertingConfig, endpoint: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            auth_token: config.auth_token.clone(),
            service_name: config.service_name.clone(),
            environment: config.environment.clone(),
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn send_alert(&self, alert: Alert) -> Result<()> {
        let payload = serde_json::json!({
            "service": self.service_name,
            "environment": self.environment,
            "alert": alert,
        });

        let mut request = self.client.post(&self.endpoint).json(&payload);
        if let Some(token) = &self.auth_token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Error reading response".to_string());
            return Err(ResilienceError::Alert(format!("HTTP {} - {}", status, body)));
        }
        Ok(())
    }
}

/// Keeps alerts in memory
#[derive(Debug, Default)]
pub struct InMemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl InMemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn count_at(&self, level: AlertLevel) -> usize {
        self.alerts().iter().filter(|a| a.level == level).count()
    }
}

#[async_trait]
impl AlertSink for InMemoryAlertSink {
    async fn send_alert(&self, alert: Alert) -> Result<()> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(alert);
        Ok(())
    }
}

/// Alerting settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    /// Webhook receiving alerts; none keeps alerts in the log
    pub webhook_url: Option<String>,
    /// Bearer token for the webhook
    pub auth_token: Option<String>,
    pub service_name: String,
    pub environment: String,
    /// HIGH alerts for one error key are suppressed for this long
    pub high_suppression_secs: u64,
    /// Sliding window for the MEDIUM error-rate check
    pub error_rate_window_secs: u64,
    /// MEDIUM errors alert once a key exceeds this many in the window
    pub error_rate_threshold: usize,
    /// Error-rate alerts for one error key are suppressed for this long
    pub error_rate_suppression_secs: u64,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            auth_token: None,
            service_name: "user-journey-analytics".to_string(),
            environment: "development".to_string(),
            high_suppression_secs: 300,
            error_rate_window_secs: 300,
            error_rate_threshold: 10,
            error_rate_suppression_secs: 900,
        }
    }
}

impl AlertingConfig {
    pub fn high_suppression(&self) -> Duration {
        Duration::from_secs(self.high_suppression_secs)
    }

    pub fn error_rate_window(&self) -> Duration {
        Duration::from_secs(self.error_rate_window_secs)
    }

    pub fn error_rate_suppression(&self) -> Duration {
        Duration::from_secs(self.error_rate_suppression_secs)
    }
}
