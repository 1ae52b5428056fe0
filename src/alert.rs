//! Alert dispatch.
//!
//! An [`Alert`] fans out to every registered [`AlertSink`]. Sinks are
//! independent: one failing never stops the others. The log sink is always
//! present; a webhook sink is added when a URL is configured.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::types::{now_millis, ConsistencyReport, RepairSummary, Severity};

#[derive(Error, Debug)]
pub enum AlertError {
    #[error("Alert sink '{sink}' failed: {reason}")]
    Delivery { sink: String, reason: String },
    #[error("Alert sink '{sink}' misconfigured: {reason}")]
    Config { sink: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    ConsistencyIssues,
    RepairFailed,
    PipelineError,
    Summary,
}

impl AlertType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConsistencyIssues => "consistency_issues",
            Self::RepairFailed => "repair_failed",
            Self::PipelineError => "pipeline_error",
            Self::Summary => "summary",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_type: AlertType,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub timestamp: i64,
}

impl Alert {
    pub fn new(alert_type: AlertType, severity: Severity, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            alert_type,
            severity,
            title: title.into(),
            message: message.into(),
            timestamp: now_millis(),
        }
    }

    /// Critical issues survived the repair pass.
    #[must_use]
    pub fn critical_outstanding(critical: u64, report: &ConsistencyReport) -> Self {
        Self::new(
            AlertType::ConsistencyIssues,
            Severity::Critical,
            format!("{} critical consistency issues outstanding", critical),
            format!(
                "Report {}: {} entities checked, {} issues ({} critical), {} repaired",
                report.report_id,
                report.entities_checked,
                report.total_issues,
                report.critical_issues,
                report.issues_repaired
            ),
        )
    }

    #[must_use]
    pub fn repair_failed(summary: &RepairSummary) -> Self {
        Self::new(
            AlertType::RepairFailed,
            Severity::Warning,
            format!("{} repairs failed", summary.failed),
            format!(
                "{} of {} repairs succeeded ({:.1}%)",
                summary.repaired, summary.processed, summary.success_rate
            ),
        )
    }

    #[must_use]
    pub fn pipeline_error(pass: &str, err: &dyn std::fmt::Display) -> Self {
        Self::new(
            AlertType::PipelineError,
            Severity::Critical,
            format!("{} pass failed", pass),
            err.to_string(),
        )
    }

    #[must_use]
    pub fn summary(report: &ConsistencyReport, repair: Option<&RepairSummary>) -> Self {
        let severity = if report.has_critical() { Severity::Warning } else { Severity::Info };
        let mut message = format!(
            "{} entities checked, {} issues (critical {}, warning {}, info {}), success rate {:.1}%",
            report.entities_checked,
            report.total_issues,
            report.critical_issues,
            report.warning_issues,
            report.info_issues,
            report.success_rate
        );
        if let Some(r) = repair {
            message.push_str(&format!("; repaired {}/{}", r.repaired, r.processed));
        }
        Self::new(AlertType::Summary, severity, "Consistency summary", message)
    }
}

/// One alert destination.
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, alert: &Alert) -> Result<(), AlertError>;
}

/// Writes alerts to the tracing log at a level matching their severity.
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        let kind = alert.alert_type.as_str();
        match alert.severity {
            Severity::Critical => error!(alert = kind, title = %alert.title, "{}", alert.message),
            Severity::Warning => warn!(alert = kind, title = %alert.title, "{}", alert.message),
            Severity::Info => info!(alert = kind, title = %alert.title, "{}", alert.message),
        }
        Ok(())
    }
}

/// POSTs the alert as JSON. Non-2xx responses count as failures.
pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, AlertError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AlertError::Config {
                sink: "webhook".into(),
                reason: e.to_string(),
            })?;
        Ok(Self { url: url.into(), client })
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> Result<(), AlertError> {
        let delivery = |reason: String| AlertError::Delivery {
            sink: "webhook".into(),
            reason,
        };
        let response = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .map_err(|e| delivery(e.to_string()))?;
        response
            .error_for_status()
            .map_err(|e| delivery(e.to_string()))?;
        Ok(())
    }
}

pub struct AlertDispatcher {
    sinks: Vec<Box<dyn AlertSink>>,
}

impl Default for AlertDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertDispatcher {
    /// Dispatcher with the log sink only.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sinks: vec![Box::new(LogSink)],
        }
    }

    /// Log sink plus a webhook sink when `url` is set.
    pub fn from_webhook(url: Option<&str>, timeout: Duration) -> Result<Self, AlertError> {
        let mut dispatcher = Self::new();
        if let Some(url) = url {
            dispatcher.add_sink(Box::new(WebhookSink::new(url, timeout)?));
        }
        Ok(dispatcher)
    }

    pub fn add_sink(&mut self, sink: Box<dyn AlertSink>) {
        self.sinks.push(sink);
    }

    #[must_use]
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Deliver to every sink. Returns how many delivered.
    pub async fn send_alert(&self, alert: &Alert) -> usize {
        let mut delivered = 0;
        for sink in &self.sinks {
            match sink.send(alert).await {
                Ok(()) => {
                    delivered += 1;
                    crate::metrics::record_alert(alert.alert_type.as_str(), sink.name(), true);
                }
                Err(e) => {
                    crate::metrics::record_alert(alert.alert_type.as_str(), sink.name(), false);
                    warn!(sink = sink.name(), error = %e, "Alert sink failed");
                }
            }
        }
        delivered
    }
}
