//! Error tracking
//!
//! Failures on the webhook path are reported with the event and payment ids
//! as tags. Reporting is fire-and-forget and never changes control flow.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::error::{BillingError, BillingResult};

/// Tags attached to a report
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReportContext {
    tags: BTreeMap<&'static str, String>,
}

impl ReportContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.tags.insert(key, value.into());
        self
    }

    pub fn insert(&mut self, key: &'static str, value: impl Into<String>) {
        self.tags.insert(key, value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn tags(&self) -> &BTreeMap<&'static str, String> {
        &self.tags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportLevel {
    Warning,
    Error,
}

impl ReportLevel {
    pub fn for_error(error: &BillingError) -> Self {
        if error.is_permanent() {
            ReportLevel::Warning
        } else {
            ReportLevel::Error
        }
    }
}

/// A single captured failure
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub level: ReportLevel,
    pub kind: &'static str,
    pub message: String,
    pub tags: BTreeMap<&'static str, String>,
}

impl ErrorReport {
    pub fn from_error(error: &BillingError, ctx: &ReportContext) -> Self {
        Self {
            level: ReportLevel::for_error(error),
            kind: error.kind(),
            message: error.to_string(),
            tags: ctx.tags.clone(),
        }
    }
}

/// Sink for breadcrumbs and captured errors
pub trait ErrorReporter: Send + Sync {
    fn breadcrumb(&self, message: &str, ctx: &ReportContext);

    fn capture(&self, error: &BillingError, ctx: &ReportContext);
}

/// Reporter that only writes to the tracing subscriber
#[derive(Debug, Clone, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn breadcrumb(&self, message: &str, ctx: &ReportContext) {
        tracing::debug!(tags = ?ctx.tags(), "{}", message);
    }

    fn capture(&self, error: &BillingError, ctx: &ReportContext) {
        match ReportLevel::for_error(error) {
            ReportLevel::Warning => {
                tracing::warn!(kind = error.kind(), tags = ?ctx.tags(), error = %error, "Webhook failure captured")
            }
            ReportLevel::Error => {
                tracing::error!(kind = error.kind(), tags = ?ctx.tags(), error = %error, "Webhook failure captured")
            }
        }
    }
}

/// Reporter that POSTs each captured error as JSON to an alerting webhook
/// (Slack-compatible incoming webhook or an error-tracking ingest URL).
#[derive(Clone)]
pub struct AlertWebhookReporter {
    client: reqwest::Client,
    url: String,
    fallback: TracingReporter,
}

impl AlertWebhookReporter {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            fallback: TracingReporter,
        }
    }

    /// Deliver one report, retrying transient failures with backoff
    pub async fn send(&self, report: &ErrorReport) -> BillingResult<()> {
        let strategy = ExponentialBackoff::from_millis(100)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(3);

        let body = serde_json::json!({
            "text": format!("[{}] {}", report.kind, report.message),
            "report": report,
        });

        Retry::spawn(strategy, || async {
            self.client
                .post(&self.url)
                .json(&body)
                .timeout(Duration::from_secs(5))
                .send()
                .await?
                .error_for_status()
                .map(|_| ())
        })
        .await
        .map_err(|e| BillingError::Internal(format!("alert delivery failed: {}", e)))
    }
}

impl ErrorReporter for AlertWebhookReporter {
    fn breadcrumb(&self, message: &str, ctx: &ReportContext) {
        self.fallback.breadcrumb(message, ctx);
    }

    fn capture(&self, error: &BillingError, ctx: &ReportContext) {
        self.fallback.capture(error, ctx);

        let report = ErrorReport::from_error(error, ctx);
        let reporter = self.clone();
        tokio::spawn(async move {
            if let Err(e) = reporter.send(&report).await {
                tracing::warn!(error = %e, kind = report.kind, "Failed to deliver error report");
            }
        });
    }
}
