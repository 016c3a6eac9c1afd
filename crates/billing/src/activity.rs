//! Activity feed
//!
//! Human-facing, append-only records ("plan activated", "donation received")
//! shown on dashboards. Writes are best-effort: a failed append is logged and
//! swallowed so it can never fail a webhook that already recorded the payment.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

/// Kinds of activity the payment path emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    PlanActivated,
    DonationReceived,
    PaymentCapturedUnclassified,
    PaymentAmountMismatch,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::PlanActivated => "plan_activated",
            ActivityKind::DonationReceived => "donation_received",
            ActivityKind::PaymentCapturedUnclassified => "payment_captured_unclassified",
            ActivityKind::PaymentAmountMismatch => "payment_amount_mismatch",
        }
    }
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One feed entry
#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub id: Uuid,
    pub kind: ActivityKind,
    pub metadata: serde_json::Value,
}

/// Builder for activity entries
pub struct ActivityEntryBuilder {
    kind: ActivityKind,
    metadata: serde_json::Map<String, serde_json::Value>,
}

impl ActivityEntryBuilder {
    pub fn new(kind: ActivityKind) -> Self {
        Self {
            kind,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn field(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn field_opt(self, key: &str, value: Option<impl Into<serde_json::Value>>) -> Self {
        match value {
            Some(v) => self.field(key, v),
            None => self,
        }
    }

    pub fn payment(self, provider_event_id: &str, payment_id: &str) -> Self {
        self.field("event_id", provider_event_id)
            .field("payment_id", payment_id)
    }

    pub fn build(self) -> ActivityEntry {
        ActivityEntry {
            id: Uuid::new_v4(),
            kind: self.kind,
            metadata: serde_json::Value::Object(self.metadata),
        }
    }
}

/// Where entries are written
#[async_trait]
pub trait ActivitySink: Send + Sync {
    async fn write(&self, entry: &ActivityEntry) -> BillingResult<()>;
}

/// Fire-and-forget front end over an [`ActivitySink`]
#[derive(Clone)]
pub struct ActivityLogger {
    sink: Arc<dyn ActivitySink>,
}

impl ActivityLogger {
    pub fn new(sink: Arc<dyn ActivitySink>) -> Self {
        Self { sink }
    }

    /// Append an entry. Never fails; errors are logged at WARN.
    pub async fn append(&self, entry: ActivityEntryBuilder) {
        let entry = entry.build();
        if let Err(e) = self.sink.write(&entry).await {
            tracing::warn!(
                kind = %entry.kind,
                error = %e,
                "Failed to append activity log entry"
            );
        }
    }
}

/// Postgres-backed sink writing to `activity_log`
#[derive(Clone)]
pub struct PgActivitySink {
    pool: PgPool,
}

impl PgActivitySink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ActivitySink for PgActivitySink {
    async fn write(&self, entry: &ActivityEntry) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO activity_log (id, event_kind, metadata, created_at)
            VALUES ($1, $2, $3, NOW())
            "#,
        )
        .bind(entry.id)
        .bind(entry.kind.as_str())
        .bind(&entry.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
