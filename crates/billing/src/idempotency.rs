//! Payment event idempotency store
//!
//! Every captured payment is recorded once, keyed by the Razorpay event id.
//! The unique constraint on `provider_event_id` is the only serialization
//! point between concurrent deliveries of the same event: exactly one insert
//! wins, every other caller gets the existing row back.
//!
//! `document_status` gates document generation so that a redelivered event
//! whose documents were already produced does not produce them again.

use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::payload::{Notes, PaymentEntity};

const PROVIDER_EVENT_ID_CONSTRAINT: &str = "payment_events_provider_event_id_key";

/// Progress of invoice/receipt generation for one payment event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// Recorded, documents not yet produced (or a previous attempt failed)
    Pending,
    /// Invoice or receipt exists
    Generated,
    /// No document applies (unrecognized or incomplete notes)
    Skipped,
    /// Held for review (amount did not match the local order)
    Flagged,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Generated => "generated",
            DocumentStatus::Skipped => "skipped",
            DocumentStatus::Flagged => "flagged",
        }
    }

    /// Whether the webhook path still has document work to do
    pub fn needs_documents(&self) -> bool {
        matches!(self, DocumentStatus::Pending)
    }
}

impl std::str::FromStr for DocumentStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DocumentStatus::Pending),
            "generated" => Ok(DocumentStatus::Generated),
            "skipped" => Ok(DocumentStatus::Skipped),
            "flagged" => Ok(DocumentStatus::Flagged),
            other => Err(BillingError::Internal(format!(
                "unknown document status in database: {}",
                other
            ))),
        }
    }
}

/// A recorded webhook delivery for a captured payment
#[derive(Debug, Clone, Serialize)]
pub struct PaymentEvent {
    pub id: Uuid,
    pub provider_event_id: String,
    pub event_type: String,
    pub payment_id: String,
    pub order_id: Option<String>,
    /// Minor currency units
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub notes: Notes,
    pub document_status: DocumentStatus,
    pub status_detail: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub processed_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Attributes for a first-time insert
#[derive(Debug, Clone)]
pub struct NewPaymentEvent {
    pub provider_event_id: String,
    pub event_type: String,
    pub payment_id: String,
    pub order_id: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    pub notes: Notes,
}

impl NewPaymentEvent {
    pub fn from_entity(provider_event_id: &str, event_type: &str, entity: &PaymentEntity) -> Self {
        Self {
            provider_event_id: provider_event_id.to_string(),
            event_type: event_type.to_string(),
            payment_id: entity.id.clone(),
            order_id: entity.order_id.clone(),
            amount: entity.amount,
            currency: entity.currency.clone(),
            status: entity.status.clone(),
            notes: entity.notes.clone(),
        }
    }
}

/// Result of [`PaymentEventStore::record_if_new`]
#[derive(Debug, Clone)]
pub enum RecordOutcome {
    /// This call created the row
    Inserted(PaymentEvent),
    /// The event id was already recorded; the existing row is returned
    AlreadyKnown(PaymentEvent),
}

impl RecordOutcome {
    pub fn event(&self) -> &PaymentEvent {
        match self {
            RecordOutcome::Inserted(e) | RecordOutcome::AlreadyKnown(e) => e,
        }
    }

    pub fn into_event(self) -> PaymentEvent {
        match self {
            RecordOutcome::Inserted(e) | RecordOutcome::AlreadyKnown(e) => e,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, RecordOutcome::Inserted(_))
    }
}

#[async_trait]
pub trait PaymentEventStore: Send + Sync {
    /// Insert the event, or return the existing row when the event id is
    /// already recorded. Only a uniqueness violation on the event id is
    /// treated as "already known"; any other failure is returned as an error.
    async fn record_if_new(&self, event: &NewPaymentEvent) -> BillingResult<RecordOutcome>;

    async fn find_by_event_id(&self, provider_event_id: &str)
        -> BillingResult<Option<PaymentEvent>>;

    async fn mark_document_status(
        &self,
        id: Uuid,
        status: DocumentStatus,
        detail: Option<&str>,
    ) -> BillingResult<()>;

    /// Events still `pending` that were recorded before `recorded_before`
    async fn list_pending(
        &self,
        recorded_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<PaymentEvent>>;
}

/// Database row for `payment_events`
#[derive(Debug, sqlx::FromRow)]
struct PaymentEventRow {
    id: Uuid,
    provider_event_id: String,
    event_type: String,
    payment_id: String,
    order_id: Option<String>,
    amount: i64,
    currency: String,
    status: String,
    notes: serde_json::Value,
    document_status: String,
    status_detail: Option<String>,
    processed_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<PaymentEventRow> for PaymentEvent {
    type Error = BillingError;

    fn try_from(row: PaymentEventRow) -> Result<Self, Self::Error> {
        Ok(PaymentEvent {
            id: row.id,
            provider_event_id: row.provider_event_id,
            event_type: row.event_type,
            payment_id: row.payment_id,
            order_id: row.order_id,
            amount: row.amount,
            currency: row.currency,
            status: row.status,
            notes: Notes::from_json(&row.notes),
            document_status: row.document_status.parse()?,
            status_detail: row.status_detail,
            processed_at: row.processed_at,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    id, provider_event_id, event_type, payment_id, order_id, amount, currency,
    status, notes, document_status, status_detail, processed_at, updated_at
"#;

/// Postgres-backed store
#[derive(Clone)]
pub struct PgPaymentEventStore {
    pool: PgPool,
}

impl PgPaymentEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PaymentEventStore for PgPaymentEventStore {
    async fn record_if_new(&self, event: &NewPaymentEvent) -> BillingResult<RecordOutcome> {
        let inserted: Result<PaymentEventRow, sqlx::Error> = sqlx::query_as(&format!(
            r#"
            INSERT INTO payment_events
                (id, provider_event_id, event_type, payment_id, order_id, amount,
                 currency, status, notes, document_status, processed_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending', NOW(), NOW())
            RETURNING {}
            "#,
            SELECT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&event.provider_event_id)
        .bind(&event.event_type)
        .bind(&event.payment_id)
        .bind(&event.order_id)
        .bind(event.amount)
        .bind(&event.currency)
        .bind(&event.status)
        .bind(event.notes.to_json())
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(row) => Ok(RecordOutcome::Inserted(row.try_into()?)),
            Err(sqlx::Error::Database(db_err))
                if db_err.is_unique_violation()
                    && db_err
                        .constraint()
                        .map_or(true, |c| c == PROVIDER_EVENT_ID_CONSTRAINT) =>
            {
                tracing::info!(
                    event_id = %event.provider_event_id,
                    "Duplicate webhook event - unique constraint hit, loading existing row"
                );
                let existing = self
                    .find_by_event_id(&event.provider_event_id)
                    .await?
                    .ok_or_else(|| {
                        BillingError::Internal(format!(
                            "unique violation for event {} but no existing row",
                            event.provider_event_id
                        ))
                    })?;
                Ok(RecordOutcome::AlreadyKnown(existing))
            }
            Err(e) => {
                tracing::error!(
                    event_id = %event.provider_event_id,
                    error = %e,
                    "Failed to record payment event"
                );
                Err(e.into())
            }
        }
    }

    async fn find_by_event_id(
        &self,
        provider_event_id: &str,
    ) -> BillingResult<Option<PaymentEvent>> {
        let row: Option<PaymentEventRow> = sqlx::query_as(&format!(
            "SELECT {} FROM payment_events WHERE provider_event_id = $1",
            SELECT_COLUMNS
        ))
        .bind(provider_event_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PaymentEvent::try_from).transpose()
    }

    async fn mark_document_status(
        &self,
        id: Uuid,
        status: DocumentStatus,
        detail: Option<&str>,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE payment_events
            SET document_status = $2, status_detail = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(detail)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("payment event {}", id)));
        }
        Ok(())
    }

    async fn list_pending(
        &self,
        recorded_before: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<PaymentEvent>> {
        let rows: Vec<PaymentEventRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM payment_events
            WHERE document_status = 'pending' AND processed_at < $1
            ORDER BY processed_at ASC
            LIMIT $2
            "#,
            SELECT_COLUMNS
        ))
        .bind(recorded_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PaymentEvent::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_status_round_trip() {
        for status in [
            DocumentStatus::Pending,
            DocumentStatus::Generated,
            DocumentStatus::Skipped,
            DocumentStatus::Flagged,
        ] {
            assert_eq!(status.as_str().parse::<DocumentStatus>().unwrap(), status);
        }
        assert!("archived".parse::<DocumentStatus>().is_err());
    }

    #[test]
    fn test_only_pending_needs_documents() {
        assert!(DocumentStatus::Pending.needs_documents());
        assert!(!DocumentStatus::Generated.needs_documents());
        assert!(!DocumentStatus::Skipped.needs_documents());
        assert!(!DocumentStatus::Flagged.needs_documents());
    }
}
