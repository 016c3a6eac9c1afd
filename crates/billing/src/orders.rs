//! Local order ledger and webhook amount cross-check
//!
//! The `notes` echoed back by Razorpay are only as trustworthy as the HMAC
//! around them. Before any document is generated, the reported amount is
//! compared with the amount recorded locally when the order was created.

use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::idempotency::PaymentEvent;
use crate::payload::PurposeKind;

/// Order as recorded by the checkout path
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct OrderRecord {
    pub order_id: String,
    pub purpose: String,
    pub amount: i64,
    pub currency: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub order_id: String,
    pub purpose: PurposeKind,
    pub amount: i64,
    pub currency: String,
}

#[async_trait]
pub trait OrderLedger: Send + Sync {
    async fn find_order(&self, order_id: &str) -> BillingResult<Option<OrderRecord>>;

    async fn record_order(&self, order: &NewOrder) -> BillingResult<()>;
}

/// Outcome of a successful cross-check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmountCheck {
    /// Local order found and amounts agree
    Matched,
    /// No local order on file; allowed because strict matching is off
    Unverified,
}

/// Compare the event's amount against the local order.
///
/// Returns `AmountMismatch` when a local order exists and disagrees, and
/// `OrderNotFound` when no order is on file and `require_order` is set.
pub async fn verify_amount(
    ledger: &dyn OrderLedger,
    event: &PaymentEvent,
    require_order: bool,
) -> BillingResult<AmountCheck> {
    let order = match event.order_id.as_deref() {
        Some(order_id) => ledger.find_order(order_id).await?,
        None => None,
    };

    let Some(order) = order else {
        let order_id = event.order_id.clone().unwrap_or_else(|| "<none>".into());
        if require_order {
            return Err(BillingError::OrderNotFound(order_id));
        }
        tracing::warn!(
            event_id = %event.provider_event_id,
            order_id = %order_id,
            amount = event.amount,
            "No local order on file; webhook amount not cross-checked"
        );
        return Ok(AmountCheck::Unverified);
    };

    if order.amount != event.amount || !order.currency.eq_ignore_ascii_case(&event.currency) {
        return Err(BillingError::AmountMismatch {
            order_id: order.order_id,
            expected: order.amount,
            expected_currency: order.currency,
            reported: event.amount,
            reported_currency: event.currency.clone(),
        });
    }

    Ok(AmountCheck::Matched)
}

/// Postgres-backed ledger
#[derive(Clone)]
pub struct PgOrderLedger {
    pool: PgPool,
}

impl PgOrderLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderLedger for PgOrderLedger {
    async fn find_order(&self, order_id: &str) -> BillingResult<Option<OrderRecord>> {
        Ok(sqlx::query_as(
            r#"
            SELECT order_id, purpose, amount, currency, created_at
            FROM payment_orders
            WHERE order_id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn record_order(&self, order: &NewOrder) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_orders (order_id, purpose, amount, currency, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (order_id) DO NOTHING
            "#,
        )
        .bind(&order.order_id)
        .bind(order.purpose.as_str())
        .bind(order.amount)
        .bind(&order.currency)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::DocumentStatus;
    use crate::memory::InMemoryOrderLedger;
    use crate::payload::Notes;
    use uuid::Uuid;

    fn event(order_id: Option<&str>, amount: i64) -> PaymentEvent {
        PaymentEvent {
            id: Uuid::new_v4(),
            provider_event_id: "evt_1".into(),
            event_type: "payment.captured".into(),
            payment_id: "pay_1".into(),
            order_id: order_id.map(str::to_string),
            amount,
            currency: "INR".into(),
            status: "captured".into(),
            notes: Notes::new(),
            document_status: DocumentStatus::Pending,
            status_detail: None,
            processed_at: OffsetDateTime::now_utc(),
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    async fn ledger_with(order_id: &str, amount: i64) -> InMemoryOrderLedger {
        let ledger = InMemoryOrderLedger::new();
        ledger
            .record_order(&NewOrder {
                order_id: order_id.into(),
                purpose: PurposeKind::Service,
                amount,
                currency: "INR".into(),
            })
            .await
            .unwrap();
        ledger
    }

    #[tokio::test]
    async fn test_matching_amount_passes() {
        let ledger = ledger_with("order_1", 9900).await;
        let check = verify_amount(&ledger, &event(Some("order_1"), 9900), true)
            .await
            .unwrap();
        assert_eq!(check, AmountCheck::Matched);
    }

    #[tokio::test]
    async fn test_different_amount_is_mismatch() {
        let ledger = ledger_with("order_1", 9900).await;
        let result = verify_amount(&ledger, &event(Some("order_1"), 100), false).await;
        match result {
            Err(BillingError::AmountMismatch {
                expected, reported, ..
            }) => {
                assert_eq!(expected, 9900);
                assert_eq!(reported, 100);
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_order_allowed_when_not_strict() {
        let ledger = InMemoryOrderLedger::new();
        let check = verify_amount(&ledger, &event(Some("order_x"), 9900), false)
            .await
            .unwrap();
        assert_eq!(check, AmountCheck::Unverified);
    }

    #[tokio::test]
    async fn test_missing_order_rejected_when_strict() {
        let ledger = InMemoryOrderLedger::new();
        let result = verify_amount(&ledger, &event(None, 9900), true).await;
        assert!(matches!(result, Err(BillingError::OrderNotFound(_))));
    }
}
