//! Billing invariants
//!
//! Runnable consistency checks over payment events and the documents issued
//! for them. Each check is a single read-only SQL query; violations carry
//! enough context to find the offending rows.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Events pending for longer than this are reported as stuck
const STUCK_PENDING_MINUTES: i64 = 60;

const SERVICE_MISSING_INVOICE_SQL: &str = r#"
    SELECT e.id, e.provider_event_id, e.payment_id, e.amount, e.currency
    FROM payment_events e
    LEFT JOIN service_invoices i ON i.payment_event_id = e.id
    WHERE e.document_status = 'generated'
      AND LOWER(TRIM(e.notes->>'type')) = 'service'
      AND i.id IS NULL
"#;

const DONATION_MISSING_RECEIPT_SQL: &str = r#"
    SELECT e.id, e.provider_event_id, e.payment_id, e.amount, e.currency
    FROM payment_events e
    LEFT JOIN donation_receipts r ON r.payment_event_id = e.id
    WHERE e.document_status = 'generated'
      AND LOWER(TRIM(e.notes->>'type')) = 'donation'
      AND r.id IS NULL
"#;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Payment event rows affected
    pub payment_event_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// A paid event has no document, or a document misstates the amount
    Critical,
    /// Document generation is stuck
    High,
    /// Held for manual review
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    pub fn from_violations(
        checked_at: OffsetDateTime,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }

    /// Highest severity present, if any
    pub fn worst_severity(&self) -> Option<ViolationSeverity> {
        self.violations.iter().map(|v| v.severity).min()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MissingDocumentRow {
    id: Uuid,
    provider_event_id: String,
    payment_id: String,
    amount: i64,
    currency: String,
}

#[derive(Debug, sqlx::FromRow)]
struct AmountDriftRow {
    id: Uuid,
    provider_event_id: String,
    document_kind: String,
    document_number: String,
    event_amount: i64,
    document_amount: i64,
    event_currency: String,
    document_currency: String,
}

#[derive(Debug, sqlx::FromRow)]
struct StatusRow {
    id: Uuid,
    provider_event_id: String,
    payment_id: String,
    status_detail: Option<String>,
    processed_at: OffsetDateTime,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_service_events_have_invoice().await?);
        violations.extend(self.check_donation_events_have_receipt().await?);
        violations.extend(self.check_document_amounts_match().await?);
        violations.extend(self.check_no_stuck_pending().await?);
        violations.extend(self.check_flagged_events().await?);

        violations.sort_by_key(|v| v.severity);

        Ok(InvariantCheckSummary::from_violations(
            now,
            Self::available_checks().len(),
            violations,
        ))
    }

    /// A service payment marked `generated` must have its invoice.
    async fn check_service_events_have_invoice(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingDocumentRow> = sqlx::query_as(SERVICE_MISSING_INVOICE_SQL)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| missing_document("service_event_has_invoice", "invoice", row))
            .collect())
    }

    /// A donation marked `generated` must have its receipt.
    async fn check_donation_events_have_receipt(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingDocumentRow> = sqlx::query_as(DONATION_MISSING_RECEIPT_SQL)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| missing_document("donation_event_has_receipt", "receipt", row))
            .collect())
    }

    /// Issued documents must state exactly what was captured.
    async fn check_document_amounts_match(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<AmountDriftRow> = sqlx::query_as(
            r#"
            SELECT e.id, e.provider_event_id,
                   'invoice' AS document_kind,
                   i.invoice_number AS document_number,
                   e.amount AS event_amount, i.amount AS document_amount,
                   e.currency AS event_currency, i.currency AS document_currency
            FROM service_invoices i
            JOIN payment_events e ON e.id = i.payment_event_id
            WHERE i.amount <> e.amount OR UPPER(i.currency) <> UPPER(e.currency)
            UNION ALL
            SELECT e.id, e.provider_event_id,
                   'receipt' AS document_kind,
                   r.receipt_number AS document_number,
                   e.amount AS event_amount, r.amount AS document_amount,
                   e.currency AS event_currency, r.currency AS document_currency
            FROM donation_receipts r
            JOIN payment_events e ON e.id = r.payment_event_id
            WHERE r.amount <> e.amount OR UPPER(r.currency) <> UPPER(e.currency)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "document_amount_matches_event".to_string(),
                payment_event_ids: vec![row.id],
                description: format!(
                    "{} {} states {} {} but event {} captured {} {}",
                    row.document_kind,
                    row.document_number,
                    row.document_amount,
                    row.document_currency,
                    row.provider_event_id,
                    row.event_amount,
                    row.event_currency
                ),
                context: serde_json::json!({
                    "event_id": row.provider_event_id,
                    "document_kind": row.document_kind,
                    "document_number": row.document_number,
                    "event_amount": row.event_amount,
                    "document_amount": row.document_amount,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Nothing should sit in `pending` once the reconciler has had its turn.
    async fn check_no_stuck_pending(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StatusRow> = sqlx::query_as(
            r#"
            SELECT id, provider_event_id, payment_id, status_detail, processed_at
            FROM payment_events
            WHERE document_status = 'pending'
              AND processed_at < NOW() - make_interval(mins => $1::int)
            ORDER BY processed_at
            "#,
        )
        .bind(STUCK_PENDING_MINUTES as i32)
        .fetch_all(&self.pool)
        .await?;

        let now = OffsetDateTime::now_utc();
        Ok(rows
            .into_iter()
            .map(|row| {
                let age_minutes = (now - row.processed_at).whole_minutes();
                InvariantViolation {
                    invariant: "no_stuck_pending_events".to_string(),
                    payment_event_ids: vec![row.id],
                    description: format!(
                        "Event {} has been pending documents for {} minutes",
                        row.provider_event_id, age_minutes
                    ),
                    context: serde_json::json!({
                        "event_id": row.provider_event_id,
                        "payment_id": row.payment_id,
                        "age_minutes": age_minutes,
                        "last_detail": row.status_detail,
                    }),
                    severity: ViolationSeverity::High,
                }
            })
            .collect())
    }

    /// Flagged events are waiting on a human.
    async fn check_flagged_events(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StatusRow> = sqlx::query_as(
            r#"
            SELECT id, provider_event_id, payment_id, status_detail, processed_at
            FROM payment_events
            WHERE document_status = 'flagged'
            ORDER BY processed_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_flagged_events".to_string(),
                payment_event_ids: vec![row.id],
                description: format!(
                    "Event {} is held for amount review",
                    row.provider_event_id
                ),
                context: serde_json::json!({
                    "event_id": row.provider_event_id,
                    "payment_id": row.payment_id,
                    "detail": row.status_detail,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "service_event_has_invoice" => self.check_service_events_have_invoice().await,
            "donation_event_has_receipt" => self.check_donation_events_have_receipt().await,
            "document_amount_matches_event" => self.check_document_amounts_match().await,
            "no_stuck_pending_events" => self.check_no_stuck_pending().await,
            "no_flagged_events" => self.check_flagged_events().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "service_event_has_invoice",
            "donation_event_has_receipt",
            "document_amount_matches_event",
            "no_stuck_pending_events",
            "no_flagged_events",
        ]
    }
}

fn missing_document(
    invariant: &str,
    document: &str,
    row: MissingDocumentRow,
) -> InvariantViolation {
    InvariantViolation {
        invariant: invariant.to_string(),
        payment_event_ids: vec![row.id],
        description: format!(
            "Event {} is marked generated but has no {}",
            row.provider_event_id, document
        ),
        context: serde_json::json!({
            "event_id": row.provider_event_id,
            "payment_id": row.payment_id,
            "amount": row.amount,
            "currency": row.currency,
        }),
        severity: ViolationSeverity::Critical,
    }
}
