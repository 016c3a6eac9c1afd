//! Billing document generation
//!
//! A captured `service` payment produces a [`ServiceInvoice`]; a captured
//! `donation` produces a [`DonationReceipt`]. Each document is tied 1:1 to its
//! payment event by a unique `payment_event_id`, so a retried generation
//! returns the document created by the earlier attempt instead of a second one.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::payload::{DonorInfo, PayerInfo, PlanInfo};

pub const INVOICE_PREFIX: &str = "XAI-INV";
pub const RECEIPT_PREFIX: &str = "XAI-RCT";

/// Integer amount in minor currency units
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Money {
    pub minor: i64,
    pub currency: String,
}

impl Money {
    pub fn new(minor: i64, currency: impl Into<String>) -> Self {
        Self {
            minor,
            currency: currency.into(),
        }
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.minor < 0 { "-" } else { "" };
        let abs = self.minor.unsigned_abs();
        write!(f, "{} {}{}.{:02}", self.currency, sign, abs / 100, abs % 100)
    }
}

/// Human-readable document number, e.g. `XAI-INV-2025-000042`
pub fn document_number(prefix: &str, year: i32, sequence: i64) -> String {
    format!("{}-{}-{:06}", prefix, year, sequence)
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ServiceInvoice {
    pub id: Uuid,
    pub payment_event_id: Uuid,
    pub invoice_number: String,
    pub user_id: String,
    pub payer_name: Option<String>,
    pub payer_email: Option<String>,
    pub plan_tier: String,
    pub plan_name: Option<String>,
    pub plan_duration_days: Option<i32>,
    pub amount: i64,
    pub currency: String,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DonationReceipt {
    pub id: Uuid,
    pub payment_event_id: Uuid,
    pub receipt_number: String,
    pub donor_name: Option<String>,
    pub donor_email: Option<String>,
    pub is_anonymous: bool,
    pub amount: i64,
    pub currency: String,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
}

impl DonationReceipt {
    pub fn display_name(&self) -> &str {
        if self.is_anonymous {
            return "Anonymous";
        }
        self.donor_name.as_deref().unwrap_or("Supporter")
    }
}

/// Invoice contents before a number is assigned
#[derive(Debug, Clone)]
pub struct InvoiceDraft {
    pub payment_event_id: Uuid,
    pub payer: PayerInfo,
    pub plan: PlanInfo,
    pub amount: Money,
}

/// Receipt contents before a number is assigned
#[derive(Debug, Clone)]
pub struct ReceiptDraft {
    pub payment_event_id: Uuid,
    pub donor: DonorInfo,
    pub is_anonymous: bool,
    pub amount: Money,
}

/// Either kind of generated document
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GeneratedDocument {
    Invoice(ServiceInvoice),
    Receipt(DonationReceipt),
}

impl GeneratedDocument {
    pub fn number(&self) -> &str {
        match self {
            GeneratedDocument::Invoice(i) => &i.invoice_number,
            GeneratedDocument::Receipt(r) => &r.receipt_number,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            GeneratedDocument::Invoice(i) => i.id,
            GeneratedDocument::Receipt(r) => r.id,
        }
    }
}

/// Durable document storage. Inserts are idempotent per payment event.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_invoice(&self, draft: &InvoiceDraft) -> BillingResult<ServiceInvoice>;

    async fn insert_receipt(&self, draft: &ReceiptDraft) -> BillingResult<DonationReceipt>;

    async fn find_invoice(&self, payment_event_id: Uuid) -> BillingResult<Option<ServiceInvoice>>;

    async fn find_receipt(&self, payment_event_id: Uuid)
        -> BillingResult<Option<DonationReceipt>>;
}

/// Builds invoices and receipts from decoded payment notes
#[derive(Clone)]
pub struct DocumentGenerator {
    store: Arc<dyn DocumentStore>,
}

impl DocumentGenerator {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn generate_invoice(
        &self,
        payment_event_id: Uuid,
        payer: &PayerInfo,
        plan: &PlanInfo,
        amount: &Money,
    ) -> BillingResult<ServiceInvoice> {
        validate_amount(amount)?;

        let invoice = self
            .store
            .insert_invoice(&InvoiceDraft {
                payment_event_id,
                payer: payer.clone(),
                plan: plan.clone(),
                amount: amount.clone(),
            })
            .await?;

        tracing::info!(
            payment_event_id = %payment_event_id,
            invoice_number = %invoice.invoice_number,
            user_id = %invoice.user_id,
            plan_tier = %invoice.plan_tier,
            amount = %amount,
            "Service invoice generated"
        );

        Ok(invoice)
    }

    pub async fn generate_receipt(
        &self,
        payment_event_id: Uuid,
        donor: &DonorInfo,
        amount: &Money,
        is_anonymous: bool,
    ) -> BillingResult<DonationReceipt> {
        validate_amount(amount)?;

        // Anonymous donors keep their user link for the feed but their name
        // and email never reach the receipt.
        let donor = if is_anonymous {
            DonorInfo {
                user_id: donor.user_id.clone(),
                name: None,
                email: None,
            }
        } else {
            donor.clone()
        };

        let receipt = self
            .store
            .insert_receipt(&ReceiptDraft {
                payment_event_id,
                donor,
                is_anonymous,
                amount: amount.clone(),
            })
            .await?;

        tracing::info!(
            payment_event_id = %payment_event_id,
            receipt_number = %receipt.receipt_number,
            anonymous = is_anonymous,
            amount = %amount,
            "Donation receipt generated"
        );

        Ok(receipt)
    }
}

fn validate_amount(amount: &Money) -> BillingResult<()> {
    if amount.minor <= 0 {
        return Err(BillingError::MalformedPayload(format!(
            "document amount must be positive, got {}",
            amount.minor
        )));
    }
    if amount.currency.trim().is_empty() {
        return Err(BillingError::MalformedPayload(
            "document currency is empty".into(),
        ));
    }
    Ok(())
}

/// Postgres-backed document store
#[derive(Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn next_number(&self, sequence: &str, prefix: &str) -> BillingResult<String> {
        let (n,): (i64,) = sqlx::query_as("SELECT nextval($1::regclass)")
            .bind(sequence)
            .fetch_one(&self.pool)
            .await?;
        Ok(document_number(
            prefix,
            OffsetDateTime::now_utc().year(),
            n,
        ))
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn insert_invoice(&self, draft: &InvoiceDraft) -> BillingResult<ServiceInvoice> {
        // Sequence values consumed by a losing insert leave gaps in numbering.
        let number = self
            .next_number("service_invoice_number_seq", INVOICE_PREFIX)
            .await?;

        let inserted: Option<ServiceInvoice> = sqlx::query_as(
            r#"
            INSERT INTO service_invoices
                (id, payment_event_id, invoice_number, user_id, payer_name, payer_email,
                 plan_tier, plan_name, plan_duration_days, amount, currency, issued_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())
            ON CONFLICT (payment_event_id) DO NOTHING
            RETURNING id, payment_event_id, invoice_number, user_id, payer_name, payer_email,
                      plan_tier, plan_name, plan_duration_days, amount, currency, issued_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(draft.payment_event_id)
        .bind(&number)
        .bind(&draft.payer.user_id)
        .bind(&draft.payer.name)
        .bind(&draft.payer.email)
        .bind(&draft.plan.tier)
        .bind(&draft.plan.name)
        .bind(draft.plan.duration_days)
        .bind(draft.amount.minor)
        .bind(&draft.amount.currency)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(invoice) => Ok(invoice),
            None => {
                tracing::info!(
                    payment_event_id = %draft.payment_event_id,
                    "Invoice already exists for payment event, returning existing"
                );
                self.find_invoice(draft.payment_event_id)
                    .await?
                    .ok_or_else(|| {
                        BillingError::Internal(format!(
                            "invoice conflict for {} but no existing invoice",
                            draft.payment_event_id
                        ))
                    })
            }
        }
    }

    async fn insert_receipt(&self, draft: &ReceiptDraft) -> BillingResult<DonationReceipt> {
        let number = self
            .next_number("donation_receipt_number_seq", RECEIPT_PREFIX)
            .await?;

        let inserted: Option<DonationReceipt> = sqlx::query_as(
            r#"
            INSERT INTO donation_receipts
                (id, payment_event_id, receipt_number, donor_name, donor_email,
                 is_anonymous, amount, currency, issued_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            ON CONFLICT (payment_event_id) DO NOTHING
            RETURNING id, payment_event_id, receipt_number, donor_name, donor_email,
                      is_anonymous, amount, currency, issued_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(draft.payment_event_id)
        .bind(&number)
        .bind(&draft.donor.name)
        .bind(&draft.donor.email)
        .bind(draft.is_anonymous)
        .bind(draft.amount.minor)
        .bind(&draft.amount.currency)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(receipt) => Ok(receipt),
            None => {
                tracing::info!(
                    payment_event_id = %draft.payment_event_id,
                    "Receipt already exists for payment event, returning existing"
                );
                self.find_receipt(draft.payment_event_id)
                    .await?
                    .ok_or_else(|| {
                        BillingError::Internal(format!(
                            "receipt conflict for {} but no existing receipt",
                            draft.payment_event_id
                        ))
                    })
            }
        }
    }

    async fn find_invoice(&self, payment_event_id: Uuid) -> BillingResult<Option<ServiceInvoice>> {
        Ok(sqlx::query_as(
            r#"
            SELECT id, payment_event_id, invoice_number, user_id, payer_name, payer_email,
                   plan_tier, plan_name, plan_duration_days, amount, currency, issued_at
            FROM service_invoices
            WHERE payment_event_id = $1
            "#,
        )
        .bind(payment_event_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn find_receipt(
        &self,
        payment_event_id: Uuid,
    ) -> BillingResult<Option<DonationReceipt>> {
        Ok(sqlx::query_as(
            r#"
            SELECT id, payment_event_id, receipt_number, donor_name, donor_email,
                   is_anonymous, amount, currency, issued_at
            FROM donation_receipts
            WHERE payment_event_id = $1
            "#,
        )
        .bind(payment_event_id)
        .fetch_optional(&self.pool)
        .await?)
    }
}
