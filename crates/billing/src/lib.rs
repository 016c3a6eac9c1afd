// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError::AmountMismatch carries both amounts and currencies
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Xainik Billing Module
//!
//! Turns Razorpay `payment.captured` webhooks into billing records.
//!
//! ## Features
//!
//! - **Signature Verification**: HMAC-SHA256 over the raw body, constant-time compare
//! - **Idempotency**: one `payment_events` row per provider event id
//! - **Documents**: service invoices and donation receipts, at most one per event
//! - **Amount Cross-check**: captured amount compared with the locally recorded order
//! - **Activity Feed**: best-effort entries for dashboards
//! - **Error Reporting**: tagged captures to tracing and an optional alert webhook
//! - **Reconciliation**: re-drives events whose documents are still pending
//! - **Invariants**: read-only consistency checks over events and documents

pub mod activity;
pub mod documents;
pub mod error;
pub mod idempotency;
pub mod invariants;
pub mod memory;
pub mod orders;
pub mod payload;
pub mod pipeline;
pub mod reporting;
pub mod signature;
pub mod webhooks;


// Activity
pub use activity::{ActivityEntry, ActivityEntryBuilder, ActivityKind, ActivityLogger, ActivitySink};

// Documents
pub use documents::{
    DocumentGenerator, DocumentStore, DonationReceipt, GeneratedDocument, Money, ServiceInvoice,
};

// Error
pub use error::{BillingError, BillingResult};

// Idempotency
pub use idempotency::{DocumentStatus, PaymentEvent, PaymentEventStore, RecordOutcome};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Orders
pub use orders::{NewOrder, OrderLedger, OrderRecord};

// Payload
pub use payload::{PaymentPurpose, PurposeKind, EVENT_ID_HEADER};

// Pipeline
pub use pipeline::{DocumentPipeline, PipelineConfig, PipelineDeps, ReconcileResult};

// Reporting
pub use reporting::{AlertWebhookReporter, ErrorReporter, ReportContext, TracingReporter};

// Signature
pub use signature::{SignatureVerifier, SIGNATURE_HEADER};

// Webhooks
pub use webhooks::{WebhookDelivery, WebhookHandler, WebhookOutcome};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub pipeline: Arc<DocumentPipeline>,
    pub invariants: Arc<InvariantChecker>,
}

impl BillingService {
    /// Postgres-backed service
    pub fn new(pool: PgPool, reporter: Arc<dyn ErrorReporter>, config: PipelineConfig) -> Self {
        Self {
            pipeline: Arc::new(DocumentPipeline::postgres(pool.clone(), reporter, config)),
            invariants: Arc::new(InvariantChecker::new(pool)),
        }
    }

    /// Webhook front end sharing this service's pipeline
    pub fn webhook_handler(&self, verifier: SignatureVerifier) -> WebhookHandler {
        WebhookHandler::new(verifier, Arc::clone(&self.pipeline))
    }
}
