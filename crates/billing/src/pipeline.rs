//! Document pipeline
//!
//! Everything that happens to a payment event after it has been recorded:
//! the amount cross-check, invoice or receipt generation, and the activity
//! entry. The webhook handler runs it inline; the reconciler re-runs it for
//! events a failed delivery left `pending`.

use std::sync::Arc;

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::activity::{ActivityEntryBuilder, ActivityKind, ActivityLogger, PgActivitySink};
use crate::documents::{DocumentGenerator, GeneratedDocument, Money, PgDocumentStore};
use crate::error::{BillingError, BillingResult};
use crate::idempotency::{DocumentStatus, PaymentEvent, PaymentEventStore, PgPaymentEventStore};
use crate::orders::{verify_amount, OrderLedger, PgOrderLedger};
use crate::payload::PaymentPurpose;
use crate::reporting::{ErrorReporter, ReportContext};

#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    /// Treat a captured payment with no local order as an amount mismatch
    pub require_order_match: bool,
}

/// Collaborators the pipeline is built from
pub struct PipelineDeps {
    pub events: Arc<dyn PaymentEventStore>,
    pub documents: DocumentGenerator,
    pub orders: Arc<dyn OrderLedger>,
    pub activity: ActivityLogger,
    pub reporter: Arc<dyn ErrorReporter>,
}

impl PipelineDeps {
    /// Every store backed by Postgres
    pub fn postgres(pool: PgPool, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            events: Arc::new(PgPaymentEventStore::new(pool.clone())),
            documents: DocumentGenerator::new(Arc::new(PgDocumentStore::new(pool.clone()))),
            orders: Arc::new(PgOrderLedger::new(pool.clone())),
            activity: ActivityLogger::new(Arc::new(PgActivitySink::new(pool))),
            reporter,
        }
    }
}

/// Result of one document pass over a recorded event
#[derive(Debug, Clone)]
pub struct DocumentPass {
    pub status: DocumentStatus,
    pub document: Option<GeneratedDocument>,
}

/// Result of re-driving an event outside the webhook request
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileResult {
    pub payment_event_id: Uuid,
    pub provider_event_id: String,
    pub previous_status: DocumentStatus,
    pub new_status: DocumentStatus,
    pub document_number: Option<String>,
    pub error: Option<String>,
    pub success: bool,
}

impl ReconcileResult {
    fn unchanged(event: &PaymentEvent, error: Option<String>) -> Self {
        Self {
            payment_event_id: event.id,
            provider_event_id: event.provider_event_id.clone(),
            previous_status: event.document_status,
            new_status: event.document_status,
            document_number: None,
            success: error.is_none(),
            error,
        }
    }
}

pub struct DocumentPipeline {
    events: Arc<dyn PaymentEventStore>,
    documents: DocumentGenerator,
    orders: Arc<dyn OrderLedger>,
    activity: ActivityLogger,
    reporter: Arc<dyn ErrorReporter>,
    config: PipelineConfig,
}

impl DocumentPipeline {
    pub fn new(deps: PipelineDeps, config: PipelineConfig) -> Self {
        Self {
            events: deps.events,
            documents: deps.documents,
            orders: deps.orders,
            activity: deps.activity,
            reporter: deps.reporter,
            config,
        }
    }

    pub fn postgres(
        pool: PgPool,
        reporter: Arc<dyn ErrorReporter>,
        config: PipelineConfig,
    ) -> Self {
        Self::new(PipelineDeps::postgres(pool, reporter), config)
    }

    pub fn events(&self) -> &Arc<dyn PaymentEventStore> {
        &self.events
    }

    pub fn reporter(&self) -> &Arc<dyn ErrorReporter> {
        &self.reporter
    }

    /// Amount check, document generation and activity logging for one
    /// recorded event.
    ///
    /// Input problems (mismatched amount, unusable notes) settle the event as
    /// `flagged` or `skipped` and return `Ok`. Infrastructure failures return
    /// `Err` and leave the event `pending`.
    pub async fn complete(
        &self,
        event: &PaymentEvent,
        ctx: &ReportContext,
    ) -> BillingResult<DocumentPass> {
        match verify_amount(
            self.orders.as_ref(),
            event,
            self.config.require_order_match,
        )
        .await
        {
            Ok(_) => {}
            Err(e @ (BillingError::AmountMismatch { .. } | BillingError::OrderNotFound(_))) => {
                return self.flag(event, &e, ctx).await;
            }
            Err(e) => return Err(e),
        }

        let purpose = match PaymentPurpose::from_notes(&event.notes) {
            Ok(purpose) => purpose,
            Err(e) if e.is_permanent() => return self.skip(event, &e, ctx).await,
            Err(e) => return Err(e),
        };

        let amount = Money::new(event.amount, event.currency.clone());
        let generated = match &purpose {
            PaymentPurpose::Service { payer, plan } => self
                .documents
                .generate_invoice(event.id, payer, plan, &amount)
                .await
                .map(GeneratedDocument::Invoice),
            PaymentPurpose::Donation {
                donor,
                is_anonymous,
            } => self
                .documents
                .generate_receipt(event.id, donor, &amount, *is_anonymous)
                .await
                .map(GeneratedDocument::Receipt),
        };

        // A permanent failure gets only the unclassified entry from `skip`.
        if let Err(e) = &generated {
            if e.is_permanent() {
                return self.skip(event, e, ctx).await;
            }
        }

        // Otherwise the feed entry is written whether or not generation succeeded.
        self.activity
            .append(activity_for(&purpose, event, generated.as_ref().ok()))
            .await;

        let document = match generated {
            Ok(document) => document,
            Err(e) => {
                tracing::error!(
                    event_id = %event.provider_event_id,
                    error = %e,
                    "Document generation failed - event left pending"
                );
                return Err(e);
            }
        };

        self.events
            .mark_document_status(event.id, DocumentStatus::Generated, Some(document.number()))
            .await?;

        Ok(DocumentPass {
            status: DocumentStatus::Generated,
            document: Some(document),
        })
    }

    async fn flag(
        &self,
        event: &PaymentEvent,
        reason: &BillingError,
        ctx: &ReportContext,
    ) -> BillingResult<DocumentPass> {
        tracing::error!(
            event_id = %event.provider_event_id,
            error = %reason,
            "Webhook amount failed cross-check - holding documents for review"
        );
        self.reporter.capture(reason, ctx);
        self.events
            .mark_document_status(event.id, DocumentStatus::Flagged, Some(&reason.to_string()))
            .await?;
        self.activity
            .append(
                ActivityEntryBuilder::new(ActivityKind::PaymentAmountMismatch)
                    .payment(&event.provider_event_id, &event.payment_id)
                    .field("amount", event.amount)
                    .field("currency", event.currency.clone())
                    .field("detail", reason.to_string()),
            )
            .await;
        Ok(DocumentPass {
            status: DocumentStatus::Flagged,
            document: None,
        })
    }

    async fn skip(
        &self,
        event: &PaymentEvent,
        reason: &BillingError,
        ctx: &ReportContext,
    ) -> BillingResult<DocumentPass> {
        tracing::warn!(
            event_id = %event.provider_event_id,
            reason = %reason,
            "Captured payment has no usable purpose - no document generated"
        );
        self.reporter.capture(reason, ctx);
        self.events
            .mark_document_status(event.id, DocumentStatus::Skipped, Some(&reason.to_string()))
            .await?;
        self.activity
            .append(
                ActivityEntryBuilder::new(ActivityKind::PaymentCapturedUnclassified)
                    .payment(&event.provider_event_id, &event.payment_id)
                    .field("amount", event.amount)
                    .field("currency", event.currency.clone())
                    .field("reason", reason.to_string()),
            )
            .await;
        Ok(DocumentPass {
            status: DocumentStatus::Skipped,
            document: None,
        })
    }

    /// Events whose documents are still pending
    pub async fn pending_events(
        &self,
        older_than: time::Duration,
        limit: i64,
    ) -> BillingResult<Vec<PaymentEvent>> {
        self.events
            .list_pending(OffsetDateTime::now_utc() - older_than, limit)
            .await
    }

    /// Re-drive document generation for one recorded event.
    ///
    /// `pending` and `flagged` events are re-run (a flagged event passes once
    /// its local order has been corrected). Other statuses are returned as-is.
    pub async fn reconcile_event(&self, provider_event_id: &str) -> BillingResult<ReconcileResult> {
        let event = self
            .events
            .find_by_event_id(provider_event_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("payment event {}", provider_event_id))
            })?;

        if !matches!(
            event.document_status,
            DocumentStatus::Pending | DocumentStatus::Flagged
        ) {
            return Ok(ReconcileResult::unchanged(&event, None));
        }

        let ctx = ReportContext::new()
            .tag("event_id", event.provider_event_id.clone())
            .tag("payment_id", event.payment_id.clone())
            .tag("source", "reconciler");

        let reconciled = match self.complete(&event, &ctx).await {
            Ok(pass) => ReconcileResult {
                payment_event_id: event.id,
                provider_event_id: event.provider_event_id.clone(),
                previous_status: event.document_status,
                new_status: pass.status,
                document_number: pass.document.map(|d| d.number().to_string()),
                error: None,
                success: true,
            },
            Err(e) => {
                self.reporter.capture(&e, &ctx);
                ReconcileResult::unchanged(&event, Some(e.to_string()))
            }
        };

        tracing::info!(
            event_id = %reconciled.provider_event_id,
            previous_status = reconciled.previous_status.as_str(),
            new_status = reconciled.new_status.as_str(),
            success = reconciled.success,
            "Payment event reconciled"
        );

        Ok(reconciled)
    }

    /// Re-drive every event left `pending` for longer than `older_than`.
    /// Flagged events need a corrected order first and go through
    /// `reconcile_event`.
    pub async fn reconcile_pending(
        &self,
        older_than: time::Duration,
        limit: i64,
    ) -> BillingResult<Vec<ReconcileResult>> {
        let pending = self.pending_events(older_than, limit).await?;
        let mut results = Vec::with_capacity(pending.len());

        for event in pending {
            match self.reconcile_event(&event.provider_event_id).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(
                        event_id = %event.provider_event_id,
                        error = %e,
                        "Failed to reconcile payment event"
                    );
                    results.push(ReconcileResult::unchanged(&event, Some(e.to_string())));
                }
            }
        }

        Ok(results)
    }
}

fn activity_for(
    purpose: &PaymentPurpose,
    event: &PaymentEvent,
    document: Option<&GeneratedDocument>,
) -> ActivityEntryBuilder {
    let builder = match purpose {
        PaymentPurpose::Service { payer, plan } => {
            ActivityEntryBuilder::new(ActivityKind::PlanActivated)
                .field("user_id", payer.user_id.clone())
                .field("plan_tier", plan.tier.clone())
                .field_opt("plan_name", plan.name.clone())
                .field_opt("plan_duration_days", plan.duration_days)
        }
        PaymentPurpose::Donation {
            donor,
            is_anonymous,
        } => {
            let donor_name = if *is_anonymous {
                Some("Anonymous".to_string())
            } else {
                donor.name.clone()
            };
            ActivityEntryBuilder::new(ActivityKind::DonationReceived)
                .field("anonymous", *is_anonymous)
                .field_opt("donor_name", donor_name)
        }
    };

    builder
        .payment(&event.provider_event_id, &event.payment_id)
        .field("amount", event.amount)
        .field("currency", event.currency.clone())
        .field("document_generated", document.is_some())
        .field_opt("document_number", document.map(|d| d.number().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::NewPaymentEvent;
    use crate::memory::{
        InMemoryActivitySink, InMemoryDocumentStore, InMemoryOrderLedger,
        InMemoryPaymentEventStore, RecordingReporter,
    };
    use crate::orders::NewOrder;
    use crate::payload::{Notes, PurposeKind};

    struct Harness {
        pipeline: DocumentPipeline,
        events: Arc<InMemoryPaymentEventStore>,
        documents: Arc<InMemoryDocumentStore>,
        orders: Arc<InMemoryOrderLedger>,
        activity: Arc<InMemoryActivitySink>,
    }

    fn harness() -> Harness {
        let events = Arc::new(InMemoryPaymentEventStore::new());
        let documents = Arc::new(InMemoryDocumentStore::new());
        let orders = Arc::new(InMemoryOrderLedger::new());
        let activity = Arc::new(InMemoryActivitySink::new());

        let pipeline = DocumentPipeline::new(
            PipelineDeps {
                events: events.clone(),
                documents: DocumentGenerator::new(documents.clone()),
                orders: orders.clone(),
                activity: ActivityLogger::new(activity.clone()),
                reporter: Arc::new(RecordingReporter::new()),
            },
            PipelineConfig::default(),
        );

        Harness {
            pipeline,
            events,
            documents,
            orders,
            activity,
        }
    }

    async fn record(h: &Harness, id: &str, amount: i64, notes: Notes) -> PaymentEvent {
        h.events
            .record_if_new(&NewPaymentEvent {
                provider_event_id: id.into(),
                event_type: "payment.captured".into(),
                payment_id: format!("pay_{}", id),
                order_id: Some(format!("order_{}", id)),
                amount,
                currency: "INR".into(),
                status: "captured".into(),
                notes,
            })
            .await
            .unwrap()
            .into_event()
    }

    fn donation_notes(anonymous: bool) -> Notes {
        let mut notes = Notes::new();
        notes.insert("type", "donation");
        notes.insert("donor_name", "Asha Rao");
        notes.insert("donor_email", "asha@example.com");
        notes.insert("anonymous", anonymous);
        notes
    }

    #[tokio::test]
    async fn test_anonymous_donation_hides_donor_everywhere() {
        let h = harness();
        let event = record(&h, "evt_anon", 50000, donation_notes(true)).await;

        let pass = h.pipeline.complete(&event, &ReportContext::new()).await.unwrap();
        assert_eq!(pass.status, DocumentStatus::Generated);

        let receipts = h.documents.receipts().await;
        assert_eq!(receipts.len(), 1);
        assert!(receipts[0].is_anonymous);
        assert_eq!(receipts[0].donor_name, None);
        assert_eq!(receipts[0].donor_email, None);

        let feed = h.activity.entries().await;
        assert_eq!(feed[0].metadata["donor_name"], "Anonymous");
        assert_eq!(feed[0].metadata["document_generated"], true);
    }

    #[tokio::test]
    async fn test_activity_logged_even_when_generation_fails() {
        let h = harness();
        let event = record(&h, "evt_fail", 50000, donation_notes(false)).await;
        h.documents.fail_next(1);

        let result = h.pipeline.complete(&event, &ReportContext::new()).await;
        assert!(result.is_err());

        let feed = h.activity.entries().await;
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].metadata["document_generated"], false);
        assert_eq!(
            h.events.all().await[0].document_status,
            DocumentStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_zero_amount_is_skipped_not_retried() {
        let h = harness();
        let event = record(&h, "evt_zero", 0, donation_notes(false)).await;

        let pass = h.pipeline.complete(&event, &ReportContext::new()).await.unwrap();
        assert_eq!(pass.status, DocumentStatus::Skipped);
        assert_eq!(h.documents.receipt_count().await, 0);

        let feed = h.activity.entries().await;
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].kind, ActivityKind::PaymentCapturedUnclassified);
    }

    #[tokio::test]
    async fn test_zero_amount_service_payment_does_not_report_plan_activated() {
        let h = harness();
        let mut notes = Notes::new();
        notes.insert("type", "service");
        notes.insert("user_id", "u_1");
        notes.insert("plan_tier", "premium");
        let event = record(&h, "evt_zero_service", 0, notes).await;

        let pass = h.pipeline.complete(&event, &ReportContext::new()).await.unwrap();
        assert_eq!(pass.status, DocumentStatus::Skipped);
        assert_eq!(h.documents.invoice_count().await, 0);

        let kinds: Vec<ActivityKind> = h.activity.entries().await.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![ActivityKind::PaymentCapturedUnclassified]);
    }

    #[tokio::test]
    async fn test_flagged_event_stays_flagged_while_mismatched() {
        let h = harness();
        h.orders
            .record_order(&NewOrder {
                order_id: "order_evt_fix".into(),
                purpose: PurposeKind::Donation,
                amount: 40000,
                currency: "INR".into(),
            })
            .await
            .unwrap();
        let event = record(&h, "evt_fix", 50000, donation_notes(false)).await;

        let pass = h.pipeline.complete(&event, &ReportContext::new()).await.unwrap();
        assert_eq!(pass.status, DocumentStatus::Flagged);

        // Still mismatched: stays flagged.
        let result = h.pipeline.reconcile_event("evt_fix").await.unwrap();
        assert_eq!(result.previous_status, DocumentStatus::Flagged);
        assert_eq!(result.new_status, DocumentStatus::Flagged);
        assert_eq!(h.documents.receipt_count().await, 0);
    }

    #[tokio::test]
    async fn test_periodic_sweep_leaves_flagged_events_alone() {
        let h = harness();
        h.orders
            .record_order(&NewOrder {
                order_id: "order_evt_sweep".into(),
                purpose: PurposeKind::Donation,
                amount: 40000,
                currency: "INR".into(),
            })
            .await
            .unwrap();
        let event = record(&h, "evt_sweep", 50000, donation_notes(false)).await;
        h.pipeline.complete(&event, &ReportContext::new()).await.unwrap();
        h.events.backdate("evt_sweep", time::Duration::minutes(30)).await;

        let results = h
            .pipeline
            .reconcile_pending(time::Duration::minutes(10), 100)
            .await
            .unwrap();
        assert!(results.is_empty());

        h.orders.correct_amount("order_evt_sweep", 50000).await;
        let result = h.pipeline.reconcile_event("evt_sweep").await.unwrap();
        assert_eq!(result.new_status, DocumentStatus::Generated);
    }

    #[tokio::test]
    async fn test_skipped_event_is_not_rerun() {
        let h = harness();
        let event = record(&h, "evt_skip", 9900, Notes::new()).await;
        h.pipeline.complete(&event, &ReportContext::new()).await.unwrap();

        let result = h.pipeline.reconcile_event("evt_skip").await.unwrap();
        assert!(result.success);
        assert_eq!(result.new_status, DocumentStatus::Skipped);
        assert_eq!(h.activity.entries().await.len(), 1);
    }
}
