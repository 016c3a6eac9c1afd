//! Razorpay webhook handling
//!
//! Verifies, records and completes `payment.captured` deliveries:
//!
//! 1. verify the HMAC over the raw body
//! 2. acknowledge anything other than `payment.captured` without persisting
//! 3. record the event (the only idempotency boundary)
//! 4. skip document work when a redelivered event already finished it
//! 5. run the [`DocumentPipeline`]
//!
//! There is no retry loop in here. A returned error becomes a 500 and Razorpay
//! redelivers; the reconciler re-drives events left `pending`.

use std::sync::Arc;

use serde::Serialize;

use crate::error::BillingResult;
use crate::idempotency::{DocumentStatus, NewPaymentEvent};
use crate::payload::WebhookEnvelope;
use crate::pipeline::DocumentPipeline;
use crate::reporting::ReportContext;
use crate::signature::SignatureVerifier;

/// One inbound HTTP delivery, as received
#[derive(Debug, Clone, Copy)]
pub struct WebhookDelivery<'a> {
    pub body: &'a [u8],
    pub signature: Option<&'a str>,
    pub event_id_header: Option<&'a str>,
}

/// What happened to a verified delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// Event type this service does not act on
    Ignored { event_type: String },
    /// Event already recorded and its document work already finished
    Duplicate {
        event_id: String,
        document_status: DocumentStatus,
    },
    /// Document work ran in this delivery
    Processed {
        event_id: String,
        newly_recorded: bool,
        document_status: DocumentStatus,
        document_number: Option<String>,
    },
}

/// Webhook handler for Razorpay payment events
pub struct WebhookHandler {
    verifier: SignatureVerifier,
    pipeline: Arc<DocumentPipeline>,
}

impl WebhookHandler {
    pub fn new(verifier: SignatureVerifier, pipeline: Arc<DocumentPipeline>) -> Self {
        Self { verifier, pipeline }
    }

    pub fn pipeline(&self) -> &Arc<DocumentPipeline> {
        &self.pipeline
    }

    /// Handle one delivery end to end.
    ///
    /// Every error is reported to the error tracker, tagged with whatever
    /// event and payment ids were known at the point of failure, before it is
    /// returned.
    pub async fn handle(&self, delivery: WebhookDelivery<'_>) -> BillingResult<WebhookOutcome> {
        let mut ctx = ReportContext::new();
        let result = self.handle_inner(delivery, &mut ctx).await;
        if let Err(e) = &result {
            self.pipeline.reporter().capture(e, &ctx);
        }
        result
    }

    async fn handle_inner(
        &self,
        delivery: WebhookDelivery<'_>,
        ctx: &mut ReportContext,
    ) -> BillingResult<WebhookOutcome> {
        // The raw bytes are verified before anything is parsed.
        self.verifier.verify(delivery.body, delivery.signature)?;

        let envelope = WebhookEnvelope::parse(delivery.body)?;
        ctx.insert("event_type", envelope.event.clone());

        if !envelope.is_payment_captured() {
            tracing::info!(
                event_type = %envelope.event,
                event_id = ?envelope.id,
                "Ignoring Razorpay event type - acknowledged without processing"
            );
            return Ok(WebhookOutcome::Ignored {
                event_type: envelope.event,
            });
        }

        let event_id = envelope.event_id(delivery.event_id_header)?;
        ctx.insert("event_id", event_id.clone());

        let entity = envelope.payment_entity()?;
        ctx.insert("payment_id", entity.id.clone());
        self.pipeline
            .reporter()
            .breadcrumb("payment.captured received", ctx);

        let outcome = self
            .pipeline
            .events()
            .record_if_new(&NewPaymentEvent::from_entity(
                &event_id,
                &envelope.event,
                &entity,
            ))
            .await?;

        let newly_recorded = outcome.is_new();
        let event = outcome.into_event();

        if !newly_recorded && !event.document_status.needs_documents() {
            tracing::info!(
                event_id = %event_id,
                document_status = event.document_status.as_str(),
                "Duplicate webhook event - documents already handled"
            );
            return Ok(WebhookOutcome::Duplicate {
                event_id,
                document_status: event.document_status,
            });
        }

        if !newly_recorded {
            tracing::info!(
                event_id = %event_id,
                "Redelivered event still pending - resuming document generation"
            );
        }

        let pass = self.pipeline.complete(&event, ctx).await?;

        tracing::info!(
            event_id = %event_id,
            payment_id = %event.payment_id,
            amount = event.amount,
            document_status = pass.status.as_str(),
            "Payment captured webhook processed"
        );

        Ok(WebhookOutcome::Processed {
            event_id,
            newly_recorded,
            document_status: pass.status,
            document_number: pass.document.map(|d| d.number().to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityKind, ActivityLogger};
    use crate::documents::DocumentGenerator;
    use crate::error::BillingError;
    use crate::memory::{
        InMemoryActivitySink, InMemoryDocumentStore, InMemoryOrderLedger,
        InMemoryPaymentEventStore, RecordingReporter,
    };
    use crate::orders::{NewOrder, OrderLedger};
    use crate::payload::PurposeKind;
    use crate::pipeline::{PipelineConfig, PipelineDeps};
    use serde_json::json;

    const SECRET: &str = "razorpay_webhook_secret";

    struct Harness {
        handler: WebhookHandler,
        verifier: SignatureVerifier,
        events: Arc<InMemoryPaymentEventStore>,
        documents: Arc<InMemoryDocumentStore>,
        orders: Arc<InMemoryOrderLedger>,
        activity: Arc<InMemoryActivitySink>,
        reporter: Arc<RecordingReporter>,
    }

    fn harness(config: PipelineConfig) -> Harness {
        let verifier = SignatureVerifier::new(SECRET).unwrap();
        let events = Arc::new(InMemoryPaymentEventStore::new());
        let documents = Arc::new(InMemoryDocumentStore::new());
        let orders = Arc::new(InMemoryOrderLedger::new());
        let activity = Arc::new(InMemoryActivitySink::new());
        let reporter = Arc::new(RecordingReporter::new());

        let pipeline = DocumentPipeline::new(
            PipelineDeps {
                events: events.clone(),
                documents: DocumentGenerator::new(documents.clone()),
                orders: orders.clone(),
                activity: ActivityLogger::new(activity.clone()),
                reporter: reporter.clone(),
            },
            config,
        );

        Harness {
            handler: WebhookHandler::new(verifier.clone(), Arc::new(pipeline)),
            verifier,
            events,
            documents,
            orders,
            activity,
            reporter,
        }
    }

    fn captured(event_id: &str, amount: i64, notes: serde_json::Value) -> Vec<u8> {
        json!({
            "id": event_id,
            "event": "payment.captured",
            "payload": {"payment": {"entity": {
                "id": format!("pay_{}", event_id),
                "order_id": format!("order_{}", event_id),
                "amount": amount,
                "currency": "INR",
                "status": "captured",
                "notes": notes
            }}}
        })
        .to_string()
        .into_bytes()
    }

    fn service_notes() -> serde_json::Value {
        json!({"type": "service", "user_id": "u_1", "plan_tier": "premium"})
    }

    impl Harness {
        async fn deliver(&self, body: &[u8]) -> BillingResult<WebhookOutcome> {
            let sig = self.verifier.sign(body).unwrap();
            self.handler
                .handle(WebhookDelivery {
                    body,
                    signature: Some(&sig),
                    event_id_header: None,
                })
                .await
        }
    }

    #[tokio::test]
    async fn test_service_payment_generates_one_invoice() {
        let h = harness(PipelineConfig::default());
        let outcome = h
            .deliver(&captured("evt_a", 9900, service_notes()))
            .await
            .unwrap();

        match outcome {
            WebhookOutcome::Processed {
                newly_recorded,
                document_status,
                document_number,
                ..
            } => {
                assert!(newly_recorded);
                assert_eq!(document_status, DocumentStatus::Generated);
                assert!(document_number.unwrap().starts_with("XAI-INV-"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let events = h.events.all().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].amount, 9900);
        let invoices = h.documents.invoices().await;
        assert_eq!(invoices.len(), 1);
        assert_eq!(invoices[0].payment_event_id, events[0].id);
        assert_eq!(h.documents.receipt_count().await, 0);

        let feed = h.activity.entries().await;
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].kind, ActivityKind::PlanActivated);
    }

    #[tokio::test]
    async fn test_redelivery_after_clean_run_is_duplicate() {
        let h = harness(PipelineConfig::default());
        let body = captured("evt_b", 9900, service_notes());

        h.deliver(&body).await.unwrap();
        let second = h.deliver(&body).await.unwrap();

        assert_eq!(
            second,
            WebhookOutcome::Duplicate {
                event_id: "evt_b".into(),
                document_status: DocumentStatus::Generated,
            }
        );
        assert_eq!(h.events.count().await, 1);
        assert_eq!(h.documents.invoice_count().await, 1);
        assert_eq!(h.activity.entries().await.len(), 1);
    }

    #[tokio::test]
    async fn test_redelivery_after_failed_generation_completes_once() {
        let h = harness(PipelineConfig::default());
        let body = captured("evt_c", 50000, json!({"type": "donation", "donor_name": "Asha"}));

        h.documents.fail_next(1);
        let first = h.deliver(&body).await;
        assert!(matches!(first, Err(BillingError::Database(_))));
        assert_eq!(h.events.count().await, 1, "event row survives the failure");
        assert_eq!(
            h.events.all().await[0].document_status,
            DocumentStatus::Pending
        );

        let second = h.deliver(&body).await.unwrap();
        assert!(matches!(
            second,
            WebhookOutcome::Processed {
                newly_recorded: false,
                document_status: DocumentStatus::Generated,
                ..
            }
        ));
        assert_eq!(h.events.count().await, 1);
        assert_eq!(h.documents.receipt_count().await, 1);
    }

    #[tokio::test]
    async fn test_non_captured_event_is_ignored_without_persistence() {
        let h = harness(PipelineConfig::default());
        let body = json!({"id": "evt_f", "event": "payment.failed", "payload": {}})
            .to_string()
            .into_bytes();

        let outcome = h.deliver(&body).await.unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::Ignored {
                event_type: "payment.failed".into()
            }
        );
        assert_eq!(h.events.count().await, 0);
        assert!(h.activity.entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_bad_signature_rejected_before_persistence() {
        let h = harness(PipelineConfig::default());
        let body = captured("evt_d", 9900, service_notes());
        let mut sig = h.verifier.sign(&body).unwrap();
        let replacement = if sig.starts_with('a') { "b" } else { "a" };
        sig.replace_range(0..1, replacement);

        let result = h
            .handler
            .handle(WebhookDelivery {
                body: &body,
                signature: Some(&sig),
                event_id_header: None,
            })
            .await;

        assert!(matches!(result, Err(BillingError::SignatureInvalid)));
        assert_eq!(h.events.count().await, 0);
        assert_eq!(h.documents.invoice_count().await, 0);
        assert_eq!(h.reporter.reports().len(), 1);
    }

    #[tokio::test]
    async fn test_unrecognized_purpose_records_event_without_document() {
        let h = harness(PipelineConfig::default());
        let outcome = h
            .deliver(&captured("evt_e", 9900, json!({"type": "gift"})))
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            WebhookOutcome::Processed {
                document_status: DocumentStatus::Skipped,
                document_number: None,
                ..
            }
        ));
        assert_eq!(h.events.count().await, 1);
        assert_eq!(h.documents.invoice_count().await, 0);
        assert_eq!(h.documents.receipt_count().await, 0);

        let reports = h.reporter.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, "unrecognized_purpose");
        assert_eq!(
            reports[0].tags.get("event_id").map(String::as_str),
            Some("evt_e")
        );
    }

    #[tokio::test]
    async fn test_amount_mismatch_flags_event() {
        let h = harness(PipelineConfig::default());
        h.orders
            .record_order(&NewOrder {
                order_id: "order_evt_g".into(),
                purpose: PurposeKind::Service,
                amount: 9900,
                currency: "INR".into(),
            })
            .await
            .unwrap();

        let outcome = h
            .deliver(&captured("evt_g", 100, service_notes()))
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            WebhookOutcome::Processed {
                document_status: DocumentStatus::Flagged,
                ..
            }
        ));
        assert_eq!(h.documents.invoice_count().await, 0);
        assert_eq!(h.reporter.reports()[0].kind, "amount_mismatch");
        assert_eq!(
            h.activity.entries().await[0].kind,
            ActivityKind::PaymentAmountMismatch
        );
    }

    #[tokio::test]
    async fn test_strict_mode_flags_unknown_order() {
        let h = harness(PipelineConfig {
            require_order_match: true,
        });
        h.deliver(&captured("evt_h", 9900, service_notes()))
            .await
            .unwrap();
        assert_eq!(
            h.events.all().await[0].document_status,
            DocumentStatus::Flagged
        );
    }

    #[tokio::test]
    async fn test_store_outage_is_fatal_and_reported() {
        let h = harness(PipelineConfig::default());
        h.events.set_unavailable(true);

        let result = h.deliver(&captured("evt_i", 9900, service_notes())).await;
        assert!(matches!(result, Err(BillingError::Database(_))));
        assert_eq!(
            h.reporter.reports()[0]
                .tags
                .get("payment_id")
                .map(String::as_str),
            Some("pay_evt_i")
        );
    }

    #[tokio::test]
    async fn test_activity_failure_does_not_fail_webhook() {
        let h = harness(PipelineConfig::default());
        h.activity.set_unavailable(true);

        let outcome = h
            .deliver(&captured("evt_j", 9900, service_notes()))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            WebhookOutcome::Processed {
                document_status: DocumentStatus::Generated,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_event_id_falls_back_to_header() {
        let h = harness(PipelineConfig::default());
        let body = json!({
            "event": "payment.captured",
            "payload": {"payment": {"entity": {
                "id": "pay_hdr", "amount": 9900, "currency": "INR",
                "status": "captured", "notes": service_notes()
            }}}
        })
        .to_string()
        .into_bytes();
        let sig = h.verifier.sign(&body).unwrap();

        let outcome = h
            .handler
            .handle(WebhookDelivery {
                body: &body,
                signature: Some(&sig),
                event_id_header: Some("evt_from_header"),
            })
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            WebhookOutcome::Processed { ref event_id, .. } if event_id == "evt_from_header"
        ));
    }
}
