//! Razorpay webhook endpoint
//!
//! The body is taken as raw bytes: the signature covers the exact bytes
//! Razorpay sent, so nothing may parse or re-serialize it first.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use xainik_billing::{WebhookDelivery, WebhookOutcome, EVENT_ID_HEADER, SIGNATURE_HEADER};

use crate::{error::ApiError, state::AppState};

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `POST /api/webhooks/razorpay`
pub async fn razorpay_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let delivery = WebhookDelivery {
        body: &body,
        signature: header_str(&headers, SIGNATURE_HEADER),
        event_id_header: header_str(&headers, EVENT_ID_HEADER),
    };

    match state.webhooks.handle(delivery).await {
        Ok(outcome) => {
            let message = match outcome {
                WebhookOutcome::Ignored { .. } => "ignored",
                WebhookOutcome::Duplicate { .. } => "duplicate",
                WebhookOutcome::Processed { .. } => "ok",
            };
            (StatusCode::OK, message).into_response()
        }
        Err(e) => {
            let error = ApiError::from(e);
            if error.status().is_server_error() {
                tracing::error!(error = %error, "Razorpay webhook failed");
            } else {
                tracing::warn!(error = %error, "Razorpay webhook rejected");
            }
            error.into_plain_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{body::Body, http::Request, Router};
    use hmac::{Hmac, Mac};
    use serde_json::json;
    use sha2::Sha256;
    use tower::ServiceExt;
    use xainik_billing::memory::{
        InMemoryActivitySink, InMemoryDocumentStore, InMemoryOrderLedger,
        InMemoryPaymentEventStore, RecordingReporter,
    };
    use xainik_billing::{
        ActivityLogger, DocumentGenerator, DocumentPipeline, PipelineConfig, PipelineDeps,
    };

    use super::*;
    use crate::config::Config;
    use crate::routes::create_router;

    const SECRET: &str = "whsec_route_tests";

    struct TestApp {
        router: Router,
        events: Arc<InMemoryPaymentEventStore>,
        documents: Arc<InMemoryDocumentStore>,
    }

    fn config() -> Config {
        Config {
            database_url: "postgres://unused".into(),
            database_max_connections: 1,
            razorpay_webhook_secret: SECRET.into(),
            bind_address: "127.0.0.1:0".into(),
            admin_api_token: None,
            alert_webhook_url: None,
            require_order_match: false,
            run_migrations: false,
        }
    }

    fn test_app() -> TestApp {
        let events = Arc::new(InMemoryPaymentEventStore::new());
        let documents = Arc::new(InMemoryDocumentStore::new());
        let pipeline = DocumentPipeline::new(
            PipelineDeps {
                events: events.clone(),
                documents: DocumentGenerator::new(documents.clone()),
                orders: Arc::new(InMemoryOrderLedger::new()),
                activity: ActivityLogger::new(Arc::new(InMemoryActivitySink::new())),
                reporter: Arc::new(RecordingReporter::new()),
            },
            PipelineConfig::default(),
        );
        let state = AppState::with_pipeline(config(), Arc::new(pipeline)).unwrap();

        TestApp {
            router: create_router(state),
            events,
            documents,
        }
    }

    fn sign(body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    fn payment(event: &str, event_id: &str, notes: serde_json::Value) -> Vec<u8> {
        json!({
            "id": event_id,
            "event": event,
            "payload": {"payment": {"entity": {
                "id": "pay_route",
                "order_id": "order_route",
                "amount": 9900,
                "currency": "INR",
                "status": "captured",
                "notes": notes
            }}}
        })
        .to_string()
        .into_bytes()
    }

    async fn post(app: &TestApp, body: Vec<u8>, signature: Option<String>) -> (StatusCode, String) {
        let mut request = Request::builder()
            .method("POST")
            .uri("/api/webhooks/razorpay")
            .header("content-type", "application/json");
        if let Some(sig) = signature {
            request = request.header(SIGNATURE_HEADER, sig);
        }

        let response = app
            .router
            .clone()
            .oneshot(request.body(Body::from(body)).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    fn service() -> serde_json::Value {
        json!({"type": "service", "user_id": "u_1", "plan_tier": "premium"})
    }

    #[tokio::test]
    async fn test_captured_service_payment_returns_200_and_one_invoice() {
        let app = test_app();
        let body = payment("payment.captured", "evt_route_a", service());
        let sig = sign(&body);

        let (status, text) = post(&app, body, Some(sig)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(text, "ok");

        let events = app.events.all().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].amount, 9900);
        assert_eq!(app.documents.invoice_count().await, 1);
    }

    #[tokio::test]
    async fn test_redelivery_returns_200_without_second_invoice() {
        let app = test_app();
        let body = payment("payment.captured", "evt_route_b", service());
        let sig = sign(&body);

        post(&app, body.clone(), Some(sig.clone())).await;
        let (status, text) = post(&app, body, Some(sig)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(text, "duplicate");
        assert_eq!(app.events.count().await, 1);
        assert_eq!(app.documents.invoice_count().await, 1);
    }

    #[tokio::test]
    async fn test_failed_payment_returns_200_without_rows() {
        let app = test_app();
        let body = payment("payment.failed", "evt_route_c", service());
        let sig = sign(&body);

        let (status, _) = post(&app, body, Some(sig)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(app.events.count().await, 0);
    }

    #[tokio::test]
    async fn test_tampered_signature_returns_400_without_rows() {
        let app = test_app();
        let body = payment("payment.captured", "evt_route_d", service());
        let sig = sign(b"some other body");

        let (status, _) = post(&app, body, Some(sig)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(app.events.count().await, 0);
        assert_eq!(app.documents.invoice_count().await, 0);
    }

    #[tokio::test]
    async fn test_missing_signature_returns_400() {
        let app = test_app();
        let body = payment("payment.captured", "evt_route_m", service());

        let (status, _) = post(&app, body, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(app.events.count().await, 0);
    }

    #[tokio::test]
    async fn test_unrecognized_purpose_records_event_without_documents() {
        let app = test_app();
        let body = payment("payment.captured", "evt_route_e", json!({"type": "gift"}));
        let sig = sign(&body);

        let (status, _) = post(&app, body, Some(sig)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(app.events.count().await, 1);
        assert_eq!(app.documents.invoice_count().await, 0);
        assert_eq!(app.documents.receipt_count().await, 0);
    }

    #[tokio::test]
    async fn test_storage_failure_returns_500_plain_text() {
        let app = test_app();
        app.events.set_unavailable(true);
        let body = payment("payment.captured", "evt_route_f", service());
        let sig = sign(&body);

        let (status, text) = post(&app, body, Some(sig)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!text.contains("payment_events"), "internal detail leaked: {}", text);
    }

    #[tokio::test]
    async fn test_health_without_database() {
        let app = test_app();
        let response = app
            .router
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["database"], "not_configured");
    }
}
