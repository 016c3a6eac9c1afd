//! Application state

use reqwest::Client;
use sqlx::PgPool;
use std::sync::Arc;

use xainik_billing::{
    AlertWebhookReporter, BillingService, DocumentPipeline, ErrorReporter, InvariantChecker,
    PipelineConfig, SignatureVerifier, TracingReporter, WebhookHandler,
};

use crate::auth::AdminAuth;
use crate::config::Config;
use crate::error::{ApiError, ApiResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Absent only when the state is assembled around in-memory stores
    pub pool: Option<PgPool>,
    pub config: Config,
    pub webhooks: Arc<WebhookHandler>,
    pub invariants: Option<Arc<InvariantChecker>>,
    pub http_client: Client,
}

/// Pick the error reporter for this deployment
pub fn build_reporter(config: &Config, http_client: &Client) -> Arc<dyn ErrorReporter> {
    match &config.alert_webhook_url {
        Some(url) => {
            tracing::info!("Error reporting to alert webhook enabled");
            Arc::new(AlertWebhookReporter::new(http_client.clone(), url.clone()))
        }
        None => {
            tracing::warn!("Error reporting to tracing only (missing ALERT_WEBHOOK_URL)");
            Arc::new(TracingReporter)
        }
    }
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, http_client: Client) -> ApiResult<Self> {
        let verifier = SignatureVerifier::new(config.razorpay_webhook_secret.clone())
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        let reporter = build_reporter(&config, &http_client);

        let billing = BillingService::new(
            pool.clone(),
            reporter,
            PipelineConfig {
                require_order_match: config.require_order_match,
            },
        );
        if config.require_order_match {
            tracing::info!("Strict order matching enabled (REQUIRE_ORDER_MATCH=true)");
        }

        if config.admin_api_token.is_none() {
            tracing::warn!("Admin routes disabled (missing ADMIN_API_TOKEN)");
        }

        Ok(Self {
            webhooks: Arc::new(billing.webhook_handler(verifier)),
            invariants: Some(billing.invariants),
            pool: Some(pool),
            config,
            http_client,
        })
    }

    /// State around an already-built pipeline, without a database pool
    pub fn with_pipeline(
        config: Config,
        pipeline: Arc<DocumentPipeline>,
    ) -> ApiResult<Self> {
        let verifier = SignatureVerifier::new(config.razorpay_webhook_secret.clone())
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        Ok(Self {
            pool: None,
            webhooks: Arc::new(WebhookHandler::new(verifier, pipeline)),
            invariants: None,
            config,
            http_client: Client::new(),
        })
    }

    /// Get admin auth state for middleware
    pub fn admin_auth(&self) -> AdminAuth {
        AdminAuth::new(self.config.admin_api_token.clone())
    }

    pub fn pipeline(&self) -> &Arc<DocumentPipeline> {
        self.webhooks.pipeline()
    }
}
