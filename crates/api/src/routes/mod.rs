//! HTTP routes

pub mod admin;
pub mod health;
pub mod webhooks;

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};

use crate::{auth::require_admin_token, state::AppState};

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route(
            "/payment-events/pending",
            get(admin::list_pending_events),
        )
        .route(
            "/payment-events/{event_id}/reconcile",
            post(admin::reconcile_event),
        )
        .route("/billing/invariants", get(admin::run_invariant_checks))
        .route_layer(from_fn_with_state(state.admin_auth(), require_admin_token));

    Router::new()
        .route("/health", get(health::health))
        .route("/api/webhooks/razorpay", post(webhooks::razorpay_webhook))
        .nest("/api/admin", admin_routes)
        .with_state(state)
}
