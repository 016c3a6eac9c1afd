//! Admin routes for payment operations
//!
//! Guarded by `require_admin_token`. Used by operators to inspect events a
//! failed delivery left behind and to re-drive their documents.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use xainik_billing::{InvariantCheckSummary, InvariantChecker, PaymentEvent, ReconcileResult};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const DEFAULT_OLDER_THAN_MINUTES: i64 = 10;
const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 500;

#[derive(Debug, Deserialize)]
pub struct PendingQuery {
    pub older_than_minutes: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct PendingEventsResponse {
    pub events: Vec<PaymentEvent>,
    pub count: usize,
}

/// `GET /api/admin/payment-events/pending`
pub async fn list_pending_events(
    State(state): State<AppState>,
    Query(query): Query<PendingQuery>,
) -> ApiResult<Json<PendingEventsResponse>> {
    let older_than = query
        .older_than_minutes
        .unwrap_or(DEFAULT_OLDER_THAN_MINUTES)
        .max(0);
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let events = state
        .pipeline()
        .pending_events(time::Duration::minutes(older_than), limit)
        .await?;

    Ok(Json(PendingEventsResponse {
        count: events.len(),
        events,
    }))
}

/// `POST /api/admin/payment-events/{event_id}/reconcile`
pub async fn reconcile_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<ReconcileResult>> {
    tracing::info!(event_id = %event_id, "Admin requested reconciliation");
    let result = state.pipeline().reconcile_event(&event_id).await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct InvariantQuery {
    pub check: Option<String>,
}

/// `GET /api/admin/billing/invariants`
///
/// Runs every check, or just `?check=<name>`.
pub async fn run_invariant_checks(
    State(state): State<AppState>,
    Query(query): Query<InvariantQuery>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let checker = state
        .invariants
        .as_ref()
        .ok_or_else(|| ApiError::Unavailable("invariant checks need a database".into()))?;

    let summary = match query.check {
        None => checker.run_all_checks().await?,
        Some(name) => {
            if !InvariantChecker::available_checks().contains(&name.as_str()) {
                return Err(ApiError::BadRequest(format!("Unknown check: {}", name)));
            }
            let violations = checker.run_check(&name).await?;
            InvariantCheckSummary::from_violations(time::OffsetDateTime::now_utc(), 1, violations)
        }
    };

    if !summary.violations.is_empty() {
        tracing::warn!(
            violations = summary.violations.len(),
            "Billing invariant violations found"
        );
    }

    Ok(Json(summary))
}
