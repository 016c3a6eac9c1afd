//! API error type
//!
//! The webhook route answers in plain text (Razorpay only reads the status);
//! admin routes use the JSON body the auth middleware uses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use xainik_billing::BillingError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Database(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Plain-text response for webhook callers. Internal detail is logged,
    /// never echoed.
    pub fn into_plain_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::BadRequest(m) => m.clone(),
            _ => status
                .canonical_reason()
                .unwrap_or("Internal Server Error")
                .to_string(),
        };
        (status, message).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::SignatureMissing => ApiError::BadRequest("Missing signature".into()),
            BillingError::SignatureInvalid => ApiError::BadRequest("Invalid signature".into()),
            BillingError::MalformedPayload(m) => ApiError::BadRequest(m),
            BillingError::NotFound(m) => ApiError::NotFound(m),
            BillingError::Database(m) => ApiError::Database(m),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::Database(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::BadRequest(m) | ApiError::NotFound(m) | ApiError::Unavailable(m) => m.clone(),
            ApiError::Database(m) | ApiError::Internal(m) => {
                tracing::error!(error = %m, "Request failed");
                "Internal server error".to_string()
            }
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}
