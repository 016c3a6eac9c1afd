//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Missing webhook signature header")]
    SignatureMissing,

    #[error("Webhook signature verification failed")]
    SignatureInvalid,

    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error(
        "Amount mismatch for order {order_id}: expected {expected} {expected_currency}, \
         webhook reported {reported} {reported_currency}"
    )]
    AmountMismatch {
        order_id: String,
        expected: i64,
        expected_currency: String,
        reported: i64,
        reported_currency: String,
    },

    #[error("No local order record for order {0}")]
    OrderNotFound(String),

    #[error("Unrecognized payment purpose: {0}")]
    UnrecognizedPurpose(String),

    #[error("Payment notes missing required field: {0}")]
    MissingNote(&'static str),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Errors that come from the caller's input rather than from our side.
    /// Redelivering the same event will not change the outcome.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            BillingError::SignatureMissing
                | BillingError::SignatureInvalid
                | BillingError::MalformedPayload(_)
                | BillingError::AmountMismatch { .. }
                | BillingError::OrderNotFound(_)
                | BillingError::UnrecognizedPurpose(_)
                | BillingError::MissingNote(_)
        )
    }

    /// Short machine-readable label used as an error-tracking tag
    pub fn kind(&self) -> &'static str {
        match self {
            BillingError::SignatureMissing => "signature_missing",
            BillingError::SignatureInvalid => "signature_invalid",
            BillingError::MalformedPayload(_) => "malformed_payload",
            BillingError::Database(_) => "database",
            BillingError::AmountMismatch { .. } => "amount_mismatch",
            BillingError::OrderNotFound(_) => "order_not_found",
            BillingError::UnrecognizedPurpose(_) => "unrecognized_purpose",
            BillingError::MissingNote(_) => "missing_note",
            BillingError::NotFound(_) => "not_found",
            BillingError::Configuration(_) => "configuration",
            BillingError::Internal(_) => "internal",
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(e: serde_json::Error) -> Self {
        BillingError::MalformedPayload(e.to_string())
    }
}
