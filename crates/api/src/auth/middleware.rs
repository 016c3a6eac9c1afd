//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Admin token holder passed to [`require_admin_token`]
#[derive(Clone)]
pub struct AdminAuth {
    token: Option<Arc<str>>,
}

impl AdminAuth {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.map(Arc::from),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some()
    }

    /// Compare `presented` against the configured token in constant time
    fn verify(&self, presented: &str) -> Result<(), AuthError> {
        let expected = self.token.as_deref().ok_or(AuthError::Disabled)?;
        if expected.as_bytes().ct_eq(presented.as_bytes()).into() {
            Ok(())
        } else {
            Err(AuthError::InvalidToken)
        }
    }
}

/// Extract bearer token from the Authorization header
fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Middleware that requires the admin bearer token
pub async fn require_admin_token(
    State(auth): State<AdminAuth>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let result = match extract_bearer_token(&request) {
        // Admin routes do not exist unless a token is configured.
        _ if !auth.is_enabled() => Err(AuthError::Disabled),
        Some(token) => auth.verify(token),
        None => Err(AuthError::MissingAuth),
    };

    match result {
        Ok(()) => next.run(request).await,
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_admin_token: authentication failed");
            err.into_response()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Admin API disabled")]
    Disabled,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid token"),
            AuthError::Disabled => (StatusCode::NOT_FOUND, "Not found"),
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}
