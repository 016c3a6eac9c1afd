//! Unit tests for authentication middleware
//!
//! Tests cover:
//! - Missing, malformed and wrong bearer tokens
//! - Disabled admin API (no token configured)

#[cfg(test)]
mod tests {
    use super::super::middleware::*;
    use axum::{
        body::Body,
        http::{header::AUTHORIZATION, Request, StatusCode},
        middleware::from_fn_with_state,
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    const TOKEN: &str = "admin-token-for-tests";

    fn app(token: Option<&str>) -> Router {
        let auth = AdminAuth::new(token.map(str::to_string));
        Router::new()
            .route("/admin", get(|| async { "ok" }))
            .layer(from_fn_with_state(auth, require_admin_token))
    }

    async fn status_for(token: Option<&str>, header: Option<&str>) -> StatusCode {
        let mut request = Request::builder().uri("/admin");
        if let Some(value) = header {
            request = request.header(AUTHORIZATION, value);
        }
        app(token)
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_valid_token_passes() {
        let status = status_for(Some(TOKEN), Some(&format!("Bearer {}", TOKEN))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_header_is_unauthorized() {
        assert_eq!(status_for(Some(TOKEN), None).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_wrong_token_is_unauthorized() {
        let status = status_for(Some(TOKEN), Some("Bearer admin-token-for-test")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_non_bearer_scheme_is_unauthorized() {
        let status = status_for(Some(TOKEN), Some(&format!("Basic {}", TOKEN))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unconfigured_admin_api_is_hidden() {
        assert_eq!(
            status_for(None, Some("Bearer anything")).await,
            StatusCode::NOT_FOUND
        );
        assert_eq!(status_for(None, None).await, StatusCode::NOT_FOUND);
    }
}
