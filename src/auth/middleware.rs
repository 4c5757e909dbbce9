use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use super::DigestAuth;
use crate::error::ErrorResponse;
use crate::state::AppState;

/// Digest authentication middleware
///
/// Mounted on the outer router, so paths still carry the `/api` prefix.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(auth) = state.auth.as_deref() else {
        return next.run(request).await;
    };

    if is_public_endpoint(request.uri().path()) {
        return next.run(request).await;
    }

    let target = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| auth.verify(request.method().as_str(), target, value));

    if authorized {
        return next.run(request).await;
    }
    unauthorized_response(auth)
}

fn unauthorized_response(auth: &DigestAuth) -> Response {
    let body = ErrorResponse {
        success: false,
        message: "Not authenticated".to_string(),
    };
    let mut response = (StatusCode::UNAUTHORIZED, Json(body)).into_response();
    if let Ok(challenge) = HeaderValue::from_str(&auth.challenge()) {
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, challenge);
    }
    response
}

/// Check if endpoint is public (no auth required)
fn is_public_endpoint(path: &str) -> bool {
    matches!(path, "/api/health")
}
