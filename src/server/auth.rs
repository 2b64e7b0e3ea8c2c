//! API-key admission gate.
//!
//! Active only when the config carries a key. Health, version and the
//! WebSocket upgrade stay open; everything else must present the key in
//! `X-API-Key`.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::ApiError;

use super::AppState;

const API_KEY_HEADER: &str = "x-api-key";

const EXEMPT_PATHS: &[&str] = &["/health", "/version", "/api/asr/stream-progress"];

pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(ref expected) = state.config.api_key else {
        return next.run(request).await;
    };

    if EXEMPT_PATHS.contains(&request.uri().path()) {
        return next.run(request).await;
    }

    match request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        None => ApiError::Unauthenticated.into_response(),
        Some(presented) if presented == expected => next.run(request).await,
        Some(_) => ApiError::Forbidden.into_response(),
    }
}
