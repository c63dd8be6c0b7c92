//! # HTTP Middleware
//!
//! Two layers wrap every route: request logging with a correlation id, and
//! authentication with per-caller rate limiting. Authentication runs before
//! any routing work; a request without a valid credential or over its
//! per-user budget is rejected here. The liveness probes under `/health`
//! are exempt so orchestrators can probe without credentials.

use crate::auth;
use crate::gateway_error::GatewayError;
use crate::server::AppState;
use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use modelmux_sdk::rate_limit::{Admission, Scope};
use std::time::Instant;

/// Paths served without a credential.
fn is_public(path: &str) -> bool {
    matches!(path, "/health" | "/health/live" | "/health/ready")
}

/// Authenticate the caller and admit it against the per-user bucket.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    if is_public(request.uri().path()) {
        return Ok(next.run(request).await);
    }

    let config = state.config();
    let context = auth::authenticate(
        request.headers(),
        &config.auth.api_keys,
        config.auth.header_name.as_deref(),
    )
    .map_err(|message| GatewayError::Auth { message })?;

    if let Some(bucket) = config.user_bucket() {
        if let Admission::RetryAfter(retry_after) =
            state
                .limiter
                .try_acquire(Scope::User, &context.user_key_id, bucket, 1)
        {
            tracing::debug!(user = %context.user_key_id, "per-user bucket exhausted");
            return Err(GatewayError::UserRateLimited { retry_after });
        }
    }

    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

/// Attach a request id and log one line per request.
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let request_id = format!("req-{}", uuid::Uuid::new_v4().simple());
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let started = Instant::now();
    let mut response = next.run(request).await;
    let latency_ms = started.elapsed().as_millis() as u64;

    tracing::info!(
        %request_id,
        %method,
        %path,
        status = response.status().as_u16(),
        latency_ms,
        "request completed"
    );

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}
