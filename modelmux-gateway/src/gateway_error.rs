//! # Gateway Error Responses
//!
//! Maps the SDK's error kinds onto the HTTP surface. The body carries only
//! the kind, a human message and a correlation id; internal detail is
//! logged server-side and never reaches the client. Rate-limit rejections
//! carry a `Retry-After` header.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use modelmux_sdk::error::ProviderError;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    /// Errors surfaced by the routing plane
    #[error("{0}")]
    Routing(#[from] ProviderError),

    /// Missing or invalid caller credential
    #[error("authentication failed: {message}")]
    Auth { message: String },

    /// Caller bucket exhausted at the facade
    #[error("rate limit exceeded")]
    UserRateLimited { retry_after: std::time::Duration },

    /// Malformed request body or parameters
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// Configuration reload rejected; body lists every offense
    #[error("configuration rejected")]
    ConfigRejected { errors: Vec<String> },

    /// Unknown resource on the admin surface
    #[error("{message}")]
    NotFound { message: String },

    /// Anything unclassified; detail goes to the log only
    #[error("internal error")]
    Internal { message: String },
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::InvalidRequest {
            message: err.to_string(),
        }
    }
}

impl GatewayError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            GatewayError::Routing(e) => match e {
                ProviderError::InvalidRequest { .. } => (StatusCode::BAD_REQUEST, e.kind()),
                ProviderError::Unauthorized { .. } => (StatusCode::BAD_GATEWAY, e.kind()),
                ProviderError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, e.kind()),
                ProviderError::Upstream4xx { status, .. } => (
                    StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST),
                    e.kind(),
                ),
                ProviderError::Timeout | ProviderError::CacheTimeout => {
                    (StatusCode::GATEWAY_TIMEOUT, e.kind())
                }
                ProviderError::NoProviderAvailable { .. }
                | ProviderError::BreakerOpen { .. }
                | ProviderError::Upstream5xx { .. }
                | ProviderError::Transport { .. }
                | ProviderError::CondenseOverloaded => {
                    (StatusCode::SERVICE_UNAVAILABLE, e.kind())
                }
                ProviderError::CondenseFailed { .. } => (StatusCode::BAD_GATEWAY, e.kind()),
                ProviderError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, e.kind()),
            },
            GatewayError::Auth { .. } => (StatusCode::UNAUTHORIZED, "unauthorized"),
            GatewayError::UserRateLimited { .. } => {
                (StatusCode::TOO_MANY_REQUESTS, "rate_limited")
            }
            GatewayError::InvalidRequest { .. } => (StatusCode::BAD_REQUEST, "invalid_request"),
            GatewayError::ConfigRejected { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "invalid_config")
            }
            GatewayError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            GatewayError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }

    fn client_message(&self) -> String {
        match self {
            // Internal detail stays in the log.
            GatewayError::Internal { .. } => "internal error".to_string(),
            GatewayError::Routing(ProviderError::Internal { .. }) => "internal error".to_string(),
            other => other.to_string(),
        }
    }

    fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            GatewayError::UserRateLimited { retry_after } => Some(*retry_after),
            GatewayError::Routing(e) => e.retry_after(),
            _ => None,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        let correlation_id = format!("err-{}", uuid::Uuid::new_v4().simple());

        if status.is_server_error() {
            tracing::error!(%correlation_id, kind, error = %self, "request failed");
        } else {
            tracing::debug!(%correlation_id, kind, error = %self, "request rejected");
        }

        let mut body = json!({
            "error": {
                "type": kind,
                "message": self.client_message(),
                "correlation_id": correlation_id,
            }
        });
        if let GatewayError::ConfigRejected { errors } = &self {
            body["error"]["details"] = json!(errors);
        }

        let mut response = (status, Json(body)).into_response();
        if let Some(retry_after) = self.retry_after() {
            let secs = retry_after.as_secs().max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}
