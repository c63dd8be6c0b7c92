//! # Error Taxonomy
//!
//! Errors are semantic categories, not exception types: every failure the
//! routing engine can observe maps onto one of the kinds below, and the kind
//! alone decides its disposition (retry on the same provider, fall through to
//! the next candidate, or surface immediately). Raw provider errors never
//! leave the adapter layer.
//!
//! Classification rules:
//!
//! - **Transient** kinds (`Timeout`, `Transport`, `Upstream5xx`,
//!   `CacheTimeout`) are retried and may fall back to other providers.
//! - **Breaker failures** are the transient subset caused by the upstream
//!   itself; they feed the circuit breaker's failure window.
//! - Provider-side `RateLimited` skips the provider without a breaker
//!   penalty.
//! - `Upstream4xx` other than 408/425/429 is permanent: no retry, no
//!   fallback.

use std::time::Duration;
use thiserror::Error;

/// Failure kinds observed while routing a request.
///
/// The enum is `Clone` so that a single outcome can be broadcast to every
/// single-flight waiter sharing a fingerprint.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    /// Schema or validation rejection before any upstream work
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// The upstream rejected our credentials
    #[error("upstream authentication failed: {message}")]
    Unauthorized { message: String },

    /// A rate limit denied admission, locally or upstream
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// The provider's circuit breaker is open
    #[error("circuit breaker open for provider {provider}")]
    BreakerOpen { provider: String },

    /// Deadline elapsed while waiting on the upstream
    #[error("upstream timeout")]
    Timeout,

    /// Connection, DNS or TLS failure talking to the upstream
    #[error("transport error: {message}")]
    Transport { message: String },

    /// The provider returned a 5xx status
    #[error("upstream returned {status}: {message}")]
    Upstream5xx { status: u16, message: String },

    /// The provider returned a non-retryable 4xx status
    #[error("upstream rejected request ({status}): {message}")]
    Upstream4xx { status: u16, message: String },

    /// Context condensation exhausted every fallback strategy
    #[error("context condensation failed: {message}")]
    CondenseFailed { message: String },

    /// The condensation concurrency bound is saturated
    #[error("context condensation overloaded")]
    CondenseOverloaded,

    /// The candidate list was empty or every candidate failed
    #[error("no provider available{}", last.as_ref().map(|e| format!(" (last error: {e})")).unwrap_or_default())]
    NoProviderAvailable {
        last: Option<Box<ProviderError>>,
    },

    /// A single-flight wait outlived the request deadline
    #[error("timed out waiting for in-flight result")]
    CacheTimeout,

    /// Anything unclassified. The detail is logged server-side and never
    /// reaches the client body.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ProviderError {
    /// Whether the routing engine may retry or fall back after this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout
                | ProviderError::Transport { .. }
                | ProviderError::Upstream5xx { .. }
                | ProviderError::CacheTimeout
        )
    }

    /// Whether this outcome counts against the provider's failure window.
    ///
    /// Client-caused errors and local admission denials do not; only
    /// upstream and transport failures open breakers.
    pub fn is_breaker_failure(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout
                | ProviderError::Transport { .. }
                | ProviderError::Upstream5xx { .. }
        )
    }

    /// Suggested client backoff, when the failure carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Short machine-readable name for logs and error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::InvalidRequest { .. } => "invalid_request",
            ProviderError::Unauthorized { .. } => "unauthorized",
            ProviderError::RateLimited { .. } => "rate_limited",
            ProviderError::BreakerOpen { .. } => "breaker_open",
            ProviderError::Timeout => "upstream_timeout",
            ProviderError::Transport { .. } => "upstream_transport",
            ProviderError::Upstream5xx { .. } => "upstream_5xx",
            ProviderError::Upstream4xx { .. } => "upstream_4xx",
            ProviderError::CondenseFailed { .. } => "condense_failed",
            ProviderError::CondenseOverloaded => "condense_overloaded",
            ProviderError::NoProviderAvailable { .. } => "no_provider_available",
            ProviderError::CacheTimeout => "cache_timeout",
            ProviderError::Internal { .. } => "internal",
        }
    }

    /// Map an upstream HTTP status to an error kind.
    ///
    /// 408, 425 and 429 stay retryable; other 4xx are permanent.
    pub fn from_status(status: u16, message: String, retry_after: Option<Duration>) -> Self {
        match status {
            401 | 403 => ProviderError::Unauthorized { message },
            429 => ProviderError::RateLimited { retry_after },
            408 | 425 => ProviderError::Timeout,
            s if s >= 500 => ProviderError::Upstream5xx { status, message },
            s if s >= 400 => ProviderError::Upstream4xx { status, message },
            s => ProviderError::Internal {
                message: format!("unexpected status {s}: {message}"),
            },
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if err.is_connect() || err.is_request() {
            ProviderError::Transport {
                message: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            ProviderError::from_status(status.as_u16(), err.to_string(), None)
        } else {
            ProviderError::Transport {
                message: err.to_string(),
            }
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::Internal {
            message: format!("serialization error: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_disposition_table() {
        assert!(matches!(
            ProviderError::from_status(502, "bad gateway".into(), None),
            ProviderError::Upstream5xx { status: 502, .. }
        ));
        assert!(matches!(
            ProviderError::from_status(404, "nope".into(), None),
            ProviderError::Upstream4xx { status: 404, .. }
        ));
        assert!(matches!(
            ProviderError::from_status(429, "slow down".into(), None),
            ProviderError::RateLimited { .. }
        ));
        assert!(matches!(
            ProviderError::from_status(408, "timeout".into(), None),
            ProviderError::Timeout
        ));
        assert!(matches!(
            ProviderError::from_status(401, "denied".into(), None),
            ProviderError::Unauthorized { .. }
        ));
    }

    #[test]
    fn transient_and_breaker_classification() {
        let timeout = ProviderError::Timeout;
        assert!(timeout.is_transient());
        assert!(timeout.is_breaker_failure());

        let rate = ProviderError::RateLimited { retry_after: None };
        assert!(!rate.is_transient());
        assert!(!rate.is_breaker_failure());

        let bad_request = ProviderError::Upstream4xx {
            status: 422,
            message: "unprocessable".into(),
        };
        assert!(!bad_request.is_transient());
        assert!(!bad_request.is_breaker_failure());

        let flaky = ProviderError::Upstream5xx {
            status: 503,
            message: "unavailable".into(),
        };
        assert!(flaky.is_transient());
        assert!(flaky.is_breaker_failure());

        // A cache wait that expires is treated like an upstream timeout but
        // is not the provider's fault.
        let cache = ProviderError::CacheTimeout;
        assert!(cache.is_transient());
        assert!(!cache.is_breaker_failure());
    }
}
