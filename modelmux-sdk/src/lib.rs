//! # Modelmux SDK
//!
//! The routing and resilience plane of the modelmux gateway: provider
//! adapters behind one trait, a priority-ordered registry with health
//! tracking, per-provider circuit breakers and token-bucket rate limiters,
//! a fingerprinted response cache with single-flight coalescing, and a
//! context condenser that shrinks oversized conversations before dispatch.
//!
//! The [`routing::RoutingEngine`] ties these together: it selects providers
//! per request, retries transient failures with jittered backoff, falls
//! back down the candidate list, and commits to a provider once a stream
//! starts emitting chunks.
//!
//! ## Quick tour
//!
//! ```rust,no_run
//! use modelmux_sdk::cache::{CacheSettings, ResponseCache};
//! use modelmux_sdk::circuit_breaker::BreakerConfig;
//! use modelmux_sdk::condenser::{CondensationConfig, ContextCondenser};
//! use modelmux_sdk::models::{ChatRequest, Message, RouteRequest};
//! use modelmux_sdk::providers::{ProviderConfig, ProviderKind};
//! use modelmux_sdk::rate_limit::RateLimiter;
//! use modelmux_sdk::registry::ProviderRegistry;
//! use modelmux_sdk::routing::RoutingEngine;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(ProviderRegistry::new(BreakerConfig::default()));
//! let primary = ProviderConfig::new("openai", ProviderKind::OpenAi, "OPENAI_API_KEY")
//!     .with_models(&["gpt-4o"])
//!     .with_priority(1);
//! registry.apply_config(&[primary], BreakerConfig::default());
//!
//! let engine = RoutingEngine::new(
//!     registry,
//!     Arc::new(ResponseCache::new(CacheSettings::default())),
//!     Arc::new(RateLimiter::new()),
//!     Arc::new(ContextCondenser::new(
//!         CondensationConfig::default(),
//!         CacheSettings::default(),
//!     )),
//! );
//!
//! let request = RouteRequest::chat(
//!     ChatRequest {
//!         model: "gpt-4o".to_string(),
//!         messages: vec![Message::user("Hello!")],
//!         ..ChatRequest::default()
//!     },
//!     None,
//!     Duration::from_secs(30),
//! );
//! let response = engine.execute(&request).await?;
//! println!("{}", response.choices[0].message.content);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod circuit_breaker;
pub mod common;
pub mod condenser;
pub mod error;
pub mod fingerprint;
pub mod health;
pub mod models;
pub mod providers;
pub mod rate_limit;
pub mod registry;
pub mod routing;

pub use cache::{CacheSettings, CacheStats, MemoryCache, ResponseCache};
pub use circuit_breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use condenser::{CondensationConfig, ContextCondenser, FallbackStrategy};
pub use error::ProviderError;
pub use health::{HealthCheckConfig, HealthMonitor, HealthSnapshot, HealthStatus, ProviderHealth};
pub use models::{
    ChatRequest, ChatResponse, Choice, CompletionRequest, Message, RequestKind, Role,
    RouteRequest, StreamChunk, Usage,
};
pub use providers::{Provider, ProviderConfig, ProviderKind};
pub use rate_limit::{Admission, BucketConfig, RateLimiter, Scope};
pub use registry::{Outcome, ProviderRegistry};
pub use routing::{RoutedResponse, RoutingEngine};
