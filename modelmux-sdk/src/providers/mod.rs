//! # Provider Adapters
//!
//! One adapter per upstream kind. Each adapter owns a dedicated HTTP client
//! with a bounded connection pool, translates the normalized request into
//! the provider's native schema, and maps the provider's response and errors
//! back into the normalized shapes. Adapters are one-shot: no internal
//! retries, no fallback; the routing engine owns that policy.
//!
//! The contract exposed to the router is three calls:
//!
//! - [`Provider::dispatch`]: one non-streaming completion under a timeout.
//! - [`Provider::stream`]: a lazy sequence of chunk envelopes terminated by
//!   an end or an error item.
//! - [`Provider::probe`]: a cheap liveness check (a models-list call capped
//!   at five seconds), driven by the health monitor.

use crate::error::ProviderError;
use crate::models::{ChatRequest, ChatResponse, StreamChunk};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub mod anthropic;
pub mod azure;
pub mod blackbox;
pub mod cohere;
pub mod grok;
pub mod http_client;
pub mod openai;
pub mod openrouter;
pub mod perplexity;

/// Lazy stream of normalized chunk envelopes.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

/// The closed set of supported upstream kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Azure,
    Cohere,
    Perplexity,
    Grok,
    Blackbox,
    OpenRouter,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Azure => "azure",
            ProviderKind::Cohere => "cohere",
            ProviderKind::Perplexity => "perplexity",
            ProviderKind::Grok => "grok",
            ProviderKind::Blackbox => "blackbox",
            ProviderKind::OpenRouter => "openrouter",
        }
    }

    pub const ALL: [ProviderKind; 8] = [
        ProviderKind::OpenAi,
        ProviderKind::Anthropic,
        ProviderKind::Azure,
        ProviderKind::Cohere,
        ProviderKind::Perplexity,
        ProviderKind::Grok,
        ProviderKind::Blackbox,
        ProviderKind::OpenRouter,
    ];
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderKind::ALL
            .iter()
            .find(|kind| kind.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown provider type: {s}"))
    }
}

/// Declarative description of one upstream provider.
///
/// `api_key_ref` names an environment entry holding the secret; the literal
/// key never appears in configuration or logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique identifier for this provider
    pub name: String,
    /// Which adapter handles it
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key
    pub api_key_ref: String,
    /// Models this provider serves; must be non-empty
    pub models: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Selection order; lower is preferred, unique across providers
    pub priority: i32,
    #[serde(with = "crate::common::duration_serde", default = "default_timeout")]
    pub timeout: Duration,
    /// Requests per hour admitted to this provider, if limited
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u32>,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(with = "crate::common::duration_serde", default = "default_retry_delay")]
    pub retry_delay: Duration,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_keepalive")]
    pub max_keepalive_connections: usize,
    #[serde(with = "crate::common::duration_serde", default = "default_keepalive_expiry")]
    pub keepalive_expiry: Duration,
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,
}

fn default_enabled() -> bool {
    true
}
fn default_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay() -> Duration {
    Duration::from_millis(500)
}
fn default_max_connections() -> usize {
    32
}
fn default_max_keepalive() -> usize {
    8
}
fn default_keepalive_expiry() -> Duration {
    Duration::from_secs(60)
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, kind: ProviderKind, api_key_ref: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            base_url: None,
            api_key_ref: api_key_ref.into(),
            models: Vec::new(),
            enabled: true,
            priority: 0,
            timeout: default_timeout(),
            rate_limit: None,
            retry_attempts: default_retry_attempts(),
            retry_delay: default_retry_delay(),
            max_connections: default_max_connections(),
            max_keepalive_connections: default_max_keepalive(),
            keepalive_expiry: default_keepalive_expiry(),
            custom_headers: HashMap::new(),
        }
    }

    pub fn with_models(mut self, models: &[&str]) -> Self {
        self.models = models.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn supports_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    /// Resolve the API key from the environment entry this config names.
    pub fn resolve_api_key(&self) -> Result<String, ProviderError> {
        match std::env::var(&self.api_key_ref) {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(ProviderError::Internal {
                message: format!(
                    "api_key_ref {} does not resolve to a non-empty value",
                    self.api_key_ref
                ),
            }),
        }
    }

    /// Whether a change from `self` to `other` needs the adapter and its
    /// HTTP pool rebuilt, as opposed to applying in place.
    pub fn requires_adapter_rebuild(&self, other: &ProviderConfig) -> bool {
        self.kind != other.kind
            || self.base_url != other.base_url
            || self.api_key_ref != other.api_key_ref
            || self.max_connections != other.max_connections
            || self.max_keepalive_connections != other.max_keepalive_connections
            || self.keepalive_expiry != other.keepalive_expiry
            || self.custom_headers != other.custom_headers
    }
}

/// Contract every adapter implements for the routing engine.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// The configured provider name (not the kind).
    fn name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    /// Models this provider is configured to serve.
    fn models(&self) -> Vec<String>;

    /// One non-streaming completion. `timeout` is the smaller of the
    /// provider's configured timeout and the request's remaining deadline.
    async fn dispatch(
        &self,
        request: ChatRequest,
        timeout: Duration,
    ) -> Result<ChatResponse, ProviderError>;

    /// Begin a streaming completion. Errors returned here are pre-stream
    /// and may fall back; errors yielded by the stream are post-commit.
    async fn stream(
        &self,
        request: ChatRequest,
        timeout: Duration,
    ) -> Result<ChunkStream, ProviderError>;

    /// Cheap liveness check used by the health monitor.
    async fn probe(&self) -> Result<(), ProviderError>;
}

/// Cap applied to every probe regardless of the provider timeout.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the adapter for a provider config, resolving its secret.
pub fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    let api_key = config.resolve_api_key()?;
    let provider: Arc<dyn Provider> = match config.kind {
        ProviderKind::OpenAi => Arc::new(openai::OpenAiProvider::new(config, api_key)?),
        ProviderKind::Anthropic => Arc::new(anthropic::AnthropicProvider::new(config, api_key)?),
        ProviderKind::Azure => Arc::new(azure::AzureOpenAiProvider::new(config, api_key)?),
        ProviderKind::Cohere => Arc::new(cohere::CohereProvider::new(config, api_key)?),
        ProviderKind::Perplexity => Arc::new(perplexity::PerplexityProvider::new(config, api_key)?),
        ProviderKind::Grok => Arc::new(grok::GrokProvider::new(config, api_key)?),
        ProviderKind::Blackbox => Arc::new(blackbox::BlackboxProvider::new(config, api_key)?),
        ProviderKind::OpenRouter => Arc::new(openrouter::OpenRouterProvider::new(config, api_key)?),
    };
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_the_closed_set() {
        for kind in ProviderKind::ALL {
            assert_eq!(kind.as_str().parse::<ProviderKind>().unwrap(), kind);
        }
        assert!("mainframe".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn rebuild_detection_tracks_pool_and_identity_fields() {
        let base = ProviderConfig::new("p", ProviderKind::OpenAi, "OPENAI_API_KEY");

        let mut tweaked = base.clone();
        tweaked.priority = 7;
        tweaked.retry_attempts = 1;
        assert!(!base.requires_adapter_rebuild(&tweaked));

        let mut moved = base.clone();
        moved.base_url = Some("https://proxy.internal/v1".to_string());
        assert!(base.requires_adapter_rebuild(&moved));

        let mut resized = base.clone();
        resized.max_connections = 64;
        assert!(base.requires_adapter_rebuild(&resized));
    }

    #[test]
    fn missing_secret_is_an_error() {
        let config = ProviderConfig::new("p", ProviderKind::OpenAi, "MODELMUX_TEST_NO_SUCH_KEY");
        assert!(config.resolve_api_key().is_err());
    }
}
