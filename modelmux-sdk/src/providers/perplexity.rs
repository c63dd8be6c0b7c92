//! Perplexity adapter. OpenAI-compatible chat wire; Perplexity has no
//! models-list endpoint, so the probe issues a one-token completion against
//! the first configured model.

use crate::error::ProviderError;
use crate::models::{ChatRequest, ChatResponse, Message};
use crate::providers::http_client::{AuthStrategy, HttpProviderClient};
use crate::providers::openai::{dispatch_openai_wire, stream_openai_wire};
use crate::providers::{ChunkStream, Provider, ProviderConfig, ProviderKind, PROBE_TIMEOUT};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.perplexity.ai";

pub struct PerplexityProvider {
    name: String,
    models: Vec<String>,
    http: HttpProviderClient,
}

impl PerplexityProvider {
    pub fn new(config: &ProviderConfig, api_key: String) -> Result<Self, ProviderError> {
        let http = HttpProviderClient::new(
            config,
            DEFAULT_BASE_URL,
            AuthStrategy::Bearer { token: api_key },
            &[],
        )?;
        Ok(Self {
            name: config.name.clone(),
            models: config.models.clone(),
            http,
        })
    }
}

#[async_trait::async_trait]
impl Provider for PerplexityProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Perplexity
    }

    fn models(&self) -> Vec<String> {
        self.models.clone()
    }

    async fn dispatch(
        &self,
        request: ChatRequest,
        timeout: Duration,
    ) -> Result<ChatResponse, ProviderError> {
        dispatch_openai_wire(&self.http, request, timeout).await
    }

    async fn stream(
        &self,
        request: ChatRequest,
        timeout: Duration,
    ) -> Result<ChunkStream, ProviderError> {
        stream_openai_wire(&self.http, request, timeout).await
    }

    async fn probe(&self) -> Result<(), ProviderError> {
        let model = self
            .models
            .first()
            .cloned()
            .unwrap_or_else(|| "sonar".to_string());
        let request = ChatRequest {
            model,
            messages: vec![Message::user("ping")],
            max_tokens: Some(1),
            ..ChatRequest::default()
        };
        dispatch_openai_wire(&self.http, request, PROBE_TIMEOUT)
            .await
            .map(|_| ())
    }
}
