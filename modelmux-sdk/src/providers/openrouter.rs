//! OpenRouter adapter. OpenAI-compatible wire format; OpenRouter routes the
//! model string itself, so `models` in config usually lists the
//! `vendor/model` names to expose.

use crate::error::ProviderError;
use crate::models::{ChatRequest, ChatResponse};
use crate::providers::http_client::{AuthStrategy, HttpProviderClient};
use crate::providers::openai::{dispatch_openai_wire, probe_models_endpoint, stream_openai_wire};
use crate::providers::{ChunkStream, Provider, ProviderConfig, ProviderKind};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

pub struct OpenRouterProvider {
    name: String,
    models: Vec<String>,
    http: HttpProviderClient,
}

impl OpenRouterProvider {
    pub fn new(config: &ProviderConfig, api_key: String) -> Result<Self, ProviderError> {
        // OpenRouter asks callers to identify themselves for its routing
        // dashboard; custom_headers can override both.
        let http = HttpProviderClient::new(
            config,
            DEFAULT_BASE_URL,
            AuthStrategy::Bearer { token: api_key },
            &[("x-title", "modelmux".to_string())],
        )?;
        Ok(Self {
            name: config.name.clone(),
            models: config.models.clone(),
            http,
        })
    }
}

#[async_trait::async_trait]
impl Provider for OpenRouterProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenRouter
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
        probe_models_endpoint(&self.http).await
    }
}
