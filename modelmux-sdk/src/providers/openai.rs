//! OpenAI adapter. The normalized request and response types already use
//! the OpenAI wire shape, so translation is a passthrough; this adapter is
//! also the base other OpenAI-compatible adapters delegate to.

use crate::error::ProviderError;
use crate::models::{ChatRequest, ChatResponse, StreamChunk};
use crate::providers::http_client::{sse_data_stream, AuthStrategy, HttpProviderClient};
use crate::providers::{ChunkStream, Provider, ProviderConfig, ProviderKind, PROBE_TIMEOUT};
use futures::StreamExt;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    name: String,
    models: Vec<String>,
    http: HttpProviderClient,
}

impl OpenAiProvider {
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

/// Dispatch through an already-built OpenAI-wire client. Shared with the
/// compatible adapters (OpenRouter, Perplexity, Grok, Blackbox).
pub(crate) async fn dispatch_openai_wire(
    http: &HttpProviderClient,
    mut request: ChatRequest,
    timeout: Duration,
) -> Result<ChatResponse, ProviderError> {
    request.stream = None;
    http.post_json("/chat/completions", &request, timeout).await
}

pub(crate) async fn stream_openai_wire(
    http: &HttpProviderClient,
    mut request: ChatRequest,
    timeout: Duration,
) -> Result<ChunkStream, ProviderError> {
    request.stream = Some(true);
    let resp = http
        .post_event_stream("/chat/completions", &request, timeout)
        .await?;

    let chunks = sse_data_stream(resp).map(|data| {
        data.and_then(|payload| {
            serde_json::from_str::<StreamChunk>(&payload).map_err(ProviderError::from)
        })
    });
    Ok(Box::pin(chunks))
}

pub(crate) async fn probe_models_endpoint(
    http: &HttpProviderClient,
) -> Result<(), ProviderError> {
    http.get_json::<serde_json::Value>("/models", PROBE_TIMEOUT)
        .await
        .map(|_| ())
}

#[async_trait::async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
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
