//! Azure OpenAI adapter. Same wire format as OpenAI but addressed by
//! deployment: requests go to
//! `{base_url}/openai/deployments/{model}/chat/completions` with an
//! `api-key` header and an `api-version` query parameter. The configured
//! model names double as deployment names.

use crate::error::ProviderError;
use crate::models::{ChatRequest, ChatResponse, StreamChunk};
use crate::providers::http_client::{sse_data_stream, AuthStrategy, HttpProviderClient};
use crate::providers::{ChunkStream, Provider, ProviderConfig, ProviderKind, PROBE_TIMEOUT};
use futures::StreamExt;
use std::time::Duration;

const API_VERSION: &str = "2024-06-01";

pub struct AzureOpenAiProvider {
    name: String,
    models: Vec<String>,
    http: HttpProviderClient,
}

impl AzureOpenAiProvider {
    pub fn new(config: &ProviderConfig, api_key: String) -> Result<Self, ProviderError> {
        // Azure has no sensible public default host; the resource URL is
        // required configuration and validated by the loader.
        let base_url = config.base_url.as_deref().ok_or_else(|| ProviderError::Internal {
            message: format!("azure provider {} requires base_url", config.name),
        })?;
        let http = HttpProviderClient::new(
            config,
            base_url,
            AuthStrategy::Header {
                name: "api-key".to_string(),
                value: api_key,
            },
            &[],
        )?;
        Ok(Self {
            name: config.name.clone(),
            models: config.models.clone(),
            http,
        })
    }

    fn completion_path(&self, deployment: &str) -> String {
        format!("/openai/deployments/{deployment}/chat/completions?api-version={API_VERSION}")
    }
}

#[async_trait::async_trait]
impl Provider for AzureOpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Azure
    }

    fn models(&self) -> Vec<String> {
        self.models.clone()
    }

    async fn dispatch(
        &self,
        mut request: ChatRequest,
        timeout: Duration,
    ) -> Result<ChatResponse, ProviderError> {
        let path = self.completion_path(&request.model);
        request.stream = None;
        self.http.post_json(&path, &request, timeout).await
    }

    async fn stream(
        &self,
        mut request: ChatRequest,
        timeout: Duration,
    ) -> Result<ChunkStream, ProviderError> {
        let path = self.completion_path(&request.model);
        request.stream = Some(true);
        let resp = self.http.post_event_stream(&path, &request, timeout).await?;

        let chunks = sse_data_stream(resp).map(|data| {
            data.and_then(|payload| {
                serde_json::from_str::<StreamChunk>(&payload).map_err(ProviderError::from)
            })
        });
        Ok(Box::pin(chunks))
    }

    async fn probe(&self) -> Result<(), ProviderError> {
        self.http
            .get_json::<serde_json::Value>(
                &format!("/openai/models?api-version={API_VERSION}"),
                PROBE_TIMEOUT,
            )
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_requires_a_base_url() {
        let config = ProviderConfig::new("azure", ProviderKind::Azure, "AZURE_KEY");
        assert!(AzureOpenAiProvider::new(&config, "key".to_string()).is_err());

        let config = config.with_base_url("https://example.openai.azure.com");
        assert!(AzureOpenAiProvider::new(&config, "key".to_string()).is_ok());
    }

    #[test]
    fn deployment_path_embeds_model_and_version() {
        let config = ProviderConfig::new("azure", ProviderKind::Azure, "AZURE_KEY")
            .with_base_url("https://example.openai.azure.com");
        let provider = AzureOpenAiProvider::new(&config, "key".to_string()).unwrap();
        let path = provider.completion_path("gpt-4o-deploy");
        assert!(path.starts_with("/openai/deployments/gpt-4o-deploy/chat/completions"));
        assert!(path.contains("api-version="));
    }
}
