//! Shared HTTP plumbing for provider adapters.
//!
//! Each adapter owns one [`HttpProviderClient`] built from its provider
//! config: a reqwest client with a bounded keepalive pool, the resolved
//! auth credential, and any custom headers. Timeouts are applied per
//! request so the router can pass the remaining deadline budget.

use crate::error::ProviderError;
use crate::providers::ProviderConfig;
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::pin::Pin;
use std::time::Duration;

/// How the provider expects its credential.
#[derive(Clone)]
pub enum AuthStrategy {
    Bearer { token: String },
    Header { name: String, value: String },
}

pub struct HttpProviderClient {
    http: Client,
    base_url: String,
    default_headers: HeaderMap,
}

impl HttpProviderClient {
    /// Build the pooled client for one adapter.
    ///
    /// `default_base` is the provider's public endpoint, overridden by
    /// `config.base_url` when set.
    pub fn new(
        config: &ProviderConfig,
        default_base: &str,
        auth: AuthStrategy,
        extra_headers: &[(&str, String)],
    ) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(config.max_keepalive_connections)
            .pool_idle_timeout(config.keepalive_expiry)
            .build()
            .map_err(|e| ProviderError::Internal {
                message: format!("failed to build HTTP client: {e}"),
            })?;

        let mut default_headers = HeaderMap::new();
        match auth {
            AuthStrategy::Bearer { token } => {
                insert_header(&mut default_headers, "authorization", &format!("Bearer {token}"));
            }
            AuthStrategy::Header { name, value } => {
                insert_header(&mut default_headers, &name, &value);
            }
        }
        for (name, value) in extra_headers {
            insert_header(&mut default_headers, name, value);
        }
        for (name, value) in &config.custom_headers {
            insert_header(&mut default_headers, name, value);
        }

        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| default_base.to_string());

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            default_headers,
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    pub async fn post_json<TReq: Serialize, TResp: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
        timeout: Duration,
    ) -> Result<TResp, ProviderError> {
        let resp = self
            .http
            .request(Method::POST, self.url(path))
            .headers(self.default_headers.clone())
            .timeout(timeout)
            .json(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(map_error_response(resp).await);
        }
        Ok(resp.json::<TResp>().await?)
    }

    /// POST and hand back the raw response for SSE consumption. The status
    /// is already checked; an error here is pre-stream.
    pub async fn post_event_stream<TReq: Serialize>(
        &self,
        path: &str,
        body: &TReq,
        timeout: Duration,
    ) -> Result<Response, ProviderError> {
        let resp = self
            .http
            .request(Method::POST, self.url(path))
            .headers(self.default_headers.clone())
            .header("accept", "text/event-stream")
            .timeout(timeout)
            .json(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(map_error_response(resp).await);
        }
        Ok(resp)
    }

    pub async fn get_json<TResp: DeserializeOwned>(
        &self,
        path: &str,
        timeout: Duration,
    ) -> Result<TResp, ProviderError> {
        let resp = self
            .http
            .request(Method::GET, self.url(path))
            .headers(self.default_headers.clone())
            .timeout(timeout)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(map_error_response(resp).await);
        }
        Ok(resp.json::<TResp>().await?)
    }
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        name.parse::<HeaderName>(),
        value.parse::<HeaderValue>(),
    ) {
        headers.insert(name, value);
    } else {
        tracing::warn!(header = name, "dropping malformed header");
    }
}

/// Map a non-success upstream response to an error kind, pulling a message
/// from the common JSON error shapes and honoring Retry-After.
pub async fn map_error_response(resp: Response) -> ProviderError {
    let status = resp.status().as_u16();
    let retry_after = resp
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);

    let message = match resp.text().await {
        Ok(body) => serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| {
                v.get("error")
                    .and_then(|e| e.get("message"))
                    .or_else(|| v.get("message"))
                    .and_then(|m| m.as_str())
                    .map(|s| s.to_string())
            })
            .unwrap_or(body),
        Err(_) => "failed to read error response".to_string(),
    };

    ProviderError::from_status(status, message, retry_after)
}

/// Split an SSE response into the payloads of its `data:` lines.
///
/// The `[DONE]` sentinel ends the stream; transport errors mid-stream
/// surface as an error item.
pub fn sse_data_stream(
    resp: Response,
) -> Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>> {
    let stream = async_stream::stream! {
        let mut bytes = resp.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(ProviderError::from(e));
                    return;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim_end_matches('\r').to_string();
                buffer.drain(..=pos);

                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    return;
                }
                if !data.is_empty() {
                    yield Ok(data.to_string());
                }
            }
        }
    };
    Box::pin(stream)
}
