//! Anthropic adapter. Translates between the OpenAI-style normalized shapes
//! and the Anthropic messages API: system messages move into the `system`
//! field, `max_tokens` is mandatory, and streaming arrives as typed SSE
//! events rather than chat-completion chunks.

use crate::error::ProviderError;
use crate::models::{
    ChatRequest, ChatResponse, Choice, Delta, Message, Role, StreamChoice, StreamChunk, Usage,
};
use crate::models::unix_now;
use crate::providers::http_client::{sse_data_stream, AuthStrategy, HttpProviderClient};
use crate::providers::{ChunkStream, Provider, ProviderConfig, ProviderKind, PROBE_TIMEOUT};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicProvider {
    name: String,
    models: Vec<String>,
    http: HttpProviderClient,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    id: String,
    content: Vec<AnthropicContent>,
    model: String,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

/// One SSE event in an Anthropic stream; only the variants we consume.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: AnthropicStartMessage },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: AnthropicDelta },
    #[serde(rename = "message_delta")]
    MessageDelta { delta: AnthropicStopDelta },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicStartMessage {
    id: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicDelta {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicStopDelta {
    stop_reason: Option<String>,
}

impl AnthropicProvider {
    pub fn new(config: &ProviderConfig, api_key: String) -> Result<Self, ProviderError> {
        let http = HttpProviderClient::new(
            config,
            DEFAULT_BASE_URL,
            AuthStrategy::Header {
                name: "x-api-key".to_string(),
                value: api_key,
            },
            &[("anthropic-version", API_VERSION.to_string())],
        )?;
        Ok(Self {
            name: config.name.clone(),
            models: config.models.clone(),
            http,
        })
    }

    fn translate(&self, request: &ChatRequest, stream: bool) -> AnthropicRequest {
        let mut system = String::new();
        let mut messages = Vec::new();

        for msg in &request.messages {
            match msg.role {
                Role::System => {
                    if !system.is_empty() {
                        system.push('\n');
                    }
                    system.push_str(&msg.content);
                }
                Role::User => messages.push(AnthropicMessage {
                    role: "user",
                    content: msg.content.clone(),
                }),
                Role::Assistant => messages.push(AnthropicMessage {
                    role: "assistant",
                    content: msg.content.clone(),
                }),
                // Tool results have no counterpart on this path.
                Role::Tool => {}
            }
        }

        AnthropicRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system: (!system.is_empty()).then_some(system),
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: request.stop.clone(),
            stream: stream.then_some(true),
        }
    }
}

fn map_stop_reason(reason: Option<&str>) -> Option<String> {
    reason.map(|r| {
        match r {
            "end_turn" | "stop_sequence" => "stop",
            "max_tokens" => "length",
            other => other,
        }
        .to_string()
    })
}

#[async_trait::async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn models(&self) -> Vec<String> {
        self.models.clone()
    }

    async fn dispatch(
        &self,
        request: ChatRequest,
        timeout: Duration,
    ) -> Result<ChatResponse, ProviderError> {
        let native = self.translate(&request, false);
        let resp: AnthropicResponse = self.http.post_json("/v1/messages", &native, timeout).await?;

        let text = resp
            .content
            .into_iter()
            .map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        Ok(ChatResponse {
            id: resp.id,
            object: "chat.completion".to_string(),
            created: unix_now(),
            model: resp.model,
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(text),
                finish_reason: map_stop_reason(resp.stop_reason.as_deref()),
            }],
            usage: Some(Usage {
                prompt_tokens: resp.usage.input_tokens,
                completion_tokens: resp.usage.output_tokens,
                total_tokens: resp.usage.input_tokens + resp.usage.output_tokens,
            }),
        })
    }

    async fn stream(
        &self,
        request: ChatRequest,
        timeout: Duration,
    ) -> Result<ChunkStream, ProviderError> {
        let native = self.translate(&request, true);
        let resp = self
            .http
            .post_event_stream("/v1/messages", &native, timeout)
            .await?;

        let fallback_model = request.model.clone();
        let chunks = async_stream::stream! {
            let mut data = sse_data_stream(resp);
            let mut id = String::new();
            let mut model = fallback_model;

            while let Some(item) = data.next().await {
                let payload = match item {
                    Ok(payload) => payload,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                let event = match serde_json::from_str::<AnthropicEvent>(&payload) {
                    Ok(event) => event,
                    Err(_) => continue,
                };
                match event {
                    AnthropicEvent::MessageStart { message } => {
                        id = message.id;
                        model = message.model;
                        yield Ok(StreamChunk {
                            id: id.clone(),
                            object: "chat.completion.chunk".to_string(),
                            created: unix_now(),
                            model: model.clone(),
                            choices: vec![StreamChoice {
                                index: 0,
                                delta: Delta { role: Some(Role::Assistant), content: None },
                                finish_reason: None,
                            }],
                        });
                    }
                    AnthropicEvent::ContentBlockDelta { delta } => {
                        yield Ok(StreamChunk {
                            id: id.clone(),
                            object: "chat.completion.chunk".to_string(),
                            created: unix_now(),
                            model: model.clone(),
                            choices: vec![StreamChoice {
                                index: 0,
                                delta: Delta { role: None, content: Some(delta.text) },
                                finish_reason: None,
                            }],
                        });
                    }
                    AnthropicEvent::MessageDelta { delta } => {
                        yield Ok(StreamChunk {
                            id: id.clone(),
                            object: "chat.completion.chunk".to_string(),
                            created: unix_now(),
                            model: model.clone(),
                            choices: vec![StreamChoice {
                                index: 0,
                                delta: Delta::default(),
                                finish_reason: map_stop_reason(delta.stop_reason.as_deref()),
                            }],
                        });
                    }
                    AnthropicEvent::MessageStop => return,
                    AnthropicEvent::Other => {}
                }
            }
        };
        Ok(Box::pin(chunks))
    }

    async fn probe(&self) -> Result<(), ProviderError> {
        self.http
            .get_json::<serde_json::Value>("/v1/models", PROBE_TIMEOUT)
            .await
            .map(|_| ())
    }
}
