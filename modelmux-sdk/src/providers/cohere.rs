//! Cohere adapter. The chat API takes the latest user turn as `message`
//! with the rest of the conversation as `chat_history`; streaming is a
//! sequence of JSON event lines rather than OpenAI-style chunks.

use crate::error::ProviderError;
use crate::models::{
    ChatRequest, ChatResponse, Choice, Delta, Message, Role, StreamChoice, StreamChunk, Usage,
};
use crate::models::unix_now;
use crate::providers::http_client::{AuthStrategy, HttpProviderClient};
use crate::providers::{ChunkStream, Provider, ProviderConfig, ProviderKind, PROBE_TIMEOUT};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.cohere.ai";

pub struct CohereProvider {
    name: String,
    models: Vec<String>,
    http: HttpProviderClient,
}

#[derive(Debug, Serialize)]
struct CohereRequest {
    model: String,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    chat_history: Vec<CohereTurn>,
    #[serde(skip_serializing_if = "Option::is_none")]
    preamble: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "p")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct CohereTurn {
    role: &'static str,
    message: String,
}

#[derive(Debug, Deserialize)]
struct CohereResponse {
    #[serde(default)]
    generation_id: Option<String>,
    text: String,
    finish_reason: Option<String>,
    #[serde(default)]
    meta: Option<CohereMeta>,
}

#[derive(Debug, Deserialize)]
struct CohereMeta {
    #[serde(default)]
    tokens: Option<CohereTokens>,
}

#[derive(Debug, Deserialize)]
struct CohereTokens {
    #[serde(default)]
    input_tokens: Option<f64>,
    #[serde(default)]
    output_tokens: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct CohereStreamEvent {
    event_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    finish_reason: Option<String>,
}

impl CohereProvider {
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

    fn translate(&self, request: &ChatRequest, stream: bool) -> CohereRequest {
        let mut preamble = String::new();
        let mut history = Vec::new();
        let mut message = String::new();

        // The last user turn becomes `message`; everything before it is
        // history in Cohere's USER/CHATBOT vocabulary.
        let last_user = request
            .messages
            .iter()
            .rposition(|m| m.role == Role::User);

        for (idx, msg) in request.messages.iter().enumerate() {
            match msg.role {
                Role::System => {
                    if !preamble.is_empty() {
                        preamble.push('\n');
                    }
                    preamble.push_str(&msg.content);
                }
                Role::User if Some(idx) == last_user => message = msg.content.clone(),
                Role::User => history.push(CohereTurn {
                    role: "USER",
                    message: msg.content.clone(),
                }),
                Role::Assistant => history.push(CohereTurn {
                    role: "CHATBOT",
                    message: msg.content.clone(),
                }),
                Role::Tool => {}
            }
        }

        CohereRequest {
            model: request.model.clone(),
            message,
            chat_history: history,
            preamble: (!preamble.is_empty()).then_some(preamble),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: request.stop.clone(),
            stream: stream.then_some(true),
        }
    }
}

fn map_finish_reason(reason: Option<&str>) -> Option<String> {
    reason.map(|r| {
        match r {
            "COMPLETE" | "STOP_SEQUENCE" => "stop",
            "MAX_TOKENS" => "length",
            other => other,
        }
        .to_string()
    })
}

#[async_trait::async_trait]
impl Provider for CohereProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Cohere
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
        let resp: CohereResponse = self.http.post_json("/v1/chat", &native, timeout).await?;

        let usage = resp.meta.and_then(|meta| meta.tokens).map(|tokens| {
            let prompt = tokens.input_tokens.unwrap_or(0.0) as u32;
            let completion = tokens.output_tokens.unwrap_or(0.0) as u32;
            Usage {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: prompt + completion,
            }
        });

        Ok(ChatResponse {
            id: resp
                .generation_id
                .unwrap_or_else(|| format!("cohere-{}", uuid::Uuid::new_v4().simple())),
            object: "chat.completion".to_string(),
            created: unix_now(),
            model: request.model,
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(resp.text),
                finish_reason: map_finish_reason(resp.finish_reason.as_deref()),
            }],
            usage,
        })
    }

    async fn stream(
        &self,
        request: ChatRequest,
        timeout: Duration,
    ) -> Result<ChunkStream, ProviderError> {
        let native = self.translate(&request, true);
        let resp = self.http.post_event_stream("/v1/chat", &native, timeout).await?;

        let id = format!("cohere-{}", uuid::Uuid::new_v4().simple());
        let model = request.model.clone();
        let chunks = async_stream::stream! {
            // Cohere streams newline-delimited JSON events, not SSE.
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
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    if line.is_empty() {
                        continue;
                    }
                    let Ok(event) = serde_json::from_str::<CohereStreamEvent>(&line) else {
                        continue;
                    };
                    match event.event_type.as_str() {
                        "text-generation" => {
                            yield Ok(StreamChunk {
                                id: id.clone(),
                                object: "chat.completion.chunk".to_string(),
                                created: unix_now(),
                                model: model.clone(),
                                choices: vec![StreamChoice {
                                    index: 0,
                                    delta: Delta {
                                        role: None,
                                        content: event.text,
                                    },
                                    finish_reason: None,
                                }],
                            });
                        }
                        "stream-end" => {
                            yield Ok(StreamChunk {
                                id: id.clone(),
                                object: "chat.completion.chunk".to_string(),
                                created: unix_now(),
                                model: model.clone(),
                                choices: vec![StreamChoice {
                                    index: 0,
                                    delta: Delta::default(),
                                    finish_reason: map_finish_reason(
                                        event.finish_reason.as_deref(),
                                    )
                                    .or(Some("stop".to_string())),
                                }],
                            });
                            return;
                        }
                        _ => {}
                    }
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

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> CohereProvider {
        let config = ProviderConfig::new("cohere", ProviderKind::Cohere, "COHERE_TEST_KEY")
            .with_models(&["command-r-plus"]);
        CohereProvider::new(&config, "test-key".to_string()).unwrap()
    }

    #[test]
    fn last_user_turn_becomes_the_message() {
        let request = ChatRequest {
            model: "command-r-plus".to_string(),
            messages: vec![
                Message::system("be helpful"),
                Message::user("first question"),
                Message::assistant("first answer"),
                Message::user("second question"),
            ],
            ..ChatRequest::default()
        };
        let native = provider().translate(&request, false);
        assert_eq!(native.message, "second question");
        assert_eq!(native.preamble.as_deref(), Some("be helpful"));
        assert_eq!(native.chat_history.len(), 2);
        assert_eq!(native.chat_history[0].role, "USER");
        assert_eq!(native.chat_history[1].role, "CHATBOT");
    }

    #[test]
    fn finish_reasons_map_to_openai_vocabulary() {
        assert_eq!(map_finish_reason(Some("COMPLETE")).as_deref(), Some("stop"));
        assert_eq!(map_finish_reason(Some("MAX_TOKENS")).as_deref(), Some("length"));
    }
}
