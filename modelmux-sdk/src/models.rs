//! # Request and Response Types
//!
//! Core data structures shared by the gateway surface and the provider
//! adapters. The wire shapes follow the OpenAI chat/completions schema; every
//! adapter translates between these types and its provider's native format.
//!
//! Two layers live here:
//!
//! - The **wire types** (`ChatRequest`, `ChatResponse`, `StreamChunk`, ...)
//!   that clients send and receive.
//! - The **normalized request** (`RouteRequest`) that the routing engine
//!   operates on: an immutable bundle carrying the request id, kind, deadline
//!   and caller identity alongside the chat body.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Chat completion request in the OpenAI-compatible shape.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatRequest {
    /// The model to use for completion
    pub model: String,
    /// The conversation to generate a response for
    pub messages: Vec<Message>,
    /// Controls randomness (0.0 to 2.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Maximum number of tokens to generate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Nucleus sampling cutoff (0.0 to 1.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Whether to stream the response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    /// Sequences that stop generation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    /// Tools available for the model to use
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    /// How the model should use tools
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    /// Output format constraint, e.g. `{"type": "json_object"}`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    /// Caller-supplied end-user identifier, passed through to the provider
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Legacy text completion request (`POST /v1/completions`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Chat completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Unique identifier for the completion
    pub id: String,
    /// Object type, `"chat.completion"`
    pub object: String,
    /// Unix timestamp of creation
    pub created: u64,
    /// Model that produced the completion
    pub model: String,
    /// Generated completions
    pub choices: Vec<Choice>,
    /// Token usage statistics
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// A message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// Role of a message sender.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Hash, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A generated completion choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    pub finish_reason: Option<String>,
}

/// Token usage statistics, passed through from the provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: Function,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Mode(String),
    Specific {
        #[serde(rename = "type")]
        choice_type: String,
        function: FunctionChoice,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionChoice {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

/// Output format constraint for the completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub format_type: String,
}

/// One server-sent chunk of a streaming completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub id: String,
    /// Object type, `"chat.completion.chunk"`
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<StreamChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// What kind of completion a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Chat,
    Completion,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Chat => "chat",
            RequestKind::Completion => "completion",
        }
    }
}

/// Normalized request entity the routing engine operates on.
///
/// Immutable after creation. `deadline` bounds every downstream operation:
/// upstream dispatches, cache waits and condensation all derive their
/// timeouts from the time remaining on it.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    /// Unique request id, also used as the correlation id in error bodies
    pub id: String,
    pub kind: RequestKind,
    /// The chat-shaped body. Legacy completion requests are bridged into
    /// this form before routing and bridged back at the facade.
    pub body: ChatRequest,
    /// Identity of the caller credential, when authenticated
    pub user_key_id: Option<String>,
    pub arrived_at: Instant,
    pub deadline: Instant,
}

impl RouteRequest {
    /// Normalize a chat request, assigning an id and computing the deadline
    /// from the client timeout budget.
    pub fn chat(body: ChatRequest, user_key_id: Option<String>, client_timeout: Duration) -> Self {
        let arrived_at = Instant::now();
        Self {
            id: format!("req-{}", uuid::Uuid::new_v4().simple()),
            kind: RequestKind::Chat,
            body,
            user_key_id,
            arrived_at,
            deadline: arrived_at + client_timeout,
        }
    }

    /// Normalize a legacy completion request by bridging the prompt into a
    /// single user message.
    pub fn completion(
        req: CompletionRequest,
        user_key_id: Option<String>,
        client_timeout: Duration,
    ) -> Self {
        let body = ChatRequest {
            model: req.model,
            messages: vec![Message::user(req.prompt)],
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            top_p: req.top_p,
            stream: req.stream,
            stop: req.stop,
            user: req.user,
            ..ChatRequest::default()
        };
        let mut this = Self::chat(body, user_key_id, client_timeout);
        this.kind = RequestKind::Completion;
        this
    }

    pub fn is_stream(&self) -> bool {
        self.body.stream.unwrap_or(false)
    }

    /// Time left before the request deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Replace the conversation with a condensed one, keeping everything
    /// else intact.
    pub fn with_messages(&self, messages: Vec<Message>) -> Self {
        let mut cloned = self.clone();
        cloned.body.messages = messages;
        cloned
    }
}

/// Current unix timestamp in seconds, used when stamping responses.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
