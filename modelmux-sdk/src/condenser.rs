//! # Context Condensation
//!
//! Shrinks oversized conversations before dispatch. When a request's
//! estimated token count exceeds the truncation threshold, the condenser
//! splits the conversation into a summarizable head and a retained tail of
//! the most recent turns, asks a secondary provider for a bounded summary of
//! the head, and substitutes it. Summaries are cached by a fingerprint of
//! the original messages so identical oversized conversations condense once.
//!
//! Summarization failures walk the configured fallback ladder:
//! `truncate_head` drops oldest messages until the request fits (always
//! succeeds), `secondary_provider` retries once on the next healthy
//! provider, and `skip` passes the request through untouched.
//!
//! Concurrency is bounded by a semaphore; arrivals beyond the queue bound
//! fail fast with `condense_overloaded` instead of piling up.

use crate::cache::{CacheSettings, MemoryCache};
use crate::error::ProviderError;
use crate::fingerprint::summary_fingerprint;
use crate::models::{ChatRequest, Message, Role, RouteRequest};
use crate::registry::ProviderRegistry;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Rough token estimator: four characters per token plus a small
/// per-message envelope overhead.
const CHARS_PER_TOKEN: usize = 4;
const PER_MESSAGE_OVERHEAD: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    TruncateHead,
    SecondaryProvider,
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CondensationConfig {
    /// Estimated-token count above which requests are condensed
    pub truncation_threshold: u32,
    /// Upper bound requested from the summarization call
    pub summary_max_tokens: u32,
    /// Most recent non-system messages always preserved verbatim
    pub retained_tail: usize,
    /// Optional multiplier on the threshold; reserved for adaptive
    /// condensation, off unless configured
    pub adaptive_factor: Option<f64>,
    /// Upstream error fragments that indicate a context overflow
    pub error_patterns: Vec<String>,
    /// Strategies tried in order when summarization fails
    pub fallback_strategies: Vec<FallbackStrategy>,
    /// Concurrent summarizations allowed
    pub concurrency_limit: usize,
    /// Arrivals allowed to queue behind the limit before failing fast
    pub queue_limit: usize,
    /// Budget for one summarization call
    #[serde(with = "crate::common::duration_serde")]
    pub timeout: Duration,
    /// Explicit summarization provider; highest-priority healthy provider
    /// otherwise
    pub provider: Option<String>,
}

impl Default for CondensationConfig {
    fn default() -> Self {
        Self {
            truncation_threshold: 8000,
            summary_max_tokens: 512,
            retained_tail: 4,
            adaptive_factor: None,
            error_patterns: vec![
                "context length".to_string(),
                "maximum context".to_string(),
                "too many tokens".to_string(),
            ],
            fallback_strategies: vec![FallbackStrategy::TruncateHead],
            concurrency_limit: 4,
            queue_limit: 16,
            timeout: Duration::from_secs(30),
            provider: None,
        }
    }
}

/// Estimate the token footprint of a conversation.
pub fn estimate_tokens(messages: &[Message]) -> u32 {
    messages
        .iter()
        .map(|m| (m.content.len() / CHARS_PER_TOKEN) as u32 + PER_MESSAGE_OVERHEAD)
        .sum()
}

pub struct ContextCondenser {
    config: RwLock<CondensationConfig>,
    summaries: MemoryCache,
    semaphore: RwLock<Arc<Semaphore>>,
    queued: AtomicUsize,
}

impl ContextCondenser {
    pub fn new(config: CondensationConfig, summary_cache: CacheSettings) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.concurrency_limit.max(1)));
        Self {
            config: RwLock::new(config),
            summaries: MemoryCache::new(summary_cache),
            semaphore: RwLock::new(semaphore),
            queued: AtomicUsize::new(0),
        }
    }

    pub fn update_config(&self, config: CondensationConfig, summary_cache: CacheSettings) {
        let limit = config.concurrency_limit.max(1);
        *self.semaphore.write().unwrap() = Arc::new(Semaphore::new(limit));
        *self.config.write().unwrap() = config;
        self.summaries.update_settings(summary_cache);
    }

    pub fn summary_cache(&self) -> &MemoryCache {
        &self.summaries
    }

    /// Whether an upstream rejection message looks like a context overflow.
    pub fn matches_context_error(&self, message: &str) -> bool {
        let lowered = message.to_lowercase();
        self.config
            .read()
            .unwrap()
            .error_patterns
            .iter()
            .any(|pattern| lowered.contains(&pattern.to_lowercase()))
    }

    fn effective_threshold(&self) -> u32 {
        let config = self.config.read().unwrap();
        match config.adaptive_factor {
            Some(factor) if factor > 0.0 => {
                (config.truncation_threshold as f64 * factor) as u32
            }
            _ => config.truncation_threshold,
        }
    }

    /// Condense a request's conversation when it is oversized.
    ///
    /// Returns `None` when the request fits and should pass through
    /// untouched. `exclude` names the provider already selected for the
    /// primary request; summarization avoids dispatching to it. `force`
    /// bypasses the threshold check after an upstream context rejection.
    pub async fn condense(
        &self,
        request: &RouteRequest,
        registry: &ProviderRegistry,
        exclude: Option<&str>,
        force: bool,
    ) -> Result<Option<Vec<Message>>, ProviderError> {
        let threshold = self.effective_threshold();
        let estimated = estimate_tokens(&request.body.messages);
        if !force && estimated <= threshold {
            return Ok(None);
        }
        tracing::debug!(
            request = %request.id,
            estimated,
            threshold,
            "conversation over threshold, condensing"
        );

        let (summary_max_tokens, timeout, fallbacks) = {
            let config = self.config.read().unwrap();
            (
                config.summary_max_tokens,
                config.timeout,
                config.fallback_strategies.clone(),
            )
        };

        let key = summary_fingerprint(&request.body.messages, summary_max_tokens);
        if let Some(condensed) = self.summaries.get::<Vec<Message>>(&key) {
            tracing::debug!(request = %request.id, "summary cache hit");
            return Ok(Some(condensed));
        }

        let (system, head, tail) = self.partition(&request.body.messages);
        if head.is_empty() {
            // Nothing summarizable; the tail alone is the conversation.
            return Ok(None);
        }

        let _permit = self.admit(timeout.min(request.remaining())).await?;

        match self
            .summarize(request, registry, exclude, None, &head, summary_max_tokens)
            .await
        {
            Ok(summary) => {
                let condensed = assemble(&system, &summary, &tail);
                self.summaries.put(&key, &condensed);
                Ok(Some(condensed))
            }
            Err(first_err) => {
                tracing::warn!(request = %request.id, error = %first_err, "summarization failed");
                self.apply_fallbacks(
                    request,
                    registry,
                    exclude,
                    &fallbacks,
                    &system,
                    &head,
                    &tail,
                    summary_max_tokens,
                    threshold,
                    first_err,
                )
                .await
            }
        }
    }

    /// Bounded admission: fail fast once the queue behind the semaphore is
    /// full, otherwise wait up to `timeout` for a permit.
    async fn admit(
        &self,
        timeout: Duration,
    ) -> Result<tokio::sync::OwnedSemaphorePermit, ProviderError> {
        let (semaphore, queue_limit) = {
            let config = self.config.read().unwrap();
            (self.semaphore.read().unwrap().clone(), config.queue_limit)
        };

        if semaphore.available_permits() == 0
            && self.queued.load(Ordering::Relaxed) >= queue_limit
        {
            return Err(ProviderError::CondenseOverloaded);
        }

        self.queued.fetch_add(1, Ordering::Relaxed);
        let permit = tokio::time::timeout(timeout, semaphore.acquire_owned()).await;
        self.queued.fetch_sub(1, Ordering::Relaxed);

        match permit {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(ProviderError::Internal {
                message: "condenser semaphore closed".to_string(),
            }),
            Err(_) => Err(ProviderError::CondenseOverloaded),
        }
    }

    /// Split a conversation into leading system messages, a summarizable
    /// head, and the retained tail of most recent turns.
    fn partition(&self, messages: &[Message]) -> (Vec<Message>, Vec<Message>, Vec<Message>) {
        let retained_tail = self.config.read().unwrap().retained_tail.max(1);

        let system: Vec<Message> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .cloned()
            .collect();
        let conversation: Vec<Message> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect();

        if conversation.len() <= retained_tail {
            return (system, Vec::new(), conversation);
        }
        let split = conversation.len() - retained_tail;
        let head = conversation[..split].to_vec();
        let tail = conversation[split..].to_vec();
        (system, head, tail)
    }

    async fn summarize(
        &self,
        request: &RouteRequest,
        registry: &ProviderRegistry,
        exclude: Option<&str>,
        also_exclude: Option<&str>,
        head: &[Message],
        summary_max_tokens: u32,
    ) -> Result<Message, ProviderError> {
        let explicit = self.config.read().unwrap().provider.clone();
        let name = self
            .pick_provider(registry, explicit.as_deref(), exclude, also_exclude)
            .ok_or_else(|| ProviderError::CondenseFailed {
                message: "no provider available for summarization".to_string(),
            })?;
        let entry = registry
            .entry(&name)
            .ok_or_else(|| ProviderError::CondenseFailed {
                message: format!("summarization provider {name} disappeared"),
            })?;

        let config = entry.config();
        let model = config.models.first().cloned().ok_or_else(|| {
            ProviderError::CondenseFailed {
                message: format!("summarization provider {name} has no models"),
            }
        })?;

        let transcript = head
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let summary_request = ChatRequest {
            model,
            messages: vec![
                Message::system(format!(
                    "Summarize the conversation below, preserving facts, decisions and open \
                     questions. Respond with only the summary, at most {summary_max_tokens} tokens."
                )),
                Message::user(transcript),
            ],
            max_tokens: Some(summary_max_tokens),
            temperature: Some(0.2),
            ..ChatRequest::default()
        };

        let timeout = self
            .config
            .read()
            .unwrap()
            .timeout
            .min(request.remaining())
            .min(config.timeout);

        let adapter = entry.adapter();
        tracing::debug!(request = %request.id, provider = %name, "dispatching summarization");
        let response = adapter.dispatch(summary_request, timeout).await?;
        let text = response
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| ProviderError::CondenseFailed {
                message: "summarization returned an empty completion".to_string(),
            })?;

        Ok(Message::system(format!(
            "Summary of the earlier conversation: {text}"
        )))
    }

    /// The explicit provider when configured, otherwise the best healthy
    /// candidate that is not excluded.
    fn pick_provider(
        &self,
        registry: &ProviderRegistry,
        explicit: Option<&str>,
        exclude: Option<&str>,
        also_exclude: Option<&str>,
    ) -> Option<String> {
        if let Some(name) = explicit {
            if registry.entry(name).is_some() && Some(name) != also_exclude {
                return Some(name.to_string());
            }
        }
        // Candidate ordering already encodes priority and health; reuse it
        // with the first model any provider serves.
        for entry_name in registry.names() {
            let Some(entry) = registry.entry(&entry_name) else {
                continue;
            };
            for model in entry.config().models {
                for candidate in registry.select_candidates(&model) {
                    if Some(candidate.as_str()) != exclude
                        && Some(candidate.as_str()) != also_exclude
                    {
                        return Some(candidate);
                    }
                }
            }
        }
        None
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_fallbacks(
        &self,
        request: &RouteRequest,
        registry: &ProviderRegistry,
        exclude: Option<&str>,
        fallbacks: &[FallbackStrategy],
        system: &[Message],
        head: &[Message],
        tail: &[Message],
        summary_max_tokens: u32,
        threshold: u32,
        first_err: ProviderError,
    ) -> Result<Option<Vec<Message>>, ProviderError> {
        let mut last_err = first_err;
        for strategy in fallbacks {
            match strategy {
                FallbackStrategy::TruncateHead => {
                    let truncated = truncate_head(system, head, tail, threshold);
                    tracing::info!(request = %request.id, "condensation fell back to head truncation");
                    return Ok(Some(truncated));
                }
                FallbackStrategy::SecondaryProvider => {
                    let explicit = self.config.read().unwrap().provider.clone();
                    match self
                        .summarize(
                            request,
                            registry,
                            exclude,
                            explicit.as_deref(),
                            head,
                            summary_max_tokens,
                        )
                        .await
                    {
                        Ok(summary) => {
                            let condensed = assemble(system, &summary, tail);
                            let key =
                                summary_fingerprint(&request.body.messages, summary_max_tokens);
                            self.summaries.put(&key, &condensed);
                            return Ok(Some(condensed));
                        }
                        Err(e) => last_err = e,
                    }
                }
                FallbackStrategy::Skip => {
                    tracing::info!(request = %request.id, "condensation skipped after failure");
                    return Ok(None);
                }
            }
        }
        Err(ProviderError::CondenseFailed {
            message: last_err.to_string(),
        })
    }
}

fn assemble(system: &[Message], summary: &Message, tail: &[Message]) -> Vec<Message> {
    let mut condensed = Vec::with_capacity(system.len() + 1 + tail.len());
    condensed.extend_from_slice(system);
    condensed.push(summary.clone());
    condensed.extend_from_slice(tail);
    condensed
}

/// Drop oldest head messages until the conversation fits the threshold.
/// Falls back to the tail alone, and then to trimming the tail itself, so
/// the result is always under the threshold or a single final message.
fn truncate_head(
    system: &[Message],
    head: &[Message],
    tail: &[Message],
    threshold: u32,
) -> Vec<Message> {
    let mut kept_head: &[Message] = head;
    loop {
        let mut candidate = Vec::with_capacity(system.len() + kept_head.len() + tail.len());
        candidate.extend_from_slice(system);
        candidate.extend_from_slice(kept_head);
        candidate.extend_from_slice(tail);
        if estimate_tokens(&candidate) <= threshold || candidate.len() <= 1 {
            return candidate;
        }
        if kept_head.is_empty() {
            // Head is gone; trim the oldest tail messages too.
            let mut tail_kept = tail;
            while tail_kept.len() > 1 {
                tail_kept = &tail_kept[1..];
                let mut candidate = Vec::with_capacity(system.len() + tail_kept.len());
                candidate.extend_from_slice(system);
                candidate.extend_from_slice(tail_kept);
                if estimate_tokens(&candidate) <= threshold || candidate.len() <= 1 {
                    return candidate;
                }
            }
            let mut candidate = Vec::with_capacity(system.len() + 1);
            candidate.extend_from_slice(system);
            if let Some(last) = tail_kept.last() {
                candidate.push(last.clone());
            }
            return candidate;
        }
        kept_head = &kept_head[1..];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::BreakerConfig;
    use crate::providers::{ProviderConfig, ProviderKind};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn condenser(threshold: u32) -> ContextCondenser {
        let config = CondensationConfig {
            truncation_threshold: threshold,
            retained_tail: 2,
            ..CondensationConfig::default()
        };
        ContextCondenser::new(config, CacheSettings::default())
    }

    fn long_conversation(turns: usize, chars_per_turn: usize) -> Vec<Message> {
        let mut messages = vec![Message::system("be helpful")];
        for i in 0..turns {
            messages.push(Message::user(format!("{i} {}", "q".repeat(chars_per_turn))));
            messages.push(Message::assistant(format!("{i} {}", "a".repeat(chars_per_turn))));
        }
        messages
    }

    fn routed(messages: Vec<Message>) -> RouteRequest {
        RouteRequest::chat(
            ChatRequest {
                model: "gpt-4o".to_string(),
                messages,
                ..ChatRequest::default()
            },
            None,
            Duration::from_secs(30),
        )
    }

    async fn registry_with_mock(server: &MockServer) -> ProviderRegistry {
        std::env::set_var("MODELMUX_TEST_API_KEY", "sk-test");
        let config = ProviderConfig::new("summarizer", ProviderKind::OpenAi, "MODELMUX_TEST_API_KEY")
            .with_models(&["gpt-4o"])
            .with_base_url(server.uri());
        let registry = ProviderRegistry::new(BreakerConfig::default());
        let errors = registry.apply_config(std::slice::from_ref(&config), BreakerConfig::default());
        assert!(errors.is_empty());
        registry
    }

    fn completion_body(text: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1,
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": text},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        })
    }

    #[test]
    fn estimation_tracks_characters() {
        let messages = vec![Message::user("x".repeat(400))];
        assert_eq!(estimate_tokens(&messages), 104);
    }

    #[tokio::test]
    async fn under_threshold_passes_through() {
        let server = MockServer::start().await;
        let registry = registry_with_mock(&server).await;
        let condenser = condenser(100_000);
        let request = routed(long_conversation(4, 100));
        let result = condenser
            .condense(&request, &registry, None, false)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn oversized_conversations_are_summarized_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("the gist")))
            .expect(1)
            .mount(&server)
            .await;
        let registry = registry_with_mock(&server).await;
        let condenser = condenser(100);

        let request = routed(long_conversation(10, 200));
        let condensed = condenser
            .condense(&request, &registry, None, false)
            .await
            .unwrap()
            .expect("conversation should condense");

        // System prompt kept, summary injected, last two turns retained.
        assert_eq!(condensed[0].role, Role::System);
        assert!(condensed[1].content.contains("the gist"));
        assert_eq!(condensed.len(), 1 + 1 + 2);

        // Identical request hits the summary cache; the mock's expect(1)
        // verifies no second upstream call happens.
        let again = condenser
            .condense(&request, &registry, None, false)
            .await
            .unwrap()
            .expect("cache hit should still substitute");
        assert_eq!(again[1].content, condensed[1].content);
    }

    #[tokio::test]
    async fn summarizer_failure_truncates_head() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let registry = registry_with_mock(&server).await;
        let condenser = condenser(150);

        let request = routed(long_conversation(10, 200));
        let condensed = condenser
            .condense(&request, &registry, None, false)
            .await
            .unwrap()
            .expect("truncate_head always yields a passable request");
        assert!(estimate_tokens(&condensed) <= 150 || condensed.len() <= 1);
    }

    #[tokio::test]
    async fn skip_fallback_passes_through() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let registry = registry_with_mock(&server).await;

        let config = CondensationConfig {
            truncation_threshold: 100,
            fallback_strategies: vec![FallbackStrategy::Skip],
            ..CondensationConfig::default()
        };
        let condenser = ContextCondenser::new(config, CacheSettings::default());

        let request = routed(long_conversation(10, 200));
        let result = condenser
            .condense(&request, &registry, None, false)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn saturated_queue_fails_fast() {
        let server = MockServer::start().await;
        let registry = registry_with_mock(&server).await;

        let config = CondensationConfig {
            truncation_threshold: 100,
            concurrency_limit: 1,
            queue_limit: 0,
            ..CondensationConfig::default()
        };
        let condenser = ContextCondenser::new(config, CacheSettings::default());

        // Hold the only permit so the next arrival sees a full queue.
        let semaphore = condenser.semaphore.read().unwrap().clone();
        let _held = semaphore.try_acquire_owned().unwrap();

        let request = routed(long_conversation(10, 200));
        let err = condenser
            .condense(&request, &registry, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::CondenseOverloaded));
    }

    #[test]
    fn context_error_patterns_match_case_insensitively() {
        let condenser = condenser(100);
        assert!(condenser.matches_context_error("This model's maximum CONTEXT LENGTH is 8192"));
        assert!(!condenser.matches_context_error("invalid api key"));
    }
}
