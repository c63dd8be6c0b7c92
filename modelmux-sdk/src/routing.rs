//! # Routing Engine
//!
//! Per-request provider selection with fallback. The lifecycle for one
//! request:
//!
//! 1. Global rate-limit admission.
//! 2. For non-streaming requests, a cache lookup keyed by the request
//!    fingerprint; concurrent misses coalesce into one upstream call.
//! 3. Context condensation when the conversation is oversized.
//! 4. An ordered candidate walk: per-provider rate limit, circuit-breaker
//!    permit, then dispatch with the smaller of the provider timeout and
//!    the remaining deadline.
//! 5. Transient failures retry on the same provider with jittered
//!    exponential backoff, then fall through to the next candidate;
//!    permanent failures surface immediately with no fallback.
//!
//! Streaming requests skip the cache. The engine commits to a provider at
//! the first emitted chunk: failures before it may fall back, failures
//! after it terminate the stream, because already-delivered tokens cannot
//! be retracted.

use crate::cache::{Flight, ResponseCache};
use crate::condenser::ContextCondenser;
use crate::error::ProviderError;
use crate::fingerprint::request_fingerprint;
use crate::models::{ChatResponse, RouteRequest, StreamChunk};
use crate::providers::ChunkStream;
use crate::rate_limit::{Admission, BucketConfig, RateLimiter, Scope};
use crate::registry::{Outcome, ProviderRegistry};
use futures::StreamExt;
use rand::Rng;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Upper bound on one backoff sleep regardless of the retry schedule.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// A completed non-streaming route, with attribution for the caller.
#[derive(Debug, Clone)]
pub struct RoutedResponse {
    pub response: ChatResponse,
    /// Which provider served it; `None` when it came from the cache or an
    /// in-flight twin.
    pub provider: Option<String>,
    pub cache_hit: bool,
}

pub struct RoutingEngine {
    registry: Arc<ProviderRegistry>,
    cache: Arc<ResponseCache>,
    limiter: Arc<RateLimiter>,
    condenser: Arc<ContextCondenser>,
    /// Process-wide admission bucket, when configured
    global_bucket: RwLock<Option<BucketConfig>>,
}

impl RoutingEngine {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        cache: Arc<ResponseCache>,
        limiter: Arc<RateLimiter>,
        condenser: Arc<ContextCondenser>,
    ) -> Self {
        Self {
            registry,
            cache,
            limiter,
            condenser,
            global_bucket: RwLock::new(None),
        }
    }

    pub fn set_global_bucket(&self, bucket: Option<BucketConfig>) {
        *self.global_bucket.write().unwrap() = bucket;
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn condenser(&self) -> &Arc<ContextCondenser> {
        &self.condenser
    }

    /// Execute a non-streaming request through cache, condenser and the
    /// candidate walk.
    pub async fn execute(&self, request: &RouteRequest) -> Result<RoutedResponse, ProviderError> {
        self.admit_global()?;

        // The fingerprint is computed for every request; streaming
        // requests skip the lookup because chunked replies are never
        // cached.
        let fingerprint = request_fingerprint(request);
        if request.is_stream() {
            return self.run(request).await.map(|(response, provider)| RoutedResponse {
                response,
                provider: Some(provider),
                cache_hit: false,
            });
        }

        match self.cache.lookup_or_lead(&fingerprint) {
            Flight::Hit(response) => {
                tracing::debug!(request = %request.id, "response cache hit");
                Ok(RoutedResponse {
                    response,
                    provider: None,
                    cache_hit: true,
                })
            }
            Flight::Leader(token) => {
                let outcome = self.run(request).await;
                // A response that arrived after the requester's deadline is
                // shared with waiters but never stored.
                let in_time = request.remaining() > Duration::ZERO;
                let shared = outcome.as_ref().map(|(response, _)| response.clone());
                self.cache.publish(token, shared.map_err(|e| e.clone()), in_time);
                outcome.map(|(response, provider)| RoutedResponse {
                    response,
                    provider: Some(provider),
                    cache_hit: false,
                })
            }
            Flight::Follower(mut rx) => {
                tracing::debug!(request = %request.id, "joining in-flight request");
                match tokio::time::timeout(request.remaining(), rx.recv()).await {
                    Ok(Ok(outcome)) => outcome.map(|response| RoutedResponse {
                        response,
                        provider: None,
                        cache_hit: false,
                    }),
                    Ok(Err(_)) => Err(ProviderError::Internal {
                        message: "in-flight broadcast closed".to_string(),
                    }),
                    Err(_) => Err(ProviderError::CacheTimeout),
                }
            }
        }
    }

    /// Execute a streaming request. No cache; commit at first chunk.
    /// Returns the stream and the provider it committed to.
    pub async fn execute_stream(
        &self,
        request: &RouteRequest,
    ) -> Result<(ChunkStream, String), ProviderError> {
        self.admit_global()?;
        let request = self.condensed(request).await?;

        let candidates = self.registry.select_candidates(&request.body.model);
        if candidates.is_empty() {
            return Err(ProviderError::NoProviderAvailable { last: None });
        }

        let mut last: Option<ProviderError> = None;
        for name in &candidates {
            match self.try_stream_provider(&request, name).await {
                Ok(Some(stream)) => return Ok((stream, name.clone())),
                Ok(None) => continue,
                Err(e) if e.is_transient() => last = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(ProviderError::NoProviderAvailable {
            last: last.map(Box::new),
        })
    }

    fn admit_global(&self) -> Result<(), ProviderError> {
        let Some(bucket) = *self.global_bucket.read().unwrap() else {
            return Ok(());
        };
        match self.limiter.try_acquire(Scope::Global, "all", bucket, 1) {
            Admission::Granted => Ok(()),
            Admission::RetryAfter(wait) => Err(ProviderError::RateLimited {
                retry_after: Some(wait),
            }),
        }
    }

    /// Apply condensation, substituting the conversation when it shrank.
    async fn condensed(&self, request: &RouteRequest) -> Result<RouteRequest, ProviderError> {
        let primary = self
            .registry
            .select_candidates(&request.body.model)
            .into_iter()
            .next();
        match self
            .condenser
            .condense(request, &self.registry, primary.as_deref(), false)
            .await?
        {
            Some(messages) => Ok(request.with_messages(messages)),
            None => Ok(request.clone()),
        }
    }

    async fn run(&self, request: &RouteRequest) -> Result<(ChatResponse, String), ProviderError> {
        let request = self.condensed(request).await?;
        match self.try_candidates(&request).await {
            // One forced condensation retry when the upstream itself says
            // the context is too large despite our estimate.
            Err(ProviderError::Upstream4xx { message, status })
                if self.condenser.matches_context_error(&message) =>
            {
                tracing::info!(
                    request = %request.id,
                    "upstream rejected context size, condensing and retrying"
                );
                let primary = self
                    .registry
                    .select_candidates(&request.body.model)
                    .into_iter()
                    .next();
                match self
                    .condenser
                    .condense(&request, &self.registry, primary.as_deref(), true)
                    .await?
                {
                    Some(messages) => {
                        let condensed = request.with_messages(messages);
                        self.try_candidates(&condensed).await
                    }
                    None => Err(ProviderError::Upstream4xx { message, status }),
                }
            }
            outcome => outcome,
        }
    }

    /// Walk the candidate list until success, a permanent error, or
    /// exhaustion.
    async fn try_candidates(
        &self,
        request: &RouteRequest,
    ) -> Result<(ChatResponse, String), ProviderError> {
        let candidates = self.registry.select_candidates(&request.body.model);
        if candidates.is_empty() {
            return Err(ProviderError::NoProviderAvailable { last: None });
        }

        let mut last: Option<ProviderError> = None;
        for name in &candidates {
            let Some(entry) = self.registry.entry(name) else {
                continue;
            };
            let config = entry.config();

            if let Some(rph) = config.rate_limit {
                let bucket = BucketConfig::per_hour(rph, None);
                if let Admission::RetryAfter(wait) =
                    self.limiter.try_acquire(Scope::Provider, name, bucket, 1)
                {
                    tracing::debug!(provider = %name, "provider bucket exhausted, skipping");
                    last = Some(ProviderError::RateLimited {
                        retry_after: Some(wait),
                    });
                    continue;
                }
            }

            let _guard = self.registry.begin_request(name);
            let attempts = config.retry_attempts.max(1);
            let mut attempt = 0;

            loop {
                if !entry.breaker.permit() {
                    tracing::debug!(provider = %name, "breaker rejected call");
                    last = Some(ProviderError::BreakerOpen {
                        provider: name.clone(),
                    });
                    break;
                }

                let remaining = request.remaining();
                if remaining.is_zero() {
                    return Err(last.take().unwrap_or(ProviderError::Timeout));
                }

                let started = Instant::now();
                let result = entry
                    .adapter()
                    .dispatch(request.body.clone(), config.timeout.min(remaining))
                    .await;
                let latency = started.elapsed();

                match result {
                    Ok(response) => {
                        self.registry.record(name, Outcome::Success { latency });
                        tracing::debug!(
                            request = %request.id,
                            provider = %name,
                            latency_ms = latency.as_millis() as u64,
                            "dispatch succeeded"
                        );
                        return Ok((response, name.clone()));
                    }
                    Err(e) if e.is_transient() => {
                        tracing::warn!(
                            request = %request.id,
                            provider = %name,
                            error = %e,
                            attempt,
                            "transient dispatch failure"
                        );
                        self.registry.record(
                            name,
                            Outcome::Failure {
                                breaker: e.is_breaker_failure(),
                            },
                        );
                        last = Some(e);

                        attempt += 1;
                        if attempt >= attempts {
                            break;
                        }
                        let delay = backoff_delay(config.retry_delay, attempt - 1);
                        if request.remaining() <= delay {
                            break;
                        }
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => {
                        self.registry.record(
                            name,
                            Outcome::Failure {
                                breaker: e.is_breaker_failure(),
                            },
                        );
                        tracing::warn!(
                            request = %request.id,
                            provider = %name,
                            error = %e,
                            "permanent dispatch failure"
                        );
                        return Err(e);
                    }
                }
            }
        }

        Err(ProviderError::NoProviderAvailable {
            last: last.map(Box::new),
        })
    }

    /// One provider's streaming attempt, including same-provider retries
    /// for pre-stream transient failures.
    ///
    /// `Ok(None)` means "skip this provider" (admission or breaker);
    /// transient errors bubble up so the caller can try the next candidate.
    async fn try_stream_provider(
        &self,
        request: &RouteRequest,
        name: &str,
    ) -> Result<Option<ChunkStream>, ProviderError> {
        let Some(entry) = self.registry.entry(name) else {
            return Ok(None);
        };
        let config = entry.config();

        if let Some(rph) = config.rate_limit {
            let bucket = BucketConfig::per_hour(rph, None);
            if !self
                .limiter
                .try_acquire(Scope::Provider, name, bucket, 1)
                .is_granted()
            {
                return Ok(None);
            }
        }

        let guard = self.registry.begin_request(name);
        let attempts = config.retry_attempts.max(1);
        let mut attempt = 0;
        let mut last: Option<ProviderError> = None;

        loop {
            if !entry.breaker.permit() {
                return Ok(None);
            }
            let remaining = request.remaining();
            if remaining.is_zero() {
                return Err(last.unwrap_or(ProviderError::Timeout));
            }

            let started = Instant::now();
            let attempt_result = entry
                .adapter()
                .stream(request.body.clone(), config.timeout.min(remaining))
                .await;

            match attempt_result {
                Ok(mut stream) => {
                    // Pull the first chunk: an error before it is still a
                    // pre-stream failure and may fall back.
                    match stream.next().await {
                        Some(Ok(first)) => {
                            let latency = started.elapsed();
                            self.registry.record(name, Outcome::Success { latency });
                            return Ok(Some(self.committed_stream(
                                name.to_string(),
                                first,
                                stream,
                                guard,
                            )));
                        }
                        Some(Err(e)) if e.is_transient() => {
                            self.registry.record(
                                name,
                                Outcome::Failure {
                                    breaker: e.is_breaker_failure(),
                                },
                            );
                            last = Some(e);
                        }
                        Some(Err(e)) => {
                            self.registry.record(
                                name,
                                Outcome::Failure {
                                    breaker: e.is_breaker_failure(),
                                },
                            );
                            return Err(e);
                        }
                        None => {
                            // An empty stream is a completed response.
                            let latency = started.elapsed();
                            self.registry.record(name, Outcome::Success { latency });
                            return Ok(Some(Box::pin(futures::stream::empty())));
                        }
                    }
                }
                Err(e) if e.is_transient() => {
                    self.registry.record(
                        name,
                        Outcome::Failure {
                            breaker: e.is_breaker_failure(),
                        },
                    );
                    last = Some(e);
                }
                Err(e) => {
                    self.registry.record(
                        name,
                        Outcome::Failure {
                            breaker: e.is_breaker_failure(),
                        },
                    );
                    return Err(e);
                }
            }

            attempt += 1;
            if attempt >= attempts {
                return Err(last.unwrap_or(ProviderError::Timeout));
            }
            let delay = backoff_delay(config.retry_delay, attempt - 1);
            if request.remaining() <= delay {
                return Err(last.unwrap_or(ProviderError::Timeout));
            }
            tokio::time::sleep(delay).await;
        }
    }

    /// Post-commit stream: replays the first chunk, forwards the rest, and
    /// records a breaker failure if the stream dies mid-flight. No
    /// mid-stream fallback.
    fn committed_stream(
        &self,
        provider: String,
        first: StreamChunk,
        mut rest: ChunkStream,
        guard: Option<crate::registry::RequestGuard>,
    ) -> ChunkStream {
        let registry = Arc::clone(&self.registry);
        let stream = async_stream::stream! {
            // Holds the in-flight count for the life of the stream.
            let _guard = guard;
            yield Ok(first);
            while let Some(item) = rest.next().await {
                match item {
                    Ok(chunk) => yield Ok(chunk),
                    Err(e) => {
                        tracing::warn!(provider = %provider, error = %e, "stream failed mid-flight");
                        registry.record(
                            &provider,
                            Outcome::Failure { breaker: e.is_breaker_failure() },
                        );
                        yield Err(e);
                        return;
                    }
                }
            }
        };
        Box::pin(stream)
    }
}

/// Exponential backoff with 20 percent jitter either way.
fn backoff_delay(base: Duration, exponent: u32) -> Duration {
    let scaled = base.saturating_mul(2u32.saturating_pow(exponent));
    let capped = scaled.min(MAX_BACKOFF);
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    capped.mul_f64(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheSettings;
    use crate::circuit_breaker::{BreakerConfig, BreakerState};
    use crate::condenser::{CondensationConfig, ContextCondenser};
    use crate::models::{ChatRequest, Message};
    use crate::providers::{ProviderConfig, ProviderKind};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn completion_body(text: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "chatcmpl-42",
            "object": "chat.completion",
            "created": 1,
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": text},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8}
        })
    }

    fn provider_config(name: &str, priority: i32, base_url: &str) -> ProviderConfig {
        std::env::set_var("MODELMUX_TEST_API_KEY", "sk-test");
        let mut config = ProviderConfig::new(name, ProviderKind::OpenAi, "MODELMUX_TEST_API_KEY")
            .with_models(&["gpt-4o"])
            .with_priority(priority)
            .with_base_url(base_url);
        config.retry_attempts = 2;
        config.retry_delay = Duration::from_millis(10);
        config
    }

    fn engine_for(configs: &[ProviderConfig], breaker: BreakerConfig) -> RoutingEngine {
        let registry = Arc::new(ProviderRegistry::new(breaker.clone()));
        let errors = registry.apply_config(configs, breaker);
        assert!(errors.is_empty(), "{errors:?}");
        RoutingEngine::new(
            registry,
            Arc::new(ResponseCache::new(CacheSettings::default())),
            Arc::new(RateLimiter::new()),
            Arc::new(ContextCondenser::new(
                CondensationConfig::default(),
                CacheSettings::default(),
            )),
        )
    }

    fn chat_request(content: &str) -> RouteRequest {
        RouteRequest::chat(
            ChatRequest {
                model: "gpt-4o".to_string(),
                messages: vec![Message::user(content)],
                ..ChatRequest::default()
            },
            None,
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn happy_path_returns_the_upstream_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("hi there")))
            .mount(&server)
            .await;

        let engine = engine_for(
            &[provider_config("solo", 1, &server.uri())],
            BreakerConfig::default(),
        );
        let routed = engine.execute(&chat_request("hello")).await.unwrap();
        assert_eq!(routed.response.choices[0].message.content, "hi there");
        assert_eq!(routed.provider.as_deref(), Some("solo"));
        assert!(!routed.cache_hit);
    }

    #[tokio::test]
    async fn transient_5xx_falls_back_to_the_next_candidate() {
        let broken = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(502))
            .expect(2) // retry_attempts on the same provider before falling through
            .mount(&broken)
            .await;

        let healthy = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("from p2")))
            .expect(1)
            .mount(&healthy)
            .await;

        let engine = engine_for(
            &[
                provider_config("p1", 1, &broken.uri()),
                provider_config("p2", 2, &healthy.uri()),
            ],
            BreakerConfig::default(),
        );

        let routed = engine.execute(&chat_request("hello")).await.unwrap();
        assert_eq!(routed.response.choices[0].message.content, "from p2");
        assert_eq!(routed.provider.as_deref(), Some("p2"));

        // Both failed attempts were recorded against p1.
        let entry = engine.registry().entry("p1").unwrap();
        assert_eq!(entry.failed_requests(), 2);
    }

    #[tokio::test]
    async fn sustained_failures_open_the_breaker_and_skip_the_provider() {
        let broken = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&broken)
            .await;
        let healthy = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("ok")))
            .mount(&healthy)
            .await;

        let breaker = BreakerConfig {
            failure_threshold: 4,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
            window_size: 10,
        };
        let engine = engine_for(
            &[
                provider_config("p1", 1, &broken.uri()),
                provider_config("p2", 2, &healthy.uri()),
            ],
            breaker,
        );

        // Two requests at two failing attempts each cross the threshold.
        for i in 0..2 {
            let routed = engine.execute(&chat_request(&format!("req {i}"))).await.unwrap();
            assert_eq!(routed.response.choices[0].message.content, "ok");
        }
        let p1 = engine.registry().entry("p1").unwrap();
        assert_eq!(p1.breaker.state(), BreakerState::Open);

        // Subsequent requests no longer consider p1 at all.
        let hits_before = p1.total_requests();
        let routed = engine.execute(&chat_request("next")).await.unwrap();
        assert_eq!(routed.response.choices[0].message.content, "ok");
        assert_eq!(p1.total_requests(), hits_before);
    }

    #[tokio::test]
    async fn breaker_recovers_through_half_open() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("recovered")))
            .mount(&server)
            .await;

        let breaker = BreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
            half_open_max_calls: 1,
            window_size: 5,
        };
        let engine = engine_for(&[provider_config("p1", 1, &server.uri())], breaker);

        let p1 = engine.registry().entry("p1").unwrap();
        p1.breaker.force_open();
        tokio::time::sleep(Duration::from_millis(60)).await;

        // The recovery-timeout lapse admits one probe call, which succeeds
        // and closes the breaker.
        let routed = engine.execute(&chat_request("probe")).await.unwrap();
        assert_eq!(routed.response.choices[0].message.content, "recovered");
        assert_eq!(p1.breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn permanent_4xx_surfaces_without_fallback() {
        let rejecting = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(422)
                    .set_body_json(serde_json::json!({"error": {"message": "bad tool schema"}})),
            )
            .expect(1)
            .mount(&rejecting)
            .await;
        let never_called = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("nope")))
            .expect(0)
            .mount(&never_called)
            .await;

        let engine = engine_for(
            &[
                provider_config("p1", 1, &rejecting.uri()),
                provider_config("p2", 2, &never_called.uri()),
            ],
            BreakerConfig::default(),
        );

        let err = engine.execute(&chat_request("hello")).await.unwrap_err();
        assert!(matches!(err, ProviderError::Upstream4xx { status: 422, .. }));
    }

    #[tokio::test]
    async fn exhausted_provider_bucket_skips_to_the_next_candidate() {
        let limited = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("limited")))
            .expect(1)
            .mount(&limited)
            .await;
        let overflow = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("overflow")))
            .expect(1)
            .mount(&overflow)
            .await;

        let mut p1 = provider_config("p1", 1, &limited.uri());
        p1.rate_limit = Some(1); // bucket of one, refilling hourly
        let engine = engine_for(
            &[p1, provider_config("p2", 2, &overflow.uri())],
            BreakerConfig::default(),
        );

        let first = engine.execute(&chat_request("one")).await.unwrap();
        assert_eq!(first.response.choices[0].message.content, "limited");
        let second = engine.execute(&chat_request("two")).await.unwrap();
        assert_eq!(second.response.choices[0].message.content, "overflow");

        // Skipping for rate limiting is not a breaker failure.
        assert_eq!(
            engine.registry().entry("p1").unwrap().breaker.state(),
            BreakerState::Closed
        );
    }

    #[tokio::test]
    async fn cold_fingerprint_dispatches_exactly_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion_body("shared"))
                    .set_delay(Duration::from_millis(150)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let engine = Arc::new(engine_for(
            &[provider_config("solo", 1, &server.uri())],
            BreakerConfig::default(),
        ));

        let request = chat_request("identical body");
        let mut handles = Vec::new();
        for _ in 0..10 {
            let engine = Arc::clone(&engine);
            let request = request.clone();
            handles.push(tokio::spawn(async move { engine.execute(&request).await }));
        }

        let mut bodies = Vec::new();
        for handle in handles {
            bodies.push(handle.await.unwrap().unwrap());
        }
        assert!(bodies
            .iter()
            .all(|r| r.response.choices[0].message.content == "shared"));
    }

    #[tokio::test]
    async fn replay_within_ttl_is_served_from_cache() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("cached")))
            .expect(1)
            .mount(&server)
            .await;

        let engine = engine_for(
            &[provider_config("solo", 1, &server.uri())],
            BreakerConfig::default(),
        );

        let first = engine.execute(&chat_request("replay me")).await.unwrap();
        let second = engine.execute(&chat_request("replay me")).await.unwrap();
        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(
            serde_json::to_string(&first.response).unwrap(),
            serde_json::to_string(&second.response).unwrap()
        );
    }

    #[tokio::test]
    async fn deadline_bounds_total_wall_time() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion_body("slow"))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let engine = engine_for(
            &[provider_config("slow", 1, &server.uri())],
            BreakerConfig::default(),
        );

        let request = RouteRequest::chat(
            ChatRequest {
                model: "gpt-4o".to_string(),
                messages: vec![Message::user("hurry")],
                ..ChatRequest::default()
            },
            None,
            Duration::from_millis(300),
        );

        let started = Instant::now();
        let err = engine.execute(&request).await.unwrap_err();
        match err {
            ProviderError::Timeout => {}
            ProviderError::NoProviderAvailable { last: Some(last) } => {
                assert!(matches!(*last, ProviderError::Timeout), "last cause: {last:?}");
            }
            other => panic!("expected a deadline-driven failure, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn empty_candidate_list_is_no_provider_available() {
        let engine = engine_for(&[], BreakerConfig::default());
        let err = engine.execute(&chat_request("anyone?")).await.unwrap_err();
        assert!(matches!(err, ProviderError::NoProviderAvailable { .. }));
    }

    #[tokio::test]
    async fn global_bucket_rejects_before_any_upstream_work() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("one")))
            .expect(1)
            .mount(&server)
            .await;

        let engine = engine_for(
            &[provider_config("solo", 1, &server.uri())],
            BreakerConfig::default(),
        );
        engine.set_global_bucket(Some(BucketConfig {
            capacity: 1.0,
            refill_per_sec: 0.0,
        }));

        engine.execute(&chat_request("first")).await.unwrap();
        let err = engine.execute(&chat_request("second")).await.unwrap_err();
        assert!(matches!(err, ProviderError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn streaming_falls_back_before_the_first_chunk() {
        let broken = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&broken)
            .await;

        let sse_body = concat!(
            "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,",
            "\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hel\"},",
            "\"finish_reason\":null}]}\n\n",
            "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,",
            "\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},",
            "\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n"
        );
        let healthy = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(sse_body, "text/event-stream"),
            )
            .mount(&healthy)
            .await;

        let engine = engine_for(
            &[
                provider_config("p1", 1, &broken.uri()),
                provider_config("p2", 2, &healthy.uri()),
            ],
            BreakerConfig::default(),
        );

        let mut request = chat_request("stream please");
        request.body.stream = Some(true);

        let (mut stream, provider) = engine.execute_stream(&request).await.unwrap();
        assert_eq!(provider, "p2");
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.unwrap();
            if let Some(content) = &chunk.choices[0].delta.content {
                text.push_str(content);
            }
        }
        assert_eq!(text, "hello");
    }
}
