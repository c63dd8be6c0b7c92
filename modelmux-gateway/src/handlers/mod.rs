//! # HTTP Handlers
//!
//! The OpenAI-compatible surface plus the operational endpoints: chat and
//! legacy completions (streaming and not), the model catalog, provider
//! administration, health probes, metrics, cache statistics and
//! invalidation, and configuration reload.
//!
//! Handlers translate between the wire and the normalized [`RouteRequest`],
//! hand the work to the routing engine, and record metrics on the way out.
//! All policy (fallback, retries, caching) lives in the engine.

use crate::auth::AuthContext;
use crate::gateway_error::GatewayError;
use crate::server::AppState;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{Response, StatusCode};
use axum::response::Json;
use axum::Extension;
use futures::StreamExt;
use modelmux_sdk::models::{
    unix_now, ChatRequest, ChatResponse, CompletionRequest, RouteRequest,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::time::Instant;

/// `POST /v1/chat/completions`
pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthContext>,
    Json(request): Json<ChatRequest>,
) -> Result<Response<Body>, GatewayError> {
    validate_chat_request(&request)?;
    let routed = RouteRequest::chat(
        request,
        Some(caller.user_key_id.clone()),
        state.config().server.client_timeout,
    );

    if routed.is_stream() {
        stream_response(state, routed, "/v1/chat/completions").await
    } else {
        let started = Instant::now();
        let result = state.engine.execute(&routed).await;
        let response = record_completion(
            &state,
            "/v1/chat/completions",
            started,
            result,
            true,
        )?;
        json_response(&response)
    }
}

/// `POST /v1/completions`: the legacy prompt surface, bridged through the
/// chat path and translated back.
pub async fn completions(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthContext>,
    Json(request): Json<CompletionRequest>,
) -> Result<Response<Body>, GatewayError> {
    if request.model.is_empty() {
        return Err(GatewayError::InvalidRequest {
            message: "model must not be empty".to_string(),
        });
    }
    if request.prompt.is_empty() {
        return Err(GatewayError::InvalidRequest {
            message: "prompt must not be empty".to_string(),
        });
    }
    if request.stream.unwrap_or(false) {
        return Err(GatewayError::InvalidRequest {
            message: "streaming is not supported on /v1/completions; use /v1/chat/completions"
                .to_string(),
        });
    }

    let routed = RouteRequest::completion(
        request,
        Some(caller.user_key_id.clone()),
        state.config().server.client_timeout,
    );

    let started = Instant::now();
    let result = state.engine.execute(&routed).await;
    let response = record_completion(&state, "/v1/completions", started, result, true)?;

    // Translate the chat-shaped response back into the legacy schema.
    let legacy = json!({
        "id": response.id,
        "object": "text_completion",
        "created": response.created,
        "model": response.model,
        "choices": response
            .choices
            .iter()
            .map(|choice| {
                json!({
                    "index": choice.index,
                    "text": choice.message.content,
                    "finish_reason": choice.finish_reason,
                })
            })
            .collect::<Vec<_>>(),
        "usage": response.usage,
    });
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&legacy)?))
        .map_err(|e| GatewayError::Internal {
            message: e.to_string(),
        })?)
}

fn validate_chat_request(request: &ChatRequest) -> Result<(), GatewayError> {
    if request.model.is_empty() {
        return Err(GatewayError::InvalidRequest {
            message: "model must not be empty".to_string(),
        });
    }
    if request.messages.is_empty() {
        return Err(GatewayError::InvalidRequest {
            message: "messages must not be empty".to_string(),
        });
    }
    if let Some(temperature) = request.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(GatewayError::InvalidRequest {
                message: "temperature must be between 0.0 and 2.0".to_string(),
            });
        }
    }
    Ok(())
}

/// Fold one routed completion into the metrics and unwrap the response.
fn record_completion(
    state: &AppState,
    route: &'static str,
    started: Instant,
    result: Result<modelmux_sdk::routing::RoutedResponse, modelmux_sdk::ProviderError>,
    cacheable: bool,
) -> Result<ChatResponse, GatewayError> {
    let latency = started.elapsed();
    match result {
        Ok(routed) => {
            if cacheable {
                state.metrics.record_cache(routed.cache_hit);
            }
            let usage = routed.response.usage.unwrap_or_default();
            state.metrics.record(crate::metrics::RequestRecord {
                route,
                status: 200,
                latency,
                provider: routed.provider.clone(),
                prompt_tokens: u64::from(usage.prompt_tokens),
                completion_tokens: u64::from(usage.completion_tokens),
            });
            Ok(routed.response)
        }
        Err(e) => {
            state.metrics.record(crate::metrics::RequestRecord {
                route,
                status: 502,
                latency,
                provider: None,
                prompt_tokens: 0,
                completion_tokens: 0,
            });
            Err(GatewayError::Routing(e))
        }
    }
}

fn json_response(response: &ChatResponse) -> Result<Response<Body>, GatewayError> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(response)?))
        .map_err(|e| GatewayError::Internal {
            message: e.to_string(),
        })
}

/// Serve a streaming completion as server-sent events ending in `[DONE]`.
async fn stream_response(
    state: AppState,
    routed: RouteRequest,
    route: &'static str,
) -> Result<Response<Body>, GatewayError> {
    let started = Instant::now();
    let (chunks, provider) = match state.engine.execute_stream(&routed).await {
        Ok(ok) => ok,
        Err(e) => {
            state.metrics.record(crate::metrics::RequestRecord {
                route,
                status: 502,
                latency: started.elapsed(),
                provider: None,
                prompt_tokens: 0,
                completion_tokens: 0,
            });
            return Err(GatewayError::Routing(e));
        }
    };

    state.metrics.record(crate::metrics::RequestRecord {
        route,
        status: 200,
        latency: started.elapsed(),
        provider: Some(provider),
        prompt_tokens: 0,
        completion_tokens: 0,
    });

    let body = Body::from_stream(async_stream::stream! {
        let mut chunks = chunks;
        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => {
                    let data = serde_json::to_string(&chunk).unwrap_or_default();
                    yield Ok::<_, Infallible>(axum::body::Bytes::from(format!("data: {data}\n\n")));
                }
                Err(e) => {
                    // Tokens already sent cannot be retracted; surface the
                    // failure in-band and terminate.
                    let payload = json!({
                        "error": {"type": e.kind(), "message": e.to_string()}
                    });
                    yield Ok(axum::body::Bytes::from(format!("data: {payload}\n\n")));
                    break;
                }
            }
        }
        yield Ok(axum::body::Bytes::from("data: [DONE]\n\n"));
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .body(body)
        .map_err(|e| GatewayError::Internal {
            message: e.to_string(),
        })
}

/// `GET /v1/models`: union of enabled models across non-unhealthy
/// providers.
pub async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let registry = state.engine.registry();
    let mut models: Vec<(String, String)> = Vec::new();

    for name in registry.names() {
        let Some(entry) = registry.entry(&name) else {
            continue;
        };
        let config = entry.config();
        if !config.enabled {
            continue;
        }
        if registry.health_of(&name) == Some(modelmux_sdk::HealthStatus::Unhealthy) {
            continue;
        }
        for model in config.models {
            if !models.iter().any(|(id, _)| id == &model) {
                models.push((model, name.clone()));
            }
        }
    }
    models.sort();

    Json(json!({
        "object": "list",
        "data": models
            .into_iter()
            .map(|(id, owner)| json!({
                "id": id,
                "object": "model",
                "created": unix_now(),
                "owned_by": owner,
            }))
            .collect::<Vec<_>>(),
    }))
}

/// `GET /v1/providers`
pub async fn list_providers(State(state): State<AppState>) -> Json<Value> {
    let registry = state.engine.registry();
    let mut providers: Vec<Value> = registry
        .names()
        .into_iter()
        .filter_map(|name| registry.entry(&name).map(|entry| (name, entry)))
        .map(|(name, entry)| {
            let config = entry.config();
            json!({
                "name": name,
                "type": config.kind.as_str(),
                "enabled": config.enabled,
                "priority": config.priority,
                "models": config.models,
                "health": state.health.borrow().get(&name).map(|h| h.status),
                "breaker": entry.breaker_snapshot(),
                "success_rate": entry.success_rate(),
                "avg_latency_ms": entry.avg_latency_ms(),
                "in_flight": entry.in_flight(),
            })
        })
        .collect();
    providers.sort_by_key(|p| p["priority"].as_i64().unwrap_or(i64::MAX));
    Json(json!({ "providers": providers }))
}

/// `GET /v1/providers/{name}`
pub async fn provider_detail(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    let registry = state.engine.registry();
    let entry = registry.entry(&name).ok_or_else(|| GatewayError::NotFound {
        message: format!("unknown provider: {name}"),
    })?;

    let config = entry.config();
    let (probe_ok, probe_at) = entry.last_probe();
    Ok(Json(json!({
        "name": name,
        "type": config.kind.as_str(),
        "enabled": config.enabled,
        "priority": config.priority,
        "models": config.models,
        "base_url": config.base_url,
        "timeout_secs": config.timeout.as_secs(),
        "retry_attempts": config.retry_attempts,
        "rate_limit_per_hour": config.rate_limit,
        "health": state.health.borrow().get(&name).cloned(),
        "breaker": entry.breaker_snapshot(),
        "stats": {
            "success_rate": entry.success_rate(),
            "avg_latency_ms": entry.avg_latency_ms(),
            "total_requests": entry.total_requests(),
            "failed_requests": entry.failed_requests(),
            "in_flight": entry.in_flight(),
        },
        "last_probe": {"ok": probe_ok, "at": probe_at},
    })))
}

/// `GET /v1/providers/{name}/models`
pub async fn provider_models(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    let registry = state.engine.registry();
    let entry = registry.entry(&name).ok_or_else(|| GatewayError::NotFound {
        message: format!("unknown provider: {name}"),
    })?;
    Ok(Json(json!({
        "provider": name,
        "models": entry.config().models,
    })))
}

/// `POST /v1/providers/{name}/models/refresh`: probe the provider now and
/// fold the result into its statistics.
pub async fn refresh_provider_models(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    let registry = state.engine.registry();
    let entry = registry.entry(&name).ok_or_else(|| GatewayError::NotFound {
        message: format!("unknown provider: {name}"),
    })?;

    let adapter = entry.adapter();
    let started = Instant::now();
    let result = adapter.probe().await;
    let latency = started.elapsed();
    let ok = result.is_ok();
    registry.record_probe(&name, ok, ok.then_some(latency));

    Ok(Json(json!({
        "provider": name,
        "probe": if ok { "ok" } else { "failed" },
        "latency_ms": latency.as_millis() as u64,
        "models": entry.config().models,
    })))
}

/// `GET /health`: coarse service health for load balancers.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let registry = state.engine.registry();
    let total = registry.len();
    let unhealthy = registry
        .names()
        .into_iter()
        .filter(|name| {
            registry.health_of(name) == Some(modelmux_sdk::HealthStatus::Unhealthy)
        })
        .count();

    let status = if total == 0 || unhealthy == total {
        "unhealthy"
    } else if unhealthy > 0 {
        "degraded"
    } else {
        "healthy"
    };

    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": (chrono::Utc::now() - state.started_at).num_seconds(),
        "providers": {"total": total, "unhealthy": unhealthy},
    }))
}

/// `GET /health/live`
pub async fn health_live() -> Json<Value> {
    Json(json!({"status": "alive"}))
}

/// `GET /health/ready`: ready once at least one provider is selectable.
pub async fn health_ready(State(state): State<AppState>) -> Response<Body> {
    let ready = !state.engine.registry().is_empty();
    let (status, body) = if ready {
        (StatusCode::OK, json!({"status": "ready"}))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, json!({"status": "not_ready"}))
    };
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_default()
}

/// `GET /v1/health`: detailed per-provider health.
pub async fn health_detailed(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.health.borrow().clone();
    Json(json!({
        "status": "ok",
        "checked_at": chrono::Utc::now(),
        "providers": snapshot,
    }))
}

/// `GET /v1/metrics`
pub async fn metrics(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.metrics.snapshot()).unwrap_or_default())
}

/// `GET /v1/metrics/prometheus`
pub async fn metrics_prometheus(State(state): State<AppState>) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4")
        .body(Body::from(state.metrics.prometheus()))
        .unwrap_or_default()
}

/// `GET /v1/cache/stats`
pub async fn cache_stats(State(state): State<AppState>) -> Json<Value> {
    let engine = &state.engine;
    Json(json!({
        "response_cache": engine.cache().stats(),
        "summary_cache": engine.condenser().summary_cache().stats(),
        "in_flight": engine.cache().inflight_count(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct CacheInvalidateQuery {
    /// Exact key to drop
    pub key: Option<String>,
    /// Key prefix to drop, e.g. `chat:`
    pub pattern: Option<String>,
    /// Restrict to one cache: `response` or `summary`
    pub category: Option<String>,
}

/// `DELETE /v1/cache`: invalidate by key, prefix, or everything.
pub async fn cache_invalidate(
    State(state): State<AppState>,
    Query(query): Query<CacheInvalidateQuery>,
) -> Result<Json<Value>, GatewayError> {
    let engine = &state.engine;
    let response_cache = engine.cache();
    let summary_cache = engine.condenser().summary_cache();

    let (touch_response, touch_summary) = match query.category.as_deref() {
        None => (true, true),
        Some("response") => (true, false),
        Some("summary") => (false, true),
        Some(other) => {
            return Err(GatewayError::InvalidRequest {
                message: format!("unknown cache category: {other}"),
            })
        }
    };

    let mut removed = 0usize;
    if let Some(key) = &query.key {
        if touch_response && response_cache.invalidate(key) {
            removed += 1;
        }
        if touch_summary && summary_cache.invalidate(key) {
            removed += 1;
        }
    } else if let Some(pattern) = &query.pattern {
        if touch_response {
            removed += response_cache.invalidate_prefix(pattern);
        }
        if touch_summary {
            removed += summary_cache.invalidate_prefix(pattern);
        }
    } else {
        if touch_response {
            removed += response_cache.clear();
        }
        if touch_summary {
            removed += summary_cache.clear();
        }
    }

    tracing::info!(removed, "cache invalidation");
    Ok(Json(json!({"invalidated": removed})))
}

/// `POST /v1/config/reload`
pub async fn config_reload(State(state): State<AppState>) -> Result<Json<Value>, GatewayError> {
    match state.config_manager.reload() {
        Ok(version) => {
            // Apply synchronously so the next request sees the new snapshot.
            state.apply_current_snapshot();
            Ok(Json(json!({"status": "reloaded", "version": version})))
        }
        Err(e) => Err(GatewayError::ConfigRejected { errors: e.errors }),
    }
}

/// `GET /v1/config/status`
pub async fn config_status(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.config_manager.current();
    let last_reload = state
        .config_manager
        .last_reload()
        .map(|(at, outcome)| json!({"at": at, "result": outcome}));
    Json(json!({
        "version": snapshot.version,
        "loaded_at": snapshot.loaded_at,
        "source": state
            .config_manager
            .source_path()
            .map(|p| p.display().to_string()),
        "providers": snapshot.config.providers.len(),
        "last_reload": last_reload,
    }))
}
