//! End-to-end tests against the full router: authentication, rate
//! limiting, fallback, caching, admin surfaces and hot reload, with
//! upstream providers played by wiremock.

use axum_test::TestServer;
use modelmux_gateway::config::Config;
use modelmux_gateway::server::create_app;
use modelmux_sdk::providers::{ProviderConfig, ProviderKind};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const GATEWAY_KEY: &str = "sk-modelmux-test-key";

fn completion_body(text: &str) -> Value {
    json!({
        "id": "chatcmpl-up",
        "object": "chat.completion",
        "created": 1,
        "model": "gpt-4o",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10}
    })
}

fn provider(name: &str, priority: i32, base_url: &str) -> ProviderConfig {
    std::env::set_var("MODELMUX_TEST_API_KEY", "sk-upstream");
    let mut config = ProviderConfig::new(name, ProviderKind::OpenAi, "MODELMUX_TEST_API_KEY")
        .with_models(&["gpt-4o"])
        .with_priority(priority)
        .with_base_url(base_url);
    config.retry_attempts = 1;
    config.retry_delay = Duration::from_millis(10);
    config
}

fn base_config(providers: Vec<ProviderConfig>) -> Config {
    let mut config = Config::default();
    config.providers = providers;
    config.auth.api_keys = vec![GATEWAY_KEY.to_string()];
    config.server.client_timeout = Duration::from_secs(5);
    config
}

async fn server_for(config: Config, config_path: Option<PathBuf>) -> TestServer {
    let (router, _state) = create_app(config, config_path).await.unwrap();
    TestServer::new(router).unwrap()
}

fn chat_body(content: &str) -> Value {
    json!({
        "model": "gpt-4o",
        "messages": [{"role": "user", "content": content}]
    })
}

#[tokio::test]
async fn rejects_requests_without_a_token() {
    let upstream = MockServer::start().await;
    let server = server_for(base_config(vec![provider("p", 1, &upstream.uri())]), None).await;

    let response = server
        .post("/v1/chat/completions")
        .json(&chat_body("hi"))
        .await;
    assert_eq!(response.status_code(), 401);

    let body: Value = response.json();
    assert_eq!(body["error"]["type"], "unauthorized");
    assert!(body["error"]["correlation_id"].is_string());
}

#[tokio::test]
async fn serves_chat_completions_with_a_valid_token() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("hello back")))
        .mount(&upstream)
        .await;

    let server = server_for(base_config(vec![provider("p", 1, &upstream.uri())]), None).await;
    let response = server
        .post("/v1/chat/completions")
        .add_header("authorization", format!("Bearer {GATEWAY_KEY}"))
        .json(&chat_body("hi"))
        .await;

    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["choices"][0]["message"]["content"], "hello back");
    assert_eq!(body["usage"]["total_tokens"], 10);
}

#[tokio::test]
async fn per_user_rate_limit_rejects_before_upstream_work() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("only once")))
        .expect(1)
        .mount(&upstream)
        .await;

    let mut config = base_config(vec![provider("p", 1, &upstream.uri())]);
    config.rate_limit.per_user.requests_per_minute = Some(1);
    let server = server_for(config, None).await;

    let first = server
        .post("/v1/chat/completions")
        .add_header("authorization", format!("Bearer {GATEWAY_KEY}"))
        .json(&chat_body("one"))
        .await;
    assert_eq!(first.status_code(), 200);

    // Distinct body: a cache hit would not prove the limiter fired.
    let second = server
        .post("/v1/chat/completions")
        .add_header("authorization", format!("Bearer {GATEWAY_KEY}"))
        .json(&chat_body("two"))
        .await;
    assert_eq!(second.status_code(), 429);
    let retry_after: u64 = second
        .headers()
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 59, "retry-after was {retry_after}");
}

#[tokio::test]
async fn falls_back_to_the_secondary_provider_on_5xx() {
    let broken = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&broken)
        .await;
    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("from backup")))
        .mount(&healthy)
        .await;

    let server = server_for(
        base_config(vec![
            provider("primary", 1, &broken.uri()),
            provider("backup", 2, &healthy.uri()),
        ]),
        None,
    )
    .await;

    let response = server
        .post("/v1/chat/completions")
        .add_header("authorization", format!("Bearer {GATEWAY_KEY}"))
        .json(&chat_body("anyone"))
        .await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["choices"][0]["message"]["content"], "from backup");
}

#[tokio::test]
async fn legacy_completions_bridge_round_trips() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("bridged")))
        .mount(&upstream)
        .await;

    let server = server_for(base_config(vec![provider("p", 1, &upstream.uri())]), None).await;
    let response = server
        .post("/v1/completions")
        .add_header("authorization", format!("Bearer {GATEWAY_KEY}"))
        .json(&json!({"model": "gpt-4o", "prompt": "Say something"}))
        .await;

    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["object"], "text_completion");
    assert_eq!(body["choices"][0]["text"], "bridged");
    assert_eq!(body["usage"]["total_tokens"], 10);
}

#[tokio::test]
async fn invalid_bodies_are_rejected_up_front() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("no")))
        .expect(0)
        .mount(&upstream)
        .await;

    let server = server_for(base_config(vec![provider("p", 1, &upstream.uri())]), None).await;
    let response = server
        .post("/v1/chat/completions")
        .add_header("authorization", format!("Bearer {GATEWAY_KEY}"))
        .json(&json!({"model": "gpt-4o", "messages": []}))
        .await;
    assert_eq!(response.status_code(), 400);
    let body: Value = response.json();
    assert_eq!(body["error"]["type"], "invalid_request");
}

#[tokio::test]
async fn models_endpoint_lists_the_union_of_enabled_models() {
    let upstream = MockServer::start().await;
    let mut other = provider("second", 2, &upstream.uri());
    other.models = vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()];

    let server = server_for(
        base_config(vec![provider("first", 1, &upstream.uri()), other]),
        None,
    )
    .await;

    let response = server
        .get("/v1/models")
        .add_header("authorization", format!("Bearer {GATEWAY_KEY}"))
        .await;
    assert_eq!(response.status_code(), 200);

    let body: Value = response.json();
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["gpt-4o", "gpt-4o-mini"]);
}

#[tokio::test]
async fn provider_admin_surfaces_detail_and_404() {
    let upstream = MockServer::start().await;
    let server = server_for(base_config(vec![provider("p", 1, &upstream.uri())]), None).await;

    let list = server
        .get("/v1/providers")
        .add_header("authorization", format!("Bearer {GATEWAY_KEY}"))
        .await;
    assert_eq!(list.status_code(), 200);
    let body: Value = list.json();
    assert_eq!(body["providers"][0]["name"], "p");
    assert_eq!(body["providers"][0]["breaker"]["state"], "closed");

    let detail = server
        .get("/v1/providers/p")
        .add_header("authorization", format!("Bearer {GATEWAY_KEY}"))
        .await;
    assert_eq!(detail.status_code(), 200);
    let body: Value = detail.json();
    assert_eq!(body["type"], "openai");
    assert_eq!(body["models"][0], "gpt-4o");

    let missing = server
        .get("/v1/providers/ghost")
        .add_header("authorization", format!("Bearer {GATEWAY_KEY}"))
        .await;
    assert_eq!(missing.status_code(), 404);
}

#[tokio::test]
async fn cache_stats_and_invalidation() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("cacheable")))
        .expect(2)
        .mount(&upstream)
        .await;

    let server = server_for(base_config(vec![provider("p", 1, &upstream.uri())]), None).await;
    let auth = format!("Bearer {GATEWAY_KEY}");

    // Miss, then hit.
    for _ in 0..2 {
        let response = server
            .post("/v1/chat/completions")
            .add_header("authorization", auth.clone())
            .json(&chat_body("cache me"))
            .await;
        assert_eq!(response.status_code(), 200);
    }

    let stats: Value = server
        .get("/v1/cache/stats")
        .add_header("authorization", auth.clone())
        .await
        .json();
    assert_eq!(stats["response_cache"]["entries"], 1);
    assert!(stats["response_cache"]["hits"].as_u64().unwrap() >= 1);

    // Clearing the cache forces the next identical request upstream,
    // which the mock's expect(2) verifies.
    let cleared = server
        .delete("/v1/cache")
        .add_header("authorization", auth.clone())
        .await;
    assert_eq!(cleared.status_code(), 200);
    let body: Value = cleared.json();
    assert_eq!(body["invalidated"], 1);

    let response = server
        .post("/v1/chat/completions")
        .add_header("authorization", auth)
        .json(&chat_body("cache me"))
        .await;
    assert_eq!(response.status_code(), 200);
}

#[tokio::test]
async fn streaming_yields_sse_terminated_by_done() {
    let sse_body = concat!(
        "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,",
        "\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"str\"},",
        "\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,",
        "\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"eam\"},",
        "\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n"
    );
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"))
        .mount(&upstream)
        .await;

    let server = server_for(base_config(vec![provider("p", 1, &upstream.uri())]), None).await;
    let response = server
        .post("/v1/chat/completions")
        .add_header("authorization", format!("Bearer {GATEWAY_KEY}"))
        .json(&json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "stream"}],
            "stream": true
        }))
        .await;

    assert_eq!(response.status_code(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    let text = response.text();
    assert!(text.contains("\"content\":\"str\""));
    assert!(text.contains("\"content\":\"eam\""));
    assert!(text.trim_end().ends_with("data: [DONE]"));
}

#[tokio::test]
async fn health_endpoints_respond() {
    let upstream = MockServer::start().await;
    let server = server_for(base_config(vec![provider("p", 1, &upstream.uri())]), None).await;

    // Liveness and readiness are open endpoints.
    assert_eq!(server.get("/health/live").await.status_code(), 200);
    assert_eq!(server.get("/health/ready").await.status_code(), 200);

    let health: Value = server.get("/health").await.json();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["providers"]["total"], 1);

    let detailed = server
        .get("/v1/health")
        .add_header("authorization", format!("Bearer {GATEWAY_KEY}"))
        .await;
    assert_eq!(detailed.status_code(), 200);
}

#[tokio::test]
async fn metrics_endpoints_expose_counters() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("counted")))
        .mount(&upstream)
        .await;

    let server = server_for(base_config(vec![provider("p", 1, &upstream.uri())]), None).await;
    let auth = format!("Bearer {GATEWAY_KEY}");

    server
        .post("/v1/chat/completions")
        .add_header("authorization", auth.clone())
        .json(&chat_body("count me"))
        .await;

    let metrics: Value = server
        .get("/v1/metrics")
        .add_header("authorization", auth.clone())
        .await
        .json();
    assert_eq!(metrics["total_requests"], 1);
    assert_eq!(metrics["providers"]["p"]["requests"], 1);

    let prometheus = server
        .get("/v1/metrics/prometheus")
        .add_header("authorization", auth)
        .await;
    assert!(prometheus.text().contains("modelmux_requests_total 1"));
}

#[tokio::test]
async fn rejected_reload_keeps_serving_with_the_old_snapshot() {
    std::env::set_var("MODELMUX_TEST_API_KEY", "sk-upstream");
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("still here")))
        .mount(&upstream)
        .await;

    let dir = std::env::temp_dir().join(format!("modelmux-it-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let config_path = dir.join("modelmux.toml");

    let good = format!(
        r#"
        [auth]
        api_keys = ["{GATEWAY_KEY}"]

        [[providers]]
        name = "p"
        type = "openai"
        api_key_ref = "MODELMUX_TEST_API_KEY"
        models = ["gpt-4o"]
        priority = 1
        base_url = "{}"
        "#,
        upstream.uri()
    );
    std::fs::write(&config_path, &good).unwrap();

    let config = Config::load(&config_path).unwrap();
    let server = server_for(config, Some(config_path.clone())).await;
    let auth = format!("Bearer {GATEWAY_KEY}");

    // Break the file with a duplicate provider name and ask for a reload.
    let bad = format!(
        "{good}\n[[providers]]\nname = \"p\"\ntype = \"openai\"\n\
         api_key_ref = \"MODELMUX_TEST_API_KEY\"\nmodels = [\"gpt-4o\"]\npriority = 2\n"
    );
    std::fs::write(&config_path, bad).unwrap();

    let reload = server
        .post("/v1/config/reload")
        .add_header("authorization", auth.clone())
        .await;
    assert_eq!(reload.status_code(), 422);
    let body: Value = reload.json();
    assert_eq!(body["error"]["type"], "invalid_config");
    assert!(body["error"]["details"]
        .as_array()
        .unwrap()
        .iter()
        .any(|e| e.as_str().unwrap().contains("duplicate provider name")));

    // The service still reports healthy and serves with the old snapshot.
    let health: Value = server.get("/health").await.json();
    assert_eq!(health["status"], "healthy");

    let response = server
        .post("/v1/chat/completions")
        .add_header("authorization", auth.clone())
        .json(&chat_body("after failed reload"))
        .await;
    assert_eq!(response.status_code(), 200);

    let status: Value = server
        .get("/v1/config/status")
        .add_header("authorization", auth.clone())
        .await
        .json();
    assert_eq!(status["version"], 1);
    assert_eq!(status["last_reload"]["result"]["outcome"], "rejected");

    // Restoring the file lets the reload land as version 2.
    std::fs::write(&config_path, &good).unwrap();
    let reload = server
        .post("/v1/config/reload")
        .add_header("authorization", auth)
        .await;
    assert_eq!(reload.status_code(), 200);
    let body: Value = reload.json();
    assert_eq!(body["version"], 2);

    std::fs::remove_dir_all(&dir).unwrap();
}
