//! # Server Composition
//!
//! Builds the application: the provider registry, caches, rate limiter,
//! condenser and routing engine are constructed here from the initial
//! configuration snapshot and owned by [`AppState`]; handlers and
//! middleware borrow them through it. No hidden globals.
//!
//! A subscriber task follows the configuration watch channel and applies
//! each new snapshot: the registry diffs its provider set, cache and
//! condenser adopt new settings, and the global admission bucket is
//! replaced. The health monitor runs on its own task and publishes
//! snapshots the handlers read without locking.

use crate::config::{Config, ConfigManager, ConfigSnapshot};
use crate::handlers;
use crate::metrics::MetricsCollector;
use crate::middleware::{auth_middleware, logging_middleware};
use axum::routing::{delete, get, post};
use axum::Router;
use modelmux_sdk::cache::ResponseCache;
use modelmux_sdk::condenser::ContextCondenser;
use modelmux_sdk::health::{HealthMonitor, HealthSnapshot};
use modelmux_sdk::rate_limit::RateLimiter;
use modelmux_sdk::registry::ProviderRegistry;
use modelmux_sdk::routing::RoutingEngine;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;

/// How often expired cache entries are swept and idle rate-limit buckets
/// pruned.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);
/// Rate-limit buckets idle longer than this are dropped.
const BUCKET_IDLE_TTL: Duration = Duration::from_secs(3600);

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub config_manager: Arc<ConfigManager>,
    pub engine: Arc<RoutingEngine>,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<MetricsCollector>,
    pub health: watch::Receiver<HealthSnapshot>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn config(&self) -> Arc<Config> {
        self.config_manager.current().config
    }

    /// Push the manager's current snapshot into every component.
    pub fn apply_current_snapshot(&self) {
        apply_snapshot(&self.engine, &self.config_manager.current());
    }
}

fn apply_snapshot(engine: &Arc<RoutingEngine>, snapshot: &ConfigSnapshot) {
    let config = &snapshot.config;
    let errors = engine
        .registry()
        .apply_config(&config.effective_providers(), config.breaker_config());
    for error in errors {
        tracing::error!(%error, "provider rejected during snapshot apply");
    }
    engine.cache().update_settings(config.response_cache_settings());
    engine
        .condenser()
        .update_config(config.condensation_config(), config.summary_cache_settings());
    engine.set_global_bucket(config.global_bucket());
    tracing::debug!(version = snapshot.version, "configuration snapshot applied");
}

/// Build the router and all long-lived components from a loaded config.
///
/// Returns the router plus the pieces the binary needs to keep alive: the
/// config manager (for the file watcher) and the app state.
pub async fn create_app(
    config: Config,
    config_path: Option<PathBuf>,
) -> anyhow::Result<(Router, AppState)> {
    let (config_manager, mut config_rx) = ConfigManager::new(config, config_path);
    let snapshot = config_manager.current();
    let config = snapshot.config.clone();

    let registry = Arc::new(ProviderRegistry::new(config.breaker_config()));
    let build_errors =
        registry.apply_config(&config.effective_providers(), config.breaker_config());
    for error in &build_errors {
        tracing::error!(%error, "provider failed to initialize");
    }
    if registry.is_empty() && !config.providers.is_empty() {
        anyhow::bail!(
            "no provider could be initialized: {}",
            build_errors.join("; ")
        );
    }

    let limiter = Arc::new(RateLimiter::new());
    let cache = Arc::new(ResponseCache::new(config.response_cache_settings()));
    let condenser = Arc::new(ContextCondenser::new(
        config.condensation_config(),
        config.summary_cache_settings(),
    ));
    let engine = Arc::new(RoutingEngine::new(
        Arc::clone(&registry),
        Arc::clone(&cache),
        Arc::clone(&limiter),
        condenser,
    ));
    engine.set_global_bucket(config.global_bucket());

    let (monitor, health_rx) =
        HealthMonitor::new(Arc::clone(&registry), config.health_check_config());
    monitor.spawn();

    let state = AppState {
        config_manager: Arc::clone(&config_manager),
        engine: Arc::clone(&engine),
        limiter: Arc::clone(&limiter),
        metrics: Arc::new(MetricsCollector::new()),
        health: health_rx,
        started_at: chrono::Utc::now(),
    };

    // Apply future snapshots (file watcher or reload endpoint) to the
    // running components.
    {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            while config_rx.changed().await.is_ok() {
                let snapshot = config_rx.borrow_and_update().clone();
                apply_snapshot(&engine, &snapshot);
            }
        });
    }

    // Periodic TTL sweeps and bucket pruning.
    {
        let engine = Arc::clone(&engine);
        let limiter = Arc::clone(&limiter);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let swept = engine.cache().sweep_expired()
                    + engine.condenser().summary_cache().sweep_expired();
                let pruned = limiter.prune_idle(BUCKET_IDLE_TTL);
                if swept > 0 || pruned > 0 {
                    tracing::debug!(swept, pruned, "maintenance sweep");
                }
            }
        });
    }

    let client_timeout = config.server.client_timeout;
    let router = Router::new()
        // OpenAI-compatible surface
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/completions", post(handlers::completions))
        .route("/v1/models", get(handlers::list_models))
        // Provider administration
        .route("/v1/providers", get(handlers::list_providers))
        .route("/v1/providers/{name}", get(handlers::provider_detail))
        .route("/v1/providers/{name}/models", get(handlers::provider_models))
        .route(
            "/v1/providers/{name}/models/refresh",
            post(handlers::refresh_provider_models),
        )
        // Health probes
        .route("/health", get(handlers::health))
        .route("/health/live", get(handlers::health_live))
        .route("/health/ready", get(handlers::health_ready))
        .route("/v1/health", get(handlers::health_detailed))
        // Metrics
        .route("/v1/metrics", get(handlers::metrics))
        .route("/v1/metrics/prometheus", get(handlers::metrics_prometheus))
        // Cache administration
        .route("/v1/cache/stats", get(handlers::cache_stats))
        .route("/v1/cache", delete(handlers::cache_invalidate))
        // Configuration
        .route("/v1/config/reload", post(handlers::config_reload))
        .route("/v1/config/status", get(handlers::config_status))
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn(logging_middleware))
                .layer(axum::middleware::from_fn_with_state(
                    state.clone(),
                    auth_middleware,
                ))
                // Slack over the routing deadline so the engine's own
                // timeout wins and produces a typed error body.
                .layer(TimeoutLayer::new(client_timeout + Duration::from_secs(5))),
        )
        .with_state(state.clone());

    Ok((router, state))
}
