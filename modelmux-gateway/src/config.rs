//! # Configuration
//!
//! Loads, validates and hot-reloads the gateway's configuration document.
//! The document is TOML with the hierarchical sections described in the
//! README; secrets never appear in it, providers reference environment
//! entries by name (`api_key_ref`).
//!
//! Validation is strict and total: a bad document is rejected with every
//! offense listed, not just the first. Validated configs are published as
//! immutable [`ConfigSnapshot`]s with a monotonic version on a watch
//! channel; an invalid reload is reported and discarded while the previous
//! snapshot stays in force. Changes to `server.*` and `auth.header_name`
//! require a restart; everything else applies on reload.
//!
//! A historical flat layout (server and auth keys at the document root) is
//! still recognized: the loader rewrites it in memory to the canonical
//! shape, writes a sibling backup of the original document, and logs a
//! deprecation notice.

use modelmux_sdk::cache::CacheSettings;
use modelmux_sdk::circuit_breaker::BreakerConfig;
use modelmux_sdk::condenser::{CondensationConfig, FallbackStrategy};
use modelmux_sdk::health::HealthCheckConfig;
use modelmux_sdk::providers::ProviderConfig;
use modelmux_sdk::rate_limit::BucketConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Validation failure carrying every offense found in the document.
#[derive(Debug, thiserror::Error)]
#[error("configuration invalid: {}", errors.join("; "))]
pub struct ConfigError {
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub app: AppSection,
    pub server: ServerSection,
    pub auth: AuthSection,
    pub providers: Vec<ProviderConfig>,
    pub rate_limit: RateLimitSection,
    pub circuit_breaker: CircuitBreakerSection,
    pub caching: CachingSection,
    pub condensation: CondensationSection,
    pub http_client: HttpClientSection,
    pub health_check: HealthCheckSection,
    pub logging: LoggingSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            server: ServerSection::default(),
            auth: AuthSection::default(),
            providers: Vec::new(),
            rate_limit: RateLimitSection::default(),
            circuit_breaker: CircuitBreakerSection::default(),
            caching: CachingSection::default(),
            condensation: CondensationSection::default(),
            http_client: HttpClientSection::default(),
            health_check: HealthCheckSection::default(),
            logging: LoggingSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    pub version: String,
    pub environment: String,
    pub debug: bool,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "modelmux".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
            debug: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    /// Requests a worker serves before recycling; 0 disables
    pub max_requests: u64,
    /// Overall per-request deadline budget handed to the router
    #[serde(with = "modelmux_sdk::common::duration_serde")]
    pub client_timeout: Duration,
    pub max_body_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            workers: 0,
            max_requests: 0,
            client_timeout: Duration::from_secs(60),
            max_body_bytes: 2 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    /// Accepted bearer tokens. Empty disables authentication.
    pub api_keys: Vec<String>,
    /// Alternate header carrying the token instead of Authorization
    pub header_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub requests_per_window: u32,
    pub window_seconds: u64,
    pub burst_limit: Option<u32>,
    pub per_provider: PerProviderLimits,
    pub per_user: PerUserLimits,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            requests_per_window: 0,
            window_seconds: 60,
            burst_limit: None,
            per_provider: PerProviderLimits::default(),
            per_user: PerUserLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PerProviderLimits {
    /// Fallback requests/hour for providers without their own rate_limit
    pub requests_per_hour: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PerUserLimits {
    pub requests_per_minute: Option<u32>,
    pub burst_limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSection {
    pub failure_threshold: u32,
    #[serde(with = "modelmux_sdk::common::duration_serde")]
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
    pub window_size: usize,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        let defaults = BreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            recovery_timeout: defaults.recovery_timeout,
            half_open_max_calls: defaults.half_open_max_calls,
            window_size: defaults.window_size,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CachingSection {
    pub response_cache: CacheSection,
    pub summary_cache: CacheSection,
    pub warming: WarmingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub enabled: bool,
    pub max_size_mb: u64,
    pub max_entries: usize,
    #[serde(with = "modelmux_sdk::common::duration_serde")]
    pub ttl: Duration,
    pub compression: bool,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_mb: 64,
            max_entries: 10_000,
            ttl: Duration::from_secs(300),
            compression: true,
        }
    }
}

/// Predictive cache warming. Parsed and validated; the warming task itself
/// is not implemented and the flag defaults off.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmingSection {
    pub enabled: bool,
    #[serde(with = "modelmux_sdk::common::duration_serde")]
    pub interval: Duration,
}

impl Default for WarmingSection {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CondensationSection {
    pub truncation_threshold: u32,
    pub summary_max_tokens: u32,
    pub retained_tail: usize,
    pub adaptive_factor: Option<f64>,
    pub error_patterns: Vec<String>,
    pub fallback_strategies: Vec<FallbackStrategy>,
    pub concurrency_limit: usize,
    pub queue_limit: usize,
    #[serde(with = "modelmux_sdk::common::duration_serde")]
    pub timeout: Duration,
    pub provider: Option<String>,
}

impl Default for CondensationSection {
    fn default() -> Self {
        let defaults = CondensationConfig::default();
        Self {
            truncation_threshold: defaults.truncation_threshold,
            summary_max_tokens: defaults.summary_max_tokens,
            retained_tail: defaults.retained_tail,
            adaptive_factor: defaults.adaptive_factor,
            error_patterns: defaults.error_patterns,
            fallback_strategies: defaults.fallback_strategies,
            concurrency_limit: defaults.concurrency_limit,
            queue_limit: defaults.queue_limit,
            timeout: defaults.timeout,
            provider: defaults.provider,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientSection {
    #[serde(with = "modelmux_sdk::common::duration_serde")]
    pub timeout: Duration,
    #[serde(with = "modelmux_sdk::common::duration_serde")]
    pub connect_timeout: Duration,
    pub pool_limits: PoolLimits,
}

impl Default for HttpClientSection {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            pool_limits: PoolLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolLimits {
    pub max_connections: usize,
    pub max_keepalive_connections: usize,
    #[serde(with = "modelmux_sdk::common::duration_serde")]
    pub keepalive_timeout: Duration,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_connections: 64,
            max_keepalive_connections: 16,
            keepalive_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckSection {
    pub enabled: bool,
    #[serde(with = "modelmux_sdk::common::duration_serde")]
    pub interval: Duration,
    #[serde(with = "modelmux_sdk::common::duration_serde")]
    pub timeout: Duration,
    pub unhealthy_threshold: u32,
    pub degraded_success_rate: f64,
}

impl Default for HealthCheckSection {
    fn default() -> Self {
        let defaults = HealthCheckConfig::default();
        Self {
            enabled: defaults.enabled,
            interval: defaults.interval,
            timeout: defaults.timeout,
            unhealthy_threshold: defaults.unhealthy_threshold,
            degraded_success_rate: defaults.degraded_success_rate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: LogFormat,
    pub rotation: RotationSection,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            rotation: RotationSection::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationSection {
    pub max_file_size: u64,
    pub max_files: u32,
}

impl Default for RotationSection {
    fn default() -> Self {
        Self {
            max_file_size: 64 * 1024 * 1024,
            max_files: 5,
        }
    }
}

impl Config {
    /// Load and validate a configuration document, applying the
    /// environment overlay and migrating the legacy flat layout if found.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", path.display()))?;
        let mut config = Self::parse(&content, Some(path))?;
        config.apply_env_overrides()?;
        config.validate().map_err(|e| anyhow::anyhow!("{e}"))?;
        Ok(config)
    }

    /// Parse a document, accepting both the canonical and legacy layouts.
    pub fn parse(content: &str, source: Option<&Path>) -> anyhow::Result<Self> {
        let value: toml::Value = toml::from_str(content)?;
        if is_legacy_layout(&value) {
            tracing::warn!(
                "legacy flat configuration layout detected; rewriting to the sectioned \
                 layout (this support will be removed in a future release)"
            );
            if let Some(path) = source {
                backup_legacy_document(path, content);
            }
            return migrate_legacy(value);
        }
        Ok(value.try_into()?)
    }

    /// Environment takes precedence over the file for a handful of
    /// operational knobs.
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(host) = std::env::var("MODELMUX_HOST") {
            if !host.is_empty() {
                self.server.host = host;
            }
        }
        if let Ok(port) = std::env::var("MODELMUX_PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid MODELMUX_PORT: {port}"))?;
        }
        if let Ok(level) = std::env::var("MODELMUX_LOG_LEVEL") {
            if !level.is_empty() {
                self.logging.level = level;
            }
        }
        if let Ok(keys) = std::env::var("MODELMUX_API_KEYS") {
            let keys: Vec<String> = keys
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect();
            if !keys.is_empty() {
                self.auth.api_keys = keys;
            }
        }
        Ok(())
    }

    /// Validate the whole document, returning every offense at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.server.host.is_empty() {
            errors.push("server.host cannot be empty".to_string());
        }
        if self.server.port == 0 {
            errors.push("server.port must be between 1 and 65535".to_string());
        }
        if self.server.client_timeout.is_zero() {
            errors.push("server.client_timeout cannot be 0".to_string());
        }

        if self.providers.is_empty() {
            errors.push("providers must not be empty".to_string());
        }
        let mut names = HashSet::new();
        let mut priorities = HashSet::new();
        for provider in &self.providers {
            let label = &provider.name;
            if provider.name.is_empty() {
                errors.push("provider with empty name".to_string());
            }
            if !names.insert(provider.name.clone()) {
                errors.push(format!("duplicate provider name: {label}"));
            }
            if !priorities.insert(provider.priority) {
                errors.push(format!(
                    "duplicate provider priority {} (provider {label})",
                    provider.priority
                ));
            }
            if provider.models.is_empty() {
                errors.push(format!("provider {label} must list at least one model"));
            }
            if provider.timeout.is_zero() {
                errors.push(format!("provider {label} timeout cannot be 0"));
            }
            if let Some(base_url) = &provider.base_url {
                match reqwest::Url::parse(base_url) {
                    Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
                    Ok(url) => errors.push(format!(
                        "provider {label} base_url has unsupported scheme {}",
                        url.scheme()
                    )),
                    Err(e) => errors.push(format!("provider {label} base_url invalid: {e}")),
                }
            }
            if provider.enabled {
                match std::env::var(&provider.api_key_ref) {
                    Ok(value) if !value.trim().is_empty() => {}
                    _ => errors.push(format!(
                        "provider {label}: api_key_ref {} does not resolve to a non-empty \
                         environment value",
                        provider.api_key_ref
                    )),
                }
            }
            if let Some(limit) = provider.rate_limit {
                if limit == 0 {
                    errors.push(format!("provider {label} rate_limit cannot be 0"));
                }
            }
            if provider.retry_attempts > 10 {
                errors.push(format!(
                    "provider {label} retry_attempts cannot exceed 10"
                ));
            }
        }

        if self.rate_limit.window_seconds == 0 {
            errors.push("rate_limit.window_seconds cannot be 0".to_string());
        }
        if let Some(rpm) = self.rate_limit.per_user.requests_per_minute {
            if rpm == 0 {
                errors.push("rate_limit.per_user.requests_per_minute cannot be 0".to_string());
            }
        }

        if self.circuit_breaker.failure_threshold == 0 {
            errors.push("circuit_breaker.failure_threshold cannot be 0".to_string());
        }
        if self.circuit_breaker.recovery_timeout.is_zero() {
            errors.push("circuit_breaker.recovery_timeout cannot be 0".to_string());
        }
        if self.circuit_breaker.half_open_max_calls == 0 {
            errors.push("circuit_breaker.half_open_max_calls cannot be 0".to_string());
        }
        if self.circuit_breaker.window_size < self.circuit_breaker.failure_threshold as usize {
            errors.push(
                "circuit_breaker.window_size must be at least failure_threshold".to_string(),
            );
        }

        for (name, cache) in [
            ("response_cache", &self.caching.response_cache),
            ("summary_cache", &self.caching.summary_cache),
        ] {
            if cache.enabled {
                if cache.max_size_mb == 0 {
                    errors.push(format!("caching.{name}.max_size_mb cannot be 0"));
                }
                if cache.ttl.is_zero() {
                    errors.push(format!("caching.{name}.ttl cannot be 0"));
                }
            }
        }

        if self.condensation.truncation_threshold == 0 {
            errors.push("condensation.truncation_threshold cannot be 0".to_string());
        }
        if self.condensation.summary_max_tokens == 0 {
            errors.push("condensation.summary_max_tokens cannot be 0".to_string());
        }
        if self.condensation.concurrency_limit == 0 {
            errors.push("condensation.concurrency_limit cannot be 0".to_string());
        }
        if let Some(factor) = self.condensation.adaptive_factor {
            if factor <= 0.0 {
                errors.push("condensation.adaptive_factor must be positive".to_string());
            }
        }
        if let Some(provider) = &self.condensation.provider {
            if !self.providers.iter().any(|p| &p.name == provider) {
                errors.push(format!(
                    "condensation.provider {provider} is not a configured provider"
                ));
            }
        }

        if self.http_client.timeout.is_zero() {
            errors.push("http_client.timeout cannot be 0".to_string());
        }
        if self.http_client.pool_limits.max_keepalive_connections
            > self.http_client.pool_limits.max_connections
        {
            errors.push(
                "http_client.pool_limits.max_keepalive_connections cannot exceed max_connections"
                    .to_string(),
            );
        }

        if self.health_check.enabled {
            if self.health_check.interval.is_zero() {
                errors.push("health_check.interval cannot be 0".to_string());
            }
            if self.health_check.timeout.is_zero() {
                errors.push("health_check.timeout cannot be 0".to_string());
            }
            if self.health_check.unhealthy_threshold == 0 {
                errors.push("health_check.unhealthy_threshold cannot be 0".to_string());
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            errors.push(format!(
                "logging.level must be one of {}, got {}",
                valid_levels.join(", "),
                self.logging.level
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { errors })
        }
    }

    /// Which changed fields require a process restart rather than a reload.
    pub fn restart_required(&self, next: &Config) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.server != next.server {
            fields.push("server");
        }
        if self.auth.header_name != next.auth.header_name {
            fields.push("auth.header_name");
        }
        fields
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.circuit_breaker.failure_threshold,
            recovery_timeout: self.circuit_breaker.recovery_timeout,
            half_open_max_calls: self.circuit_breaker.half_open_max_calls,
            window_size: self.circuit_breaker.window_size,
        }
    }

    pub fn response_cache_settings(&self) -> CacheSettings {
        cache_settings(&self.caching.response_cache)
    }

    pub fn summary_cache_settings(&self) -> CacheSettings {
        let section = &self.caching.summary_cache;
        let mut settings = cache_settings(section);
        // Summaries are small and long-lived; default section TTL applies
        // but entries stay useful for hours.
        if section.ttl == CacheSection::default().ttl {
            settings.ttl = Duration::from_secs(3600);
        }
        settings
    }

    pub fn condensation_config(&self) -> CondensationConfig {
        CondensationConfig {
            truncation_threshold: self.condensation.truncation_threshold,
            summary_max_tokens: self.condensation.summary_max_tokens,
            retained_tail: self.condensation.retained_tail,
            adaptive_factor: self.condensation.adaptive_factor,
            error_patterns: self.condensation.error_patterns.clone(),
            fallback_strategies: self.condensation.fallback_strategies.clone(),
            concurrency_limit: self.condensation.concurrency_limit,
            queue_limit: self.condensation.queue_limit,
            timeout: self.condensation.timeout,
            provider: self.condensation.provider.clone(),
        }
    }

    pub fn health_check_config(&self) -> HealthCheckConfig {
        HealthCheckConfig {
            enabled: self.health_check.enabled,
            interval: self.health_check.interval,
            timeout: self.health_check.timeout,
            unhealthy_threshold: self.health_check.unhealthy_threshold,
            degraded_success_rate: self.health_check.degraded_success_rate,
        }
    }

    /// Process-wide admission bucket, when `requests_per_window` is set.
    pub fn global_bucket(&self) -> Option<BucketConfig> {
        if self.rate_limit.requests_per_window == 0 {
            return None;
        }
        Some(BucketConfig::per_window(
            self.rate_limit.requests_per_window,
            Duration::from_secs(self.rate_limit.window_seconds),
            self.rate_limit.burst_limit,
        ))
    }

    /// Per-caller admission bucket, when `per_user` limits are set.
    pub fn user_bucket(&self) -> Option<BucketConfig> {
        let rpm = self.rate_limit.per_user.requests_per_minute?;
        Some(BucketConfig::per_window(
            rpm,
            Duration::from_secs(60),
            self.rate_limit.per_user.burst_limit,
        ))
    }

    /// Providers with the per-provider default rate limit filled in.
    pub fn effective_providers(&self) -> Vec<ProviderConfig> {
        let default_rph = self.rate_limit.per_provider.requests_per_hour;
        self.providers
            .iter()
            .cloned()
            .map(|mut p| {
                if p.rate_limit.is_none() {
                    p.rate_limit = default_rph;
                }
                p
            })
            .collect()
    }
}

fn cache_settings(section: &CacheSection) -> CacheSettings {
    let defaults = CacheSettings::default();
    CacheSettings {
        enabled: section.enabled,
        max_bytes: section.max_size_mb * 1024 * 1024,
        max_entries: section.max_entries,
        ttl: section.ttl,
        compression: section.compression,
        compression_threshold: defaults.compression_threshold,
        max_entry_bytes: defaults.max_entry_bytes,
    }
}

/// Keys that only ever existed at the root of the retired flat layout.
const LEGACY_ROOT_KEYS: [&str; 4] = ["host", "port", "api_keys", "log_level"];

fn is_legacy_layout(value: &toml::Value) -> bool {
    value
        .as_table()
        .map(|table| LEGACY_ROOT_KEYS.iter().any(|key| table.contains_key(*key)))
        .unwrap_or(false)
}

/// Rewrite the flat layout into the canonical sectioned shape.
fn migrate_legacy(value: toml::Value) -> anyhow::Result<Config> {
    let table = value
        .as_table()
        .ok_or_else(|| anyhow::anyhow!("configuration root must be a table"))?;

    let mut config = Config::default();
    if let Some(host) = table.get("host").and_then(|v| v.as_str()) {
        config.server.host = host.to_string();
    }
    if let Some(port) = table.get("port").and_then(|v| v.as_integer()) {
        config.server.port = u16::try_from(port)
            .map_err(|_| anyhow::anyhow!("legacy port out of range: {port}"))?;
    }
    if let Some(keys) = table.get("api_keys").and_then(|v| v.as_array()) {
        config.auth.api_keys = keys
            .iter()
            .filter_map(|k| k.as_str().map(|s| s.to_string()))
            .collect();
    }
    if let Some(level) = table.get("log_level").and_then(|v| v.as_str()) {
        config.logging.level = level.to_string();
    }
    if let Some(providers) = table.get("providers") {
        config.providers = providers.clone().try_into()?;
    }
    Ok(config)
}

fn backup_legacy_document(path: &Path, content: &str) {
    let backup = path.with_extension("toml.bak");
    if backup.exists() {
        return;
    }
    match std::fs::write(&backup, content) {
        Ok(()) => tracing::info!(backup = %backup.display(), "backed up legacy configuration"),
        Err(e) => tracing::warn!(error = %e, "could not back up legacy configuration"),
    }
}

/// Immutable, versioned configuration bundle readers observe atomically.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub config: Arc<Config>,
    pub loaded_at: chrono::DateTime<chrono::Utc>,
}

/// Outcome of the most recent reload attempt, for `/v1/config/status`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReloadOutcome {
    Accepted { version: u64 },
    Rejected { errors: Vec<String> },
}

/// Owns the current snapshot and publishes new ones on a watch channel.
pub struct ConfigManager {
    tx: watch::Sender<ConfigSnapshot>,
    version: AtomicU64,
    path: Option<PathBuf>,
    last_reload: Mutex<Option<(chrono::DateTime<chrono::Utc>, ReloadOutcome)>>,
}

impl ConfigManager {
    pub fn new(config: Config, path: Option<PathBuf>) -> (Arc<Self>, watch::Receiver<ConfigSnapshot>) {
        let snapshot = ConfigSnapshot {
            version: 1,
            config: Arc::new(config),
            loaded_at: chrono::Utc::now(),
        };
        let (tx, rx) = watch::channel(snapshot);
        (
            Arc::new(Self {
                tx,
                version: AtomicU64::new(1),
                path,
                last_reload: Mutex::new(None),
            }),
            rx,
        )
    }

    pub fn current(&self) -> ConfigSnapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConfigSnapshot> {
        self.tx.subscribe()
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn last_reload(&self) -> Option<(chrono::DateTime<chrono::Utc>, ReloadOutcome)> {
        self.last_reload.lock().unwrap().clone()
    }

    /// Re-read, re-validate and publish the configuration file.
    ///
    /// An invalid document is recorded and discarded; the previous
    /// snapshot stays in force and subsequent requests behave exactly as
    /// before the attempt.
    pub fn reload(&self) -> Result<u64, ConfigError> {
        let outcome = self.try_reload();
        let recorded = match &outcome {
            Ok(version) => ReloadOutcome::Accepted { version: *version },
            Err(e) => ReloadOutcome::Rejected {
                errors: e.errors.clone(),
            },
        };
        *self.last_reload.lock().unwrap() = Some((chrono::Utc::now(), recorded));
        outcome
    }

    fn try_reload(&self) -> Result<u64, ConfigError> {
        let Some(path) = &self.path else {
            return Err(ConfigError {
                errors: vec!["no configuration file to reload from".to_string()],
            });
        };

        let next = Config::load(path).map_err(|e| ConfigError {
            errors: vec![e.to_string()],
        })?;

        let previous = self.current();
        let held_back = previous.config.restart_required(&next);
        if !held_back.is_empty() {
            tracing::warn!(
                fields = ?held_back,
                "changed fields require a restart and were not applied"
            );
        }

        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = ConfigSnapshot {
            version,
            config: Arc::new(next),
            loaded_at: chrono::Utc::now(),
        };
        self.tx.send_replace(snapshot);
        tracing::info!(version, "configuration reloaded");
        Ok(version)
    }

    /// Watch the config file and reload on change, debounced.
    pub fn spawn_watcher(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        use notify::Watcher;

        let path = self.path.clone()?;
        let manager = Arc::clone(self);
        let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(4);

        let handle = tokio::spawn(async move {
            let mut watcher = match notify::recommended_watcher(
                move |event: Result<notify::Event, notify::Error>| {
                    if let Ok(event) = event {
                        if event.kind.is_modify() || event.kind.is_create() {
                            let _ = tx.try_send(());
                        }
                    }
                },
            ) {
                Ok(watcher) => watcher,
                Err(e) => {
                    tracing::error!(error = %e, "could not create config watcher");
                    return;
                }
            };
            if let Err(e) = watcher.watch(&path, notify::RecursiveMode::NonRecursive) {
                tracing::error!(error = %e, path = %path.display(), "could not watch config file");
                return;
            }
            tracing::info!(path = %path.display(), "watching configuration for changes");

            while rx.recv().await.is_some() {
                // Editors fire bursts of events; settle before reloading.
                tokio::time::sleep(Duration::from_millis(250)).await;
                while rx.try_recv().is_ok() {}
                match manager.reload() {
                    Ok(version) => {
                        tracing::info!(version, "configuration hot reload applied")
                    }
                    Err(e) => {
                        tracing::error!(errors = ?e.errors, "configuration hot reload rejected")
                    }
                }
            }
        });
        Some(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelmux_sdk::providers::ProviderKind;

    fn sample_provider(name: &str, priority: i32) -> ProviderConfig {
        std::env::set_var("MODELMUX_TEST_API_KEY", "sk-test");
        ProviderConfig::new(name, ProviderKind::OpenAi, "MODELMUX_TEST_API_KEY")
            .with_models(&["gpt-4o"])
            .with_priority(priority)
    }

    fn valid_config() -> Config {
        Config {
            providers: vec![sample_provider("a", 1), sample_provider("b", 2)],
            ..Config::default()
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validation_collects_every_offense() {
        let mut config = valid_config();
        config.providers.push(sample_provider("a", 1)); // duplicate name and priority
        config.providers[0].models.clear();
        config.circuit_breaker.failure_threshold = 0;
        config.logging.level = "loud".to_string();

        let err = config.validate().unwrap_err();
        assert!(err.errors.len() >= 4, "got: {:?}", err.errors);
        assert!(err.errors.iter().any(|e| e.contains("duplicate provider name")));
        assert!(err.errors.iter().any(|e| e.contains("duplicate provider priority")));
        assert!(err.errors.iter().any(|e| e.contains("at least one model")));
        assert!(err.errors.iter().any(|e| e.contains("failure_threshold")));
        assert!(err.errors.iter().any(|e| e.contains("logging.level")));
    }

    #[test]
    fn unresolved_api_key_ref_is_an_error() {
        let mut config = valid_config();
        config.providers[0].api_key_ref = "MODELMUX_TEST_DEFINITELY_UNSET".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.errors.iter().any(|e| e.contains("api_key_ref")));
    }

    #[test]
    fn disabled_providers_skip_secret_resolution() {
        let mut config = valid_config();
        config.providers[0].api_key_ref = "MODELMUX_TEST_DEFINITELY_UNSET".to_string();
        config.providers[0].enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn bad_base_url_is_an_error() {
        let mut config = valid_config();
        config.providers[0].base_url = Some("ftp://files.example.com".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.errors.iter().any(|e| e.contains("unsupported scheme")));
    }

    #[test]
    fn canonical_document_parses() {
        std::env::set_var("MODELMUX_TEST_API_KEY", "sk-test");
        let doc = r#"
            [app]
            name = "modelmux"
            environment = "test"

            [server]
            host = "0.0.0.0"
            port = 9000

            [auth]
            api_keys = ["sk-gw-1"]

            [[providers]]
            name = "openai-primary"
            type = "openai"
            api_key_ref = "MODELMUX_TEST_API_KEY"
            models = ["gpt-4o"]
            priority = 1
            timeout = "20s"

            [[providers]]
            name = "claude-backup"
            type = "anthropic"
            api_key_ref = "MODELMUX_TEST_API_KEY"
            models = ["claude-sonnet-4-20250514"]
            priority = 2

            [rate_limit]
            requests_per_window = 100
            window_seconds = 60

            [rate_limit.per_user]
            requests_per_minute = 30

            [circuit_breaker]
            failure_threshold = 3
            recovery_timeout = "45s"

            [caching.response_cache]
            max_size_mb = 32
            ttl = "10m"

            [condensation]
            truncation_threshold = 6000
            fallback_strategies = ["truncate_head", "skip"]

            [logging]
            level = "debug"
            format = "json"
        "#;
        let config = Config::parse(doc, None).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].timeout, Duration::from_secs(20));
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.caching.response_cache.ttl, Duration::from_secs(600));
        assert_eq!(config.condensation.truncation_threshold, 6000);
        assert_eq!(
            config.condensation.fallback_strategies,
            vec![FallbackStrategy::TruncateHead, FallbackStrategy::Skip]
        );
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.global_bucket().is_some());
        assert!(config.user_bucket().is_some());
    }

    #[test]
    fn unknown_provider_type_fails_parse() {
        let doc = r#"
            [[providers]]
            name = "x"
            type = "mainframe"
            api_key_ref = "KEY"
            models = ["m"]
            priority = 1
        "#;
        assert!(Config::parse(doc, None).is_err());
    }

    #[test]
    fn legacy_flat_layout_migrates() {
        std::env::set_var("MODELMUX_TEST_API_KEY", "sk-test");
        let doc = r#"
            host = "0.0.0.0"
            port = 3100
            api_keys = ["sk-legacy"]
            log_level = "warn"

            [[providers]]
            name = "openai"
            type = "openai"
            api_key_ref = "MODELMUX_TEST_API_KEY"
            models = ["gpt-4o"]
            priority = 1
        "#;
        let config = Config::parse(doc, None).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 3100);
        assert_eq!(config.auth.api_keys, vec!["sk-legacy"]);
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.providers.len(), 1);
        config.validate().unwrap();
    }

    #[test]
    fn legacy_migration_writes_a_sibling_backup() {
        std::env::set_var("MODELMUX_TEST_API_KEY", "sk-test");
        let dir = std::env::temp_dir().join(format!("modelmux-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "host = \"127.0.0.1\"\nport = 3100\n").unwrap();

        let _ = Config::parse(&std::fs::read_to_string(&path).unwrap(), Some(&path)).unwrap();
        assert!(path.with_extension("toml.bak").exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn restart_required_fields_are_detected() {
        let base = valid_config();
        let mut next = base.clone();
        next.server.port = 1234;
        assert_eq!(base.restart_required(&next), vec!["server"]);

        let mut next = base.clone();
        next.auth.header_name = Some("x-proxy-key".to_string());
        assert_eq!(base.restart_required(&next), vec!["auth.header_name"]);

        let mut next = base.clone();
        next.circuit_breaker.failure_threshold = 9;
        assert!(base.restart_required(&next).is_empty());
    }

    #[test]
    fn per_provider_default_rate_limit_fills_in() {
        let mut config = valid_config();
        config.rate_limit.per_provider.requests_per_hour = Some(120);
        config.providers[1].rate_limit = Some(999);

        let effective = config.effective_providers();
        assert_eq!(effective[0].rate_limit, Some(120));
        assert_eq!(effective[1].rate_limit, Some(999));
    }

    #[tokio::test]
    async fn rejected_reload_keeps_the_previous_snapshot() {
        std::env::set_var("MODELMUX_TEST_API_KEY", "sk-test");
        let dir = std::env::temp_dir().join(format!("modelmux-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");

        let good = r#"
            [[providers]]
            name = "openai"
            type = "openai"
            api_key_ref = "MODELMUX_TEST_API_KEY"
            models = ["gpt-4o"]
            priority = 1
        "#;
        std::fs::write(&path, good).unwrap();

        let config = Config::load(&path).unwrap();
        let (manager, rx) = ConfigManager::new(config, Some(path.clone()));
        assert_eq!(rx.borrow().version, 1);

        // A duplicate provider name must be rejected.
        let bad = r#"
            [[providers]]
            name = "openai"
            type = "openai"
            api_key_ref = "MODELMUX_TEST_API_KEY"
            models = ["gpt-4o"]
            priority = 1

            [[providers]]
            name = "openai"
            type = "openai"
            api_key_ref = "MODELMUX_TEST_API_KEY"
            models = ["gpt-4o"]
            priority = 2
        "#;
        std::fs::write(&path, bad).unwrap();

        let err = manager.reload().unwrap_err();
        assert!(err.errors.iter().any(|e| e.contains("duplicate provider name")));
        assert_eq!(rx.borrow().version, 1);
        assert!(matches!(
            manager.last_reload().unwrap().1,
            ReloadOutcome::Rejected { .. }
        ));

        // Fixing the file makes the next reload land as version 2.
        std::fs::write(&path, good).unwrap();
        let version = manager.reload().unwrap();
        assert_eq!(version, 2);
        assert_eq!(rx.borrow().version, 2);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
