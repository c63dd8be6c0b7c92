//! # Provider Registry
//!
//! Owns the runtime state for every configured provider: the adapter, its
//! circuit breaker, rolling success and latency statistics, and the health
//! status derived by the monitor. The routing engine asks the registry for
//! an ordered candidate list per request and reports outcomes back.
//!
//! On a configuration change the registry computes a diff. Removed providers
//! are drained (in-flight requests finish before the state is dropped),
//! added providers are built fresh, and providers changed in place keep
//! their accumulated state while adopting the new parameters. The adapter
//! and its HTTP pool are only rebuilt when identity or pool fields change
//! (see [`ProviderConfig::requires_adapter_rebuild`]).

use crate::circuit_breaker::{BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreaker};
use crate::health::HealthStatus;
use crate::providers::{build_provider, Provider, ProviderConfig};
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Sliding window length for per-provider success statistics.
const STATS_WINDOW: usize = 50;
/// Smoothing factor for the latency EMA.
const LATENCY_ALPHA: f64 = 0.2;

#[derive(Debug, Default)]
struct ProviderStats {
    window: VecDeque<bool>,
    latency_ema_ms: f64,
    total_requests: u64,
    failed_requests: u64,
    consecutive_probe_failures: u32,
    last_probe_ok: Option<bool>,
    last_probe_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl ProviderStats {
    fn record(&mut self, success: bool) {
        if self.window.len() == STATS_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(success);
        self.total_requests += 1;
        if !success {
            self.failed_requests += 1;
        }
    }

    fn success_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 1.0;
        }
        let ok = self.window.iter().filter(|s| **s).count();
        ok as f64 / self.window.len() as f64
    }

    fn record_latency(&mut self, latency_ms: f64) {
        if self.latency_ema_ms == 0.0 {
            self.latency_ema_ms = latency_ms;
        } else {
            self.latency_ema_ms =
                LATENCY_ALPHA * latency_ms + (1.0 - LATENCY_ALPHA) * self.latency_ema_ms;
        }
    }
}

/// Outcome report from the routing engine or the health monitor.
#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    Success { latency: Duration },
    /// `breaker` is true when the failure counts against the circuit
    /// breaker window (upstream or transport faults only).
    Failure { breaker: bool },
}

/// Runtime state for one configured provider.
pub struct ProviderEntry {
    config: RwLock<ProviderConfig>,
    adapter: RwLock<Arc<dyn Provider>>,
    pub breaker: CircuitBreaker,
    stats: Mutex<ProviderStats>,
    in_flight: AtomicUsize,
    draining: AtomicBool,
}

impl ProviderEntry {
    fn new(config: ProviderConfig, breaker_config: BreakerConfig) -> Result<Self, String> {
        let adapter = build_provider(&config)
            .map_err(|e| format!("provider {}: {e}", config.name))?;
        Ok(Self {
            breaker: CircuitBreaker::new(config.name.clone(), breaker_config),
            config: RwLock::new(config),
            adapter: RwLock::new(adapter),
            stats: Mutex::new(ProviderStats::default()),
            in_flight: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> ProviderConfig {
        self.config.read().unwrap().clone()
    }

    pub fn adapter(&self) -> Arc<dyn Provider> {
        self.adapter.read().unwrap().clone()
    }

    pub fn success_rate(&self) -> f64 {
        self.stats.lock().unwrap().success_rate()
    }

    pub fn avg_latency_ms(&self) -> f64 {
        self.stats.lock().unwrap().latency_ema_ms
    }

    pub fn total_requests(&self) -> u64 {
        self.stats.lock().unwrap().total_requests
    }

    pub fn failed_requests(&self) -> u64 {
        self.stats.lock().unwrap().failed_requests
    }

    pub fn consecutive_probe_failures(&self) -> u32 {
        self.stats.lock().unwrap().consecutive_probe_failures
    }

    pub fn last_probe(&self) -> (Option<bool>, Option<chrono::DateTime<chrono::Utc>>) {
        let stats = self.stats.lock().unwrap();
        (stats.last_probe_ok, stats.last_probe_at)
    }

    pub fn breaker_snapshot(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed)
    }
}

/// Keeps `in_flight` accurate across early returns and panics.
pub struct RequestGuard {
    entry: Arc<ProviderEntry>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.entry.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct ProviderRegistry {
    providers: Arc<DashMap<String, Arc<ProviderEntry>>>,
    breaker_defaults: RwLock<BreakerConfig>,
    health: RwLock<HashMap<String, HealthStatus>>,
}

impl ProviderRegistry {
    pub fn new(breaker_defaults: BreakerConfig) -> Self {
        Self {
            providers: Arc::new(DashMap::new()),
            breaker_defaults: RwLock::new(breaker_defaults),
            health: RwLock::new(HashMap::new()),
        }
    }

    /// Build the registry contents from a validated provider list.
    ///
    /// Returns the names that failed to build; valid providers are still
    /// installed so a single bad secret does not take the fleet down.
    pub fn apply_config(
        &self,
        providers: &[ProviderConfig],
        breaker_defaults: BreakerConfig,
    ) -> Vec<String> {
        *self.breaker_defaults.write().unwrap() = breaker_defaults;
        let defaults = self.breaker_defaults.read().unwrap().clone();
        let mut errors = Vec::new();
        let incoming: HashMap<&str, &ProviderConfig> =
            providers.iter().map(|p| (p.name.as_str(), p)).collect();

        // Drain providers that disappeared from the config.
        let current: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        for name in current {
            if !incoming.contains_key(name.as_str()) {
                self.drain(&name);
            }
        }

        for config in providers {
            match self.providers.get(&config.name).map(|e| e.value().clone()) {
                None => match ProviderEntry::new(config.clone(), defaults.clone()) {
                    Ok(entry) => {
                        self.providers.insert(config.name.clone(), Arc::new(entry));
                    }
                    Err(e) => errors.push(e),
                },
                Some(entry) => {
                    let needs_rebuild = entry.config().requires_adapter_rebuild(config);
                    if needs_rebuild {
                        match build_provider(config) {
                            Ok(adapter) => *entry.adapter.write().unwrap() = adapter,
                            Err(e) => {
                                errors.push(format!("provider {}: {e}", config.name));
                                continue;
                            }
                        }
                    }
                    *entry.config.write().unwrap() = config.clone();
                    entry.breaker.update_config(defaults.clone());
                    entry.draining.store(false, Ordering::Relaxed);
                }
            }
        }
        errors
    }

    /// Stop selecting a provider and drop its state once in-flight calls
    /// have finished.
    fn drain(&self, name: &str) {
        let Some(entry) = self.providers.get(name).map(|e| e.value().clone()) else {
            return;
        };
        entry.draining.store(true, Ordering::Relaxed);
        tracing::info!(provider = name, "draining removed provider");

        let providers = Arc::clone(&self.providers);
        let name = name.to_string();
        tokio::spawn(async move {
            while entry.in_flight.load(Ordering::Relaxed) > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            providers.remove(&name);
            tracing::info!(provider = %name, "removed provider after drain");
        });
    }

    /// Ordered candidate list for a request.
    ///
    /// Filters: enabled, not draining, serves the model, breaker not open,
    /// health not unhealthy. Ordered by priority ascending with ties broken
    /// by rolling success rate, then latency, then name for determinism.
    /// Health is read from the latest snapshot without blocking.
    pub fn select_candidates(&self, model: &str) -> Vec<String> {
        let health = self.health.read().unwrap().clone();
        let mut candidates: Vec<(i32, f64, f64, String)> = self
            .providers
            .iter()
            .filter_map(|item| {
                let entry = item.value();
                let config = entry.config();
                if !config.enabled || entry.is_draining() || !config.supports_model(model) {
                    return None;
                }
                if entry.breaker.state() == BreakerState::Open {
                    return None;
                }
                if health.get(&config.name) == Some(&HealthStatus::Unhealthy) {
                    return None;
                }
                Some((
                    config.priority,
                    entry.success_rate(),
                    entry.avg_latency_ms(),
                    config.name,
                ))
            })
            .collect();

        candidates.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| a.3.cmp(&b.3))
        });
        candidates.into_iter().map(|(_, _, _, name)| name).collect()
    }

    pub fn entry(&self, name: &str) -> Option<Arc<ProviderEntry>> {
        self.providers.get(name).map(|e| e.value().clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Mark a request in flight against a provider.
    pub fn begin_request(&self, name: &str) -> Option<RequestGuard> {
        let entry = self.entry(name)?;
        entry.in_flight.fetch_add(1, Ordering::Relaxed);
        Some(RequestGuard { entry })
    }

    /// Forward an outcome to the breaker and statistics.
    pub fn record(&self, name: &str, outcome: Outcome) {
        let Some(entry) = self.entry(name) else {
            return;
        };
        match outcome {
            Outcome::Success { latency } => {
                entry.breaker.record_success();
                let mut stats = entry.stats.lock().unwrap();
                stats.record(true);
                stats.record_latency(latency.as_secs_f64() * 1000.0);
            }
            Outcome::Failure { breaker } => {
                if breaker {
                    entry.breaker.record_failure();
                }
                entry.stats.lock().unwrap().record(false);
            }
        }
    }

    /// Record a health-probe result without touching the breaker.
    pub fn record_probe(&self, name: &str, ok: bool, latency: Option<Duration>) {
        let Some(entry) = self.entry(name) else {
            return;
        };
        let mut stats = entry.stats.lock().unwrap();
        stats.last_probe_ok = Some(ok);
        stats.last_probe_at = Some(chrono::Utc::now());
        if ok {
            stats.consecutive_probe_failures = 0;
            if let Some(latency) = latency {
                stats.record_latency(latency.as_secs_f64() * 1000.0);
            }
        } else {
            stats.consecutive_probe_failures += 1;
        }
    }

    /// Install the monitor's derived statuses; read by candidate selection.
    pub fn update_health(&self, statuses: HashMap<String, HealthStatus>) {
        *self.health.write().unwrap() = statuses;
    }

    pub fn health_of(&self, name: &str) -> Option<HealthStatus> {
        self.health.read().unwrap().get(name).copied()
    }
}
