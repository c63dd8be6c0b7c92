//! # Health Monitoring
//!
//! Periodic liveness probes across all configured providers. Each cycle
//! probes every provider with a tight deadline, folds the result into the
//! registry's rolling statistics, derives a status per provider, and
//! publishes the whole snapshot on a watch channel. The routing path never
//! waits on a probe; it reads the most recent snapshot.
//!
//! Status derivation:
//!
//! - `disabled` when the config marks the provider disabled;
//! - `unhealthy` when the breaker is open or the last N probes failed;
//! - `degraded` when the rolling success rate is below the warn threshold;
//! - `healthy` otherwise.

use crate::circuit_breaker::{BreakerSnapshot, BreakerState};
use crate::registry::ProviderRegistry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Disabled,
}

/// Per-provider health view published to the gateway surface.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub status: HealthStatus,
    pub rolling_success_rate: f64,
    pub avg_latency_ms: f64,
    pub last_check_at: chrono::DateTime<chrono::Utc>,
    pub enabled_models: Vec<String>,
    pub breaker: BreakerSnapshot,
    pub consecutive_probe_failures: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    #[serde(with = "crate::common::duration_serde")]
    pub interval: Duration,
    #[serde(with = "crate::common::duration_serde")]
    pub timeout: Duration,
    /// Consecutive probe failures before a provider is unhealthy
    pub unhealthy_threshold: u32,
    /// Rolling success rate below which a provider is degraded
    pub degraded_success_rate: f64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            unhealthy_threshold: 3,
            degraded_success_rate: 0.8,
        }
    }
}

pub type HealthSnapshot = HashMap<String, ProviderHealth>;

pub struct HealthMonitor {
    registry: Arc<ProviderRegistry>,
    config: HealthCheckConfig,
    tx: watch::Sender<HealthSnapshot>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        config: HealthCheckConfig,
    ) -> (Self, watch::Receiver<HealthSnapshot>) {
        let (tx, rx) = watch::channel(HealthSnapshot::new());
        (
            Self {
                registry,
                config,
                tx,
            },
            rx,
        )
    }

    /// Run the probe loop until the process exits. No-op when disabled.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if !self.config.enabled {
                tracing::info!("health monitoring disabled");
                return;
            }
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }

    /// One probe cycle: probe every provider, derive statuses, publish.
    pub async fn run_once(&self) {
        for name in self.registry.names() {
            let Some(entry) = self.registry.entry(&name) else {
                continue;
            };
            let config = entry.config();
            if !config.enabled || entry.is_draining() {
                continue;
            }

            let adapter = entry.adapter();
            let started = Instant::now();
            let result =
                tokio::time::timeout(self.config.timeout, adapter.probe()).await;
            let latency = started.elapsed();
            let ok = matches!(result, Ok(Ok(())));
            if !ok {
                tracing::debug!(provider = %name, ?result, "health probe failed");
            }
            self.registry.record_probe(&name, ok, ok.then_some(latency));
        }

        let snapshot = self.build_snapshot();
        let statuses = snapshot
            .iter()
            .map(|(name, health)| (name.clone(), health.status))
            .collect();
        self.registry.update_health(statuses);
        let _ = self.tx.send(snapshot);
    }

    fn build_snapshot(&self) -> HealthSnapshot {
        let mut snapshot = HealthSnapshot::new();
        for name in self.registry.names() {
            let Some(entry) = self.registry.entry(&name) else {
                continue;
            };
            let config = entry.config();
            let breaker = entry.breaker_snapshot();
            let status = derive_status(
                config.enabled,
                breaker.state,
                entry.consecutive_probe_failures(),
                entry.success_rate(),
                &self.config,
            );
            snapshot.insert(
                name,
                ProviderHealth {
                    status,
                    rolling_success_rate: entry.success_rate(),
                    avg_latency_ms: entry.avg_latency_ms(),
                    last_check_at: entry.last_probe().1.unwrap_or_else(chrono::Utc::now),
                    enabled_models: config.models.clone(),
                    breaker,
                    consecutive_probe_failures: entry.consecutive_probe_failures(),
                },
            );
        }
        snapshot
    }
}

pub fn derive_status(
    enabled: bool,
    breaker: BreakerState,
    consecutive_probe_failures: u32,
    success_rate: f64,
    config: &HealthCheckConfig,
) -> HealthStatus {
    if !enabled {
        return HealthStatus::Disabled;
    }
    if breaker == BreakerState::Open || consecutive_probe_failures >= config.unhealthy_threshold {
        return HealthStatus::Unhealthy;
    }
    if success_rate < config.degraded_success_rate {
        return HealthStatus::Degraded;
    }
    HealthStatus::Healthy
}
