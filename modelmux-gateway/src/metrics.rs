//! # Request Metrics
//!
//! In-process counters for the operational surface: request and error
//! totals per route and per provider, latency aggregates, and token usage
//! pass-through. Exposed as JSON on `/v1/metrics` and in Prometheus text
//! exposition format on `/v1/metrics/prometheus`.
//!
//! The collector is owned by the application state and shared by
//! reference; recording is lock-light (one short mutex per update).

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

const LATENCY_ALPHA: f64 = 0.1;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RouteMetrics {
    pub requests: u64,
    pub errors: u64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderRequestMetrics {
    pub requests: u64,
    pub errors: u64,
    pub avg_latency_ms: f64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Default)]
struct MetricsInner {
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    total_requests: u64,
    total_errors: u64,
    status_counts: HashMap<u16, u64>,
    routes: HashMap<String, RouteMetrics>,
    providers: HashMap<String, ProviderRequestMetrics>,
    cache_hits: u64,
    cache_misses: u64,
}

/// One request's worth of observations.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub route: &'static str,
    pub status: u16,
    pub latency: Duration,
    pub provider: Option<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: i64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub error_rate: f64,
    pub status_counts: HashMap<u16, u64>,
    pub routes: HashMap<String, RouteMetrics>,
    pub providers: HashMap<String, ProviderRequestMetrics>,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

pub struct MetricsCollector {
    inner: Mutex<MetricsInner>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MetricsInner {
                started_at: Some(chrono::Utc::now()),
                ..MetricsInner::default()
            }),
        }
    }

    pub fn record(&self, record: RequestRecord) {
        let mut inner = self.inner.lock().unwrap();
        let latency_ms = record.latency.as_secs_f64() * 1000.0;
        let failed = record.status >= 400;

        inner.total_requests += 1;
        if failed {
            inner.total_errors += 1;
        }
        *inner.status_counts.entry(record.status).or_default() += 1;

        let route = inner.routes.entry(record.route.to_string()).or_default();
        route.requests += 1;
        if failed {
            route.errors += 1;
        }
        route.avg_latency_ms = ema(route.avg_latency_ms, latency_ms);

        if let Some(provider) = record.provider {
            let entry = inner.providers.entry(provider).or_default();
            entry.requests += 1;
            if failed {
                entry.errors += 1;
            }
            entry.avg_latency_ms = ema(entry.avg_latency_ms, latency_ms);
            entry.prompt_tokens += record.prompt_tokens;
            entry.completion_tokens += record.completion_tokens;
        }
    }

    pub fn record_cache(&self, hit: bool) {
        let mut inner = self.inner.lock().unwrap();
        if hit {
            inner.cache_hits += 1;
        } else {
            inner.cache_misses += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().unwrap();
        let uptime = inner
            .started_at
            .map(|t| (chrono::Utc::now() - t).num_seconds())
            .unwrap_or(0);
        MetricsSnapshot {
            uptime_seconds: uptime,
            total_requests: inner.total_requests,
            total_errors: inner.total_errors,
            error_rate: if inner.total_requests == 0 {
                0.0
            } else {
                inner.total_errors as f64 / inner.total_requests as f64
            },
            status_counts: inner.status_counts.clone(),
            routes: inner.routes.clone(),
            providers: inner.providers.clone(),
            cache_hits: inner.cache_hits,
            cache_misses: inner.cache_misses,
        }
    }

    /// Render the snapshot in Prometheus text exposition format.
    pub fn prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = String::new();

        out.push_str("# TYPE modelmux_requests_total counter\n");
        out.push_str(&format!(
            "modelmux_requests_total {}\n",
            snapshot.total_requests
        ));
        out.push_str("# TYPE modelmux_errors_total counter\n");
        out.push_str(&format!("modelmux_errors_total {}\n", snapshot.total_errors));
        out.push_str("# TYPE modelmux_uptime_seconds gauge\n");
        out.push_str(&format!(
            "modelmux_uptime_seconds {}\n",
            snapshot.uptime_seconds
        ));

        out.push_str("# TYPE modelmux_responses_total counter\n");
        let mut statuses: Vec<_> = snapshot.status_counts.iter().collect();
        statuses.sort();
        for (status, count) in statuses {
            out.push_str(&format!(
                "modelmux_responses_total{{status=\"{status}\"}} {count}\n"
            ));
        }

        out.push_str("# TYPE modelmux_provider_requests_total counter\n");
        out.push_str("# TYPE modelmux_provider_latency_ms gauge\n");
        let mut providers: Vec<_> = snapshot.providers.iter().collect();
        providers.sort_by_key(|(name, _)| name.as_str());
        for (name, metrics) in providers {
            out.push_str(&format!(
                "modelmux_provider_requests_total{{provider=\"{name}\"}} {}\n",
                metrics.requests
            ));
            out.push_str(&format!(
                "modelmux_provider_latency_ms{{provider=\"{name}\"}} {:.2}\n",
                metrics.avg_latency_ms
            ));
        }

        out.push_str("# TYPE modelmux_cache_hits_total counter\n");
        out.push_str(&format!("modelmux_cache_hits_total {}\n", snapshot.cache_hits));
        out.push_str("# TYPE modelmux_cache_misses_total counter\n");
        out.push_str(&format!(
            "modelmux_cache_misses_total {}\n",
            snapshot.cache_misses
        ));
        out
    }
}

fn ema(current: f64, sample: f64) -> f64 {
    if current == 0.0 {
        sample
    } else {
        LATENCY_ALPHA * sample + (1.0 - LATENCY_ALPHA) * current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: u16, provider: Option<&str>) -> RequestRecord {
        RequestRecord {
            route: "/v1/chat/completions",
            status,
            latency: Duration::from_millis(100),
            provider: provider.map(|p| p.to_string()),
            prompt_tokens: 10,
            completion_tokens: 5,
        }
    }

    #[test]
    fn counters_accumulate() {
        let collector = MetricsCollector::new();
        collector.record(record(200, Some("openai")));
        collector.record(record(200, Some("openai")));
        collector.record(record(502, Some("anthropic")));

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.total_requests, 3);
        assert_eq!(snapshot.total_errors, 1);
        assert_eq!(snapshot.status_counts[&200], 2);
        assert_eq!(snapshot.providers["openai"].requests, 2);
        assert_eq!(snapshot.providers["openai"].prompt_tokens, 20);
        assert_eq!(snapshot.providers["anthropic"].errors, 1);
        assert!(snapshot.error_rate > 0.3 && snapshot.error_rate < 0.34);
    }

    #[test]
    fn prometheus_exposition_contains_series() {
        let collector = MetricsCollector::new();
        collector.record(record(200, Some("openai")));
        collector.record_cache(true);

        let text = collector.prometheus();
        assert!(text.contains("modelmux_requests_total 1"));
        assert!(text.contains("modelmux_responses_total{status=\"200\"} 1"));
        assert!(text.contains("modelmux_provider_requests_total{provider=\"openai\"} 1"));
        assert!(text.contains("modelmux_cache_hits_total 1"));
    }
}
