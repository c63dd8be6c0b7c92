//! # Token-Bucket Rate Limiting
//!
//! Admission control per `(scope, key)`: one bucket per provider, per
//! authenticated caller, and one for the whole process. Buckets never block;
//! `try_acquire` either admits the request or reports how long the caller
//! would have to wait, and the caller decides whether to wait, fail, or move
//! on to the next provider.
//!
//! Bucket parameters arrive with each call rather than being stored here, so
//! a hot-reloaded configuration takes effect on the next acquisition without
//! touching accumulated token balances.

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Which pool a bucket belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Provider,
    User,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Provider => "provider",
            Scope::User => "user",
        }
    }
}

/// Capacity and refill rate for one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    /// Maximum tokens the bucket can hold (burst size)
    pub capacity: f64,
    /// Tokens restored per second
    pub refill_per_sec: f64,
}

impl BucketConfig {
    /// Derive a bucket from a requests-per-hour limit, the unit provider
    /// configs use.
    pub fn per_hour(requests_per_hour: u32, burst: Option<u32>) -> Self {
        let refill = f64::from(requests_per_hour) / 3600.0;
        Self {
            capacity: f64::from(burst.unwrap_or_else(|| requests_per_hour.max(1).min(60))),
            refill_per_sec: refill,
        }
    }

    /// Derive a bucket from a requests-per-window limit.
    pub fn per_window(requests: u32, window: Duration, burst: Option<u32>) -> Self {
        let secs = window.as_secs_f64().max(1.0);
        Self {
            capacity: f64::from(burst.unwrap_or(requests).max(1)),
            refill_per_sec: f64::from(requests) / secs,
        }
    }
}

/// Outcome of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Granted,
    /// Denied; roughly this long until enough tokens accrue.
    RetryAfter(Duration),
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted)
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_used: Instant,
}

/// Sharded token-bucket store.
///
/// The map is sharded by key hash; each acquisition takes only the shard
/// lock for its bucket.
pub struct RateLimiter {
    buckets: DashMap<(Scope, String), Bucket>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Try to take `n` tokens from the bucket for `(scope, key)`.
    ///
    /// The bucket is created full on first sight. Refill is continuous:
    /// elapsed time since the last acquisition is converted to tokens,
    /// capped at `capacity`.
    pub fn try_acquire(&self, scope: Scope, key: &str, config: BucketConfig, n: u32) -> Admission {
        let now = Instant::now();
        let needed = f64::from(n);
        let mut entry = self
            .buckets
            .entry((scope, key.to_string()))
            .or_insert_with(|| Bucket {
                tokens: config.capacity,
                last_refill: now,
                last_used: now,
            });

        let bucket = entry.value_mut();
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens =
            (bucket.tokens + elapsed.as_secs_f64() * config.refill_per_sec).min(config.capacity);
        bucket.last_refill = now;
        bucket.last_used = now;

        if bucket.tokens >= needed {
            bucket.tokens -= needed;
            Admission::Granted
        } else if config.refill_per_sec <= 0.0 {
            // A zero refill rate can never admit; report an hour so callers
            // surface a sane Retry-After instead of infinity.
            Admission::RetryAfter(Duration::from_secs(3600))
        } else {
            let deficit = needed - bucket.tokens;
            let wait = deficit / config.refill_per_sec;
            Admission::RetryAfter(Duration::from_secs_f64(wait.max(0.001)))
        }
    }

    /// Drop buckets that have been idle for longer than `idle_for`.
    ///
    /// Bounds memory when caller keys churn (one bucket per API key).
    pub fn prune_idle(&self, idle_for: Duration) -> usize {
        let cutoff = Instant::now()
            .checked_sub(idle_for)
            .unwrap_or_else(Instant::now);
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.last_used > cutoff);
        before - self.buckets.len()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
