//! # Circuit Breaker
//!
//! Per-provider state machine that blocks calls to an unhealthy upstream so
//! that one failing provider cannot amplify load across the fleet.
//!
//! States:
//!
//! - **Closed**: all calls allowed. Outcomes feed a sliding window of the
//!   last N results; when the window holds `failure_threshold` failures the
//!   breaker opens and `open_until` is set to now + `recovery_timeout`.
//! - **Open**: calls are rejected without touching the upstream. Once
//!   `open_until` passes, the next permit transitions to half-open.
//! - **Half-open**: up to `half_open_max_calls` trial calls may be in flight.
//!   The first success closes the breaker and resets the window; any failure
//!   reopens it with a fresh `open_until`.
//!
//! Only failures classified as upstream or transport count against the
//! window (see [`crate::error::ProviderError::is_breaker_failure`]); the
//! caller is responsible for filtering before calling `record_failure`.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Breaker tuning parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures within the window that trip the breaker
    pub failure_threshold: u32,
    /// How long the breaker stays open before probing recovery
    #[serde(with = "crate::common::duration_serde")]
    pub recovery_timeout: Duration,
    /// Trial calls admitted concurrently while half-open
    pub half_open_max_calls: u32,
    /// Sliding window length (number of recorded outcomes)
    pub window_size: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 2,
            window_size: 20,
        }
    }
}

/// Breaker operational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    /// Last N outcomes, true = failure
    window: VecDeque<bool>,
    consecutive_failures: u32,
    open_until: Option<Instant>,
    half_open_in_flight: u32,
    config: BreakerConfig,
}

impl BreakerInner {
    fn failures_in_window(&self) -> u32 {
        self.window.iter().filter(|failed| **failed).count() as u32
    }

    fn push_outcome(&mut self, failed: bool) {
        if self.window.len() == self.config.window_size {
            self.window.pop_front();
        }
        self.window.push_back(failed);
    }

    fn trip(&mut self) {
        self.state = BreakerState::Open;
        self.open_until = Some(Instant::now() + self.config.recovery_timeout);
        self.half_open_in_flight = 0;
    }

    fn reset(&mut self) {
        self.state = BreakerState::Closed;
        self.window.clear();
        self.consecutive_failures = 0;
        self.open_until = None;
        self.half_open_in_flight = 0;
    }
}

/// Point-in-time view of a breaker, for health and admin endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub failures_in_window: u32,
    /// Seconds until the breaker will probe recovery, when open
    pub open_for_secs: Option<u64>,
}

/// One provider's circuit breaker.
///
/// All transitions happen under a single short mutex, so any task observing
/// a half-open success or failure produces one consistent next state.
pub struct CircuitBreaker {
    name: String,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                window: VecDeque::with_capacity(config.window_size),
                consecutive_failures: 0,
                open_until: None,
                half_open_in_flight: 0,
                config,
            }),
        }
    }

    /// Ask the breaker whether a call may proceed.
    ///
    /// Returns false while open; flips open to half-open once the recovery
    /// timeout has elapsed and admits up to `half_open_max_calls` trial
    /// calls. Every `true` from a half-open breaker reserves a trial slot
    /// that the matching `record_*` call releases.
    pub fn permit(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let expired = inner
                    .open_until
                    .map(|until| Instant::now() >= until)
                    .unwrap_or(true);
                if !expired {
                    return false;
                }
                inner.state = BreakerState::HalfOpen;
                inner.half_open_in_flight = 1;
                tracing::info!(breaker = %self.name, "circuit breaker half-open, probing recovery");
                true
            }
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight < inner.config.half_open_max_calls {
                    inner.half_open_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
                inner.push_outcome(false);
            }
            BreakerState::HalfOpen => {
                tracing::info!(breaker = %self.name, "circuit breaker closed after successful probe");
                inner.reset();
            }
            BreakerState::Open => {
                // A call admitted before the trip finished late. Ignore.
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures += 1;
        match inner.state {
            BreakerState::Closed => {
                inner.push_outcome(true);
                if inner.failures_in_window() >= inner.config.failure_threshold {
                    tracing::warn!(
                        breaker = %self.name,
                        failures = inner.failures_in_window(),
                        "circuit breaker open"
                    );
                    inner.trip();
                }
            }
            BreakerState::HalfOpen => {
                tracing::warn!(breaker = %self.name, "probe failed, circuit breaker reopened");
                inner.trip();
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().unwrap();
        // Report half-open once the open period has lapsed, without
        // consuming a trial slot.
        if inner.state == BreakerState::Open {
            let expired = inner
                .open_until
                .map(|until| Instant::now() >= until)
                .unwrap_or(true);
            if expired {
                inner.state = BreakerState::HalfOpen;
                inner.half_open_in_flight = 0;
            }
        }
        inner.state
    }

    /// Adopt new parameters on the next transition; accumulated window
    /// contents and state survive a config change.
    pub fn update_config(&self, config: BreakerConfig) {
        let mut inner = self.inner.lock().unwrap();
        inner.config = config;
        while inner.window.len() > inner.config.window_size {
            inner.window.pop_front();
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().unwrap();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failures_in_window: inner.failures_in_window(),
            open_for_secs: inner.open_until.and_then(|until| {
                let now = Instant::now();
                (until > now).then(|| (until - now).as_secs())
            }),
        }
    }

    /// Trip the breaker by hand, for tests and emergency shedding.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.trip();
    }

    /// Close the breaker by hand and clear its history.
    pub fn force_closed(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.reset();
    }
}
