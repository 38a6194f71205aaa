// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Circuit Breaker
//!
//! Three-state fault-tolerance primitive guarding every external call:
//!
//! ```text
//! closed ──N consecutive failures──▶ open
//! open ──cooldown elapsed, checked lazily by is_open()──▶ half-open
//! half-open ──M consecutive successes──▶ closed
//! half-open ──one failure──▶ open
//! ```
//!
//! All transitions happen under a single mutex, so concurrent callers observe
//! a linearizable sequence and the breaker never opens twice for one trip.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Breaker state machine (no I/O)

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_cooldown", with = "humantime_serde")]
    pub cooldown: Duration,
    /// Open cycles without a full recovery before the breaker alerts.
    #[serde(default = "default_alert_after_cycles")]
    pub alert_after_cycles: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    3
}

fn default_cooldown() -> Duration {
    Duration::from_secs(60)
}

fn default_alert_after_cycles() -> u32 {
    3
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            cooldown: default_cooldown(),
            alert_after_cycles: default_alert_after_cycles(),
        }
    }
}

/// Point-in-time copy of the breaker state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Only meaningful while half-open
    pub consecutive_successes: u32,
    pub opened_at: Option<Instant>,
    /// Times opened since the last full recovery
    pub open_cycles: u32,
}

impl CircuitBreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            open_cycles: 0,
        }
    }
}

pub struct CircuitBreaker {
    channel: String,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitBreakerState>,
}

impl CircuitBreaker {
    pub fn new(channel: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            channel: channel.into(),
            config,
            inner: Mutex::new(CircuitBreakerState::closed()),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether the caller should skip the real call. Moves an expired open
    /// breaker to half-open as a side effect.
    pub fn is_open(&self) -> bool {
        self.is_open_at(Instant::now())
    }

    pub fn is_open_at(&self, now: Instant) -> bool {
        let mut state = self.inner.lock();
        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|opened| now.saturating_duration_since(opened))
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.cooldown {
                    state.state = CircuitState::HalfOpen;
                    state.consecutive_successes = 0;
                    self.transitioned(CircuitState::HalfOpen);
                    info!(channel = %self.channel, "Circuit half-open, probing");
                    false
                } else {
                    true
                }
            }
        }
    }

    pub fn record_success(&self) -> CircuitState {
        let mut state = self.inner.lock();
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                state.consecutive_successes += 1;
                if state.consecutive_successes >= self.config.success_threshold {
                    *state = CircuitBreakerState::closed();
                    self.transitioned(CircuitState::Closed);
                    info!(channel = %self.channel, "Circuit closed after recovery");
                }
            }
            // A call that started before the trip finished late; it proves nothing.
            CircuitState::Open => {}
        }
        state.state
    }

    pub fn record_failure(&self) -> CircuitState {
        self.record_failure_at(Instant::now())
    }

    pub fn record_failure_at(&self, now: Instant) -> CircuitState {
        self.fail(now).0
    }

    /// Records a failure and returns the post-trip state if this very call
    /// opened the breaker. Exactly one caller sees `Some` per trip.
    pub fn record_failure_tripping(&self) -> Option<CircuitBreakerState> {
        self.fail(Instant::now()).1
    }

    fn fail(&self, now: Instant) -> (CircuitState, Option<CircuitBreakerState>) {
        let mut state = self.inner.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let trips = match state.state {
            CircuitState::Closed => state.consecutive_failures >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if trips {
            self.trip(&mut state, now);
            return (state.state, Some(state.clone()));
        }
        (state.state, None)
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        self.inner.lock().clone()
    }

    fn trip(&self, state: &mut CircuitBreakerState, now: Instant) {
        state.state = CircuitState::Open;
        state.opened_at = Some(now);
        state.consecutive_successes = 0;
        state.open_cycles += 1;
        self.transitioned(CircuitState::Open);

        if state.open_cycles >= self.config.alert_after_cycles {
            error!(
                channel = %self.channel,
                open_cycles = state.open_cycles,
                consecutive_failures = state.consecutive_failures,
                "Circuit keeps reopening, dependency has not recovered"
            );
        } else {
            warn!(
                channel = %self.channel,
                consecutive_failures = state.consecutive_failures,
                cooldown_secs = self.config.cooldown.as_secs(),
                "Circuit opened"
            );
        }
    }

    fn transitioned(&self, to: CircuitState) {
        metrics::counter!(
            "warden_circuit_transitions_total",
            "channel" => self.channel.clone(),
            "to" => to.to_string()
        )
        .increment(1);
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("channel", &self.channel)
            .field("state", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn breaker(failures: u32, successes: u32, cooldown_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: failures,
                success_threshold: successes,
                cooldown: Duration::from_secs(cooldown_secs),
                alert_after_cycles: 3,
            },
        )
    }

    #[test]
    fn test_opens_after_threshold() {
        let cb = breaker(3, 2, 60);
        let now = Instant::now();
        assert_eq!(cb.record_failure_at(now), CircuitState::Closed);
        assert_eq!(cb.record_failure_at(now), CircuitState::Closed);
        assert!(!cb.is_open_at(now));
        assert_eq!(cb.record_failure_at(now), CircuitState::Open);
        assert!(cb.is_open_at(now));
        assert!(cb.is_open_at(now + Duration::from_secs(59)));
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let cb = breaker(3, 2, 60);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 1);
    }

    #[test]
    fn test_half_open_after_cooldown_then_closes() {
        let cb = breaker(1, 2, 60);
        let opened = Instant::now();
        cb.record_failure_at(opened);
        assert!(!cb.is_open_at(opened + Duration::from_secs(60)));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert_eq!(cb.record_success(), CircuitState::HalfOpen);
        assert_eq!(cb.record_success(), CircuitState::Closed);
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.open_cycles, 0);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert!(snapshot.opened_at.is_none());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = breaker(1, 3, 10);
        let t0 = Instant::now();
        cb.record_failure_at(t0);
        let t1 = t0 + Duration::from_secs(10);
        assert!(!cb.is_open_at(t1));
        assert_eq!(cb.record_failure_at(t1), CircuitState::Open);
        assert!(cb.is_open_at(t1 + Duration::from_secs(5)));
        assert_eq!(cb.snapshot().open_cycles, 2);
        assert_eq!(cb.snapshot().opened_at, Some(t1));
    }

    #[test]
    fn test_failures_while_open_do_not_reopen() {
        let cb = breaker(1, 1, 60);
        let t0 = Instant::now();
        cb.record_failure_at(t0);
        cb.record_failure_at(t0 + Duration::from_secs(30));
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.open_cycles, 1);
        assert_eq!(snapshot.opened_at, Some(t0));
    }

    #[test]
    fn test_concurrent_failures_open_once() {
        let cb = Arc::new(breaker(5, 1, 60));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cb = cb.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        cb.record_failure();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.open_cycles, 1);
        assert_eq!(snapshot.consecutive_failures, 80);
    }

    #[test]
    fn test_config_parses_humantime() {
        let config: CircuitBreakerConfig =
            serde_yaml::from_str("failure_threshold: 2\ncooldown: 30s\n").unwrap();
        assert_eq!(config.failure_threshold, 2);
        assert_eq!(config.success_threshold, 3);
        assert_eq!(config.cooldown, Duration::from_secs(30));
    }
}
