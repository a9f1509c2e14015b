//! Circuit breaker guarding calls to an inference collaborator (§4.3).
//!
//! Grounded on the `CircuitBreaker` pattern used twice independently in the
//! example pack (a consecutive-failures tripwire guarding outbound AI
//! provider calls, and an async `RwLock`-based sibling guarding upstream API
//! calls) — both use the same closed/open/half-open vocabulary. This version
//! generalises the trip condition from "N consecutive failures" to the
//! spec's rolling-window failure rate, using a ring buffer of recent
//! outcomes behind one `parking_lot::Mutex`, which is the "shared resource,
//! lock-guarded with a minimal critical section" policy from §5.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Size of the rolling window of recent call outcomes.
    pub window: usize,
    /// Minimum calls in the window before the failure rate is evaluated.
    pub min_calls: usize,
    /// Failure rate in `[0.0, 1.0]` above which the breaker trips open.
    pub failure_rate_threshold: f64,
    /// Cooldown before `open -> half_open`.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: 20,
            min_calls: 5,
            failure_rate_threshold: 0.5,
            cooldown: Duration::from_secs(30),
        }
    }
}

struct Inner {
    outcomes: VecDeque<bool>,
    state: BreakerState,
    opened_at: Option<Instant>,
    /// While in `HalfOpen`, only one probe may be in flight.
    probe_in_flight: bool,
}

/// Per-collaborator breaker, shared across all dispatcher workers.
pub struct CircuitBreaker {
    name: &'static str,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

/// Permission to proceed, returned by `try_acquire`. Must be resolved with
/// `on_success`/`on_failure` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    is_probe: bool,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: BreakerConfig) -> Self {
        Self {
            name,
            config,
            inner: Mutex::new(Inner {
                outcomes: VecDeque::with_capacity(config.window),
                state: BreakerState::Closed,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Ask permission to place a call. `Err` means fail fast with
    /// `InferenceError::Unavailable` (§4.3).
    pub fn try_acquire(&self) -> Result<Permit, ()> {
        let mut guard = self.inner.lock();
        match guard.state {
            BreakerState::Closed => Ok(Permit { is_probe: false }),
            BreakerState::Open => {
                let opened_at = guard.opened_at.expect("open state always has opened_at");
                if opened_at.elapsed() >= self.config.cooldown {
                    guard.state = BreakerState::HalfOpen;
                    guard.probe_in_flight = true;
                    Ok(Permit { is_probe: true })
                } else {
                    Err(())
                }
            }
            BreakerState::HalfOpen => {
                if guard.probe_in_flight {
                    Err(())
                } else {
                    guard.probe_in_flight = true;
                    Ok(Permit { is_probe: true })
                }
            }
        }
    }

    pub fn on_success(&self, permit: Permit) {
        let mut guard = self.inner.lock();
        if permit.is_probe {
            guard.state = BreakerState::Closed;
            guard.opened_at = None;
            guard.probe_in_flight = false;
            guard.outcomes.clear();
            return;
        }
        Self::record(&mut guard, true, self.config.window);
        self.evaluate(&mut guard);
    }

    pub fn on_failure(&self, permit: Permit) {
        let mut guard = self.inner.lock();
        if permit.is_probe {
            guard.state = BreakerState::Open;
            guard.opened_at = Some(Instant::now());
            guard.probe_in_flight = false;
            warn!(breaker = self.name, "half-open probe failed — reopening");
            return;
        }
        Self::record(&mut guard, false, self.config.window);
        self.evaluate(&mut guard);
    }

    fn record(guard: &mut Inner, success: bool, window: usize) {
        guard.outcomes.push_back(success);
        while guard.outcomes.len() > window {
            guard.outcomes.pop_front();
        }
    }

    fn evaluate(&self, guard: &mut Inner) {
        if guard.state != BreakerState::Closed {
            return;
        }
        if guard.outcomes.len() < self.config.min_calls {
            return;
        }
        let failures = guard.outcomes.iter().filter(|ok| !**ok).count();
        let rate = failures as f64 / guard.outcomes.len() as f64;
        if rate > self.config.failure_rate_threshold {
            guard.state = BreakerState::Open;
            guard.opened_at = Some(Instant::now());
            warn!(
                breaker = self.name,
                failure_rate = rate,
                window = guard.outcomes.len(),
                "circuit breaker tripped open"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            window: 20,
            min_calls: 5,
            failure_rate_threshold: 0.5,
            cooldown: Duration::from_millis(20),
        }
    }

    #[test]
    fn trips_open_after_failure_rate_exceeded() {
        let breaker = CircuitBreaker::new("classifier", fast_config());
        for _ in 0..5 {
            let permit = breaker.try_acquire().unwrap();
            breaker.on_failure(permit);
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn half_open_after_cooldown_allows_single_probe() {
        let breaker = CircuitBreaker::new("classifier", fast_config());
        for _ in 0..5 {
            let permit = breaker.try_acquire().unwrap();
            breaker.on_failure(permit);
        }
        std::thread::sleep(Duration::from_millis(25));

        let probe = breaker.try_acquire().expect("cooldown elapsed, probe allowed");
        assert!(breaker.try_acquire().is_err(), "only one probe in flight");
        breaker.on_success(probe);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn stays_closed_below_min_calls() {
        let breaker = CircuitBreaker::new("classifier", fast_config());
        for _ in 0..4 {
            let permit = breaker.try_acquire().unwrap();
            breaker.on_failure(permit);
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
