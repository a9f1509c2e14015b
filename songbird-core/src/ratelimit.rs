//! Per-device rate limiter (§4.6): a token bucket keyed by device id, with
//! a background sweep evicting idle buckets (§5) so the map doesn't grow
//! unbounded across a long-running process with a rotating device fleet.
//!
//! Enforced entirely in-process — "a shared backing store is not required
//! for single-node deployments but the design must not preclude one" (§4.6)
//! is satisfied by keeping this behind a small trait-free struct the caller
//! owns; a distributed implementation would swap the whole type, not a
//! method on it.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::Clock;

pub const DEFAULT_REFILL_PER_MINUTE: u32 = 30;
pub const DEFAULT_BURST: u32 = 10;
pub const DEFAULT_IDLE_EVICTION_AGE: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub refill_per_minute: u32,
    pub burst: u32,
    pub idle_eviction_age: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            refill_per_minute: DEFAULT_REFILL_PER_MINUTE,
            burst: DEFAULT_BURST,
            idle_eviction_age: DEFAULT_IDLE_EVICTION_AGE,
        }
    }
}

struct Bucket {
    tokens: f64,
    last_refill: chrono::DateTime<chrono::Utc>,
}

/// Token-bucket limiter keyed by device id. `check(device_id)` is the only
/// hot-path call; `sweep_idle` is run on a timer by the caller (the same
/// shape as the reaper) to bound memory.
pub struct DeviceRateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl DeviceRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Attempt to consume one token for `device_id`. Returns `true` if the
    /// request is admitted.
    pub fn check(&self, device_id: &str, clock: &dyn Clock) -> bool {
        let now = clock.now();
        let refill_per_sec = self.config.refill_per_minute as f64 / 60.0;
        let burst = self.config.burst as f64;

        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(device_id.to_string()).or_insert_with(|| Bucket {
            tokens: burst,
            last_refill: now,
        });

        let elapsed = (now - bucket.last_refill).num_milliseconds().max(0) as f64 / 1000.0;
        bucket.tokens = (bucket.tokens + elapsed * refill_per_sec).min(burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop buckets that haven't been touched in `idle_eviction_age`, since
    /// a device that vanished shouldn't keep consuming memory forever.
    pub fn sweep_idle(&self, clock: &dyn Clock) {
        let now = clock.now();
        let max_age = chrono::Duration::from_std(self.config.idle_eviction_age)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        self.buckets
            .lock()
            .retain(|_, bucket| now - bucket.last_refill < max_age);
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_util::FixedClock;

    #[test]
    fn burst_is_exhausted_then_refills() {
        let clock = FixedClock::new(chrono::Utc::now());
        let limiter = DeviceRateLimiter::new(RateLimitConfig {
            refill_per_minute: 60,
            burst: 3,
            idle_eviction_age: Duration::from_secs(600),
        });

        assert!(limiter.check("d1", &clock));
        assert!(limiter.check("d1", &clock));
        assert!(limiter.check("d1", &clock));
        assert!(!limiter.check("d1", &clock), "burst of 3 should be exhausted");

        clock.advance(chrono::Duration::seconds(1));
        assert!(limiter.check("d1", &clock), "one token/sec refill should admit one more");
    }

    #[test]
    fn devices_are_independent() {
        let clock = FixedClock::new(chrono::Utc::now());
        let limiter = DeviceRateLimiter::new(RateLimitConfig {
            refill_per_minute: 30,
            burst: 1,
            idle_eviction_age: Duration::from_secs(600),
        });
        assert!(limiter.check("d1", &clock));
        assert!(!limiter.check("d1", &clock));
        assert!(limiter.check("d2", &clock), "a different device has its own bucket");
    }

    #[test]
    fn idle_buckets_are_evicted() {
        let clock = FixedClock::new(chrono::Utc::now());
        let limiter = DeviceRateLimiter::new(RateLimitConfig {
            refill_per_minute: 30,
            burst: 10,
            idle_eviction_age: Duration::from_secs(60),
        });
        limiter.check("d1", &clock);
        assert_eq!(limiter.len(), 1);

        clock.advance(chrono::Duration::seconds(61));
        limiter.sweep_idle(&clock);
        assert_eq!(limiter.len(), 0);
    }
}
