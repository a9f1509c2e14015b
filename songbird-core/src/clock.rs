//! Injected time + identifier minting (C10).
//!
//! Mirrors the teacher's "inject everything, tests pin it" philosophy —
//! the same reason `ModelHandle` and `AudioCapture` are constructed behind a
//! seam rather than called directly. Handlers and the pipeline take
//! `Arc<dyn Clock>` / `Arc<dyn IdGen>` instead of calling `Utc::now()` or
//! `Uuid::new_v4()` inline, so tests can pin both.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Monotonic-enough UTC wall clock, injected so the reaper and heartbeat
/// monotonicity checks can be pinned in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Collision-resistant identifier minting, injected for the same reason.
pub trait IdGen: Send + Sync {
    fn new_id(&self) -> String;
}

/// Real wall-clock `Clock` backed by `chrono::Utc::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Real `IdGen` backed by UUID v4.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdGen;

impl IdGen for UuidIdGen {
    fn new_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod test_util {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// A `Clock` that only advances when told to, for deterministic tests
    /// of reaper/heartbeat monotonicity.
    pub struct FixedClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl FixedClock {
        pub fn new(start: DateTime<Utc>) -> Self {
            Self {
                now: Mutex::new(start),
            }
        }

        pub fn advance(&self, delta: chrono::Duration) {
            let mut guard = self.now.lock();
            *guard += delta;
        }

        pub fn set(&self, at: DateTime<Utc>) {
            *self.now.lock() = at;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock()
        }
    }

    /// Deterministic, collision-free-in-practice id generator for tests:
    /// a monotonically increasing counter with a fixed prefix.
    pub struct SequentialIdGen {
        prefix: String,
        counter: AtomicU64,
    }

    impl SequentialIdGen {
        pub fn new(prefix: impl Into<String>) -> Self {
            Self {
                prefix: prefix.into(),
                counter: AtomicU64::new(0),
            }
        }
    }

    impl IdGen for SequentialIdGen {
        fn new_id(&self) -> String {
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            format!("{}-{n}", self.prefix)
        }
    }
}
