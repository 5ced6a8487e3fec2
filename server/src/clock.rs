//! Injected clock for the scheduler components
//!
//! Every time comparison in the scheduler (queue expiration, dead-bot
//! detection, dedup windows, cache TTLs, lease expirations) goes through
//! this trait so tests can drive time deterministically.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of the current time in Unix milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;

    fn now_secs(&self) -> i64 {
        self.now_ms() / 1000
    }
}

/// Production clock backed by the system time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

/// Returns the production clock as a shared handle.
pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// Manually driven clock for tests.
#[cfg(test)]
pub struct FakeClock {
    ms: std::sync::atomic::AtomicI64,
}

#[cfg(test)]
impl FakeClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            ms: std::sync::atomic::AtomicI64::new(start_ms),
        }
    }

    pub fn advance_ms(&self, delta: i64) {
        self.ms
            .fetch_add(delta, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn advance_secs(&self, delta: i64) {
        self.advance_ms(delta * 1000);
    }
}

#[cfg(test)]
impl Clock for FakeClock {
    fn now_ms(&self) -> i64 {
        self.ms.load(std::sync::atomic::Ordering::SeqCst)
    }
}
