//! Logical clock source
//!
//! All freshness decisions (entry expiry, tag invalidation ordering) compare
//! tick values from a single clock owned by the cache instance. Ticks are
//! milliseconds since the Unix epoch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of logical time for the cache instance.
pub trait Clock: Send + Sync + 'static {
    /// Milliseconds since the Unix epoch.
    fn now_ticks(&self) -> u64;
}

/// Wall-clock backed implementation used in production.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ticks(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis().min(u64::MAX as u128) as u64)
            .unwrap_or(0)
    }
}

/// Manually driven clock for tests and deterministic embedders.
#[derive(Debug, Default)]
pub struct ManualClock {
    ticks: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ticks: u64) -> Self {
        ManualClock {
            ticks: AtomicU64::new(start_ticks),
        }
    }

    pub fn advance_ms(&self, ms: u64) {
        self.ticks.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ticks: u64) {
        self.ticks.store(ticks, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }
}
