//! Injectable clock abstraction
//!
//! Timestamps stamped onto pub/sub messages are read through a [`Clock`]
//! rather than the system time directly, so the cache window is explicit and
//! tests can run with a deterministic clock instead of timer mocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Source of unix-millisecond timestamps
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the unix epoch
    fn now_ms(&self) -> u64;
}

/// Plain system clock, no caching
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        system_now_ms()
    }
}

/// System clock that serves a cached value within a configurable window.
///
/// Message stamping can happen thousands of times per second; the cache
/// bounds syscall pressure while keeping staleness under the window.
#[derive(Debug)]
pub struct CachedClock {
    window: Duration,
    state: Mutex<CacheState>,
}

#[derive(Debug)]
struct CacheState {
    refreshed: Instant,
    value: u64,
}

impl CachedClock {
    /// Create a cached clock with the given freshness window
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new(CacheState {
                refreshed: Instant::now(),
                value: system_now_ms(),
            }),
        }
    }
}

impl Clock for CachedClock {
    fn now_ms(&self) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.refreshed.elapsed() > self.window {
            state.refreshed = Instant::now();
            state.value = system_now_ms();
        }
        state.value
    }
}

/// Manually driven clock for deterministic tests
#[derive(Debug, Default)]
pub struct ManualClock {
    value: AtomicU64,
}

impl ManualClock {
    /// Create a manual clock starting at the given timestamp
    #[must_use]
    pub fn new(start_ms: u64) -> Self {
        Self {
            value: AtomicU64::new(start_ms),
        }
    }

    /// Set the current timestamp
    pub fn set(&self, ms: u64) {
        self.value.store(ms, Ordering::SeqCst);
    }

    /// Advance the current timestamp
    pub fn advance(&self, ms: u64) {
        self.value.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }
}

fn system_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
