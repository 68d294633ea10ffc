//! Per-sandbox clock backing the system clock interceptors.
//!
//! Supports two modes:
//! - **Frozen** (default): time only moves when the test calls [`SandboxClock::advance`].
//! - **Advancing**: every read moves time forward by a fixed tick.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub struct SandboxClock {
    /// Wall-clock time at sandbox uptime zero, in milliseconds since the epoch.
    base_ms: u64,
    /// Advance per read in milliseconds. Zero in frozen mode.
    tick_ms: u64,
    /// Milliseconds since sandbox start.
    uptime_ms: AtomicU64,
    accesses: AtomicU64,
}

impl Default for SandboxClock {
    fn default() -> Self {
        Self::frozen(Self::DEFAULT_BASE_MS)
    }
}

impl SandboxClock {
    /// 2024-01-01 00:00:00 UTC
    pub const DEFAULT_BASE_MS: u64 = 1704067200000;
    pub const DEFAULT_UPTIME_MS: u64 = 100;

    pub fn frozen(base_ms: u64) -> Self {
        Self::advancing(base_ms, 0)
    }

    pub fn advancing(base_ms: u64, tick_ms: u64) -> Self {
        Self {
            base_ms,
            tick_ms,
            uptime_ms: AtomicU64::new(Self::DEFAULT_UPTIME_MS),
            accesses: AtomicU64::new(0),
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.tick_ms == 0
    }

    pub fn advance(&self, by: Duration) {
        self.uptime_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Milliseconds since sandbox start. Advancing clocks tick on every read.
    pub fn uptime_millis(&self) -> u64 {
        self.accesses.fetch_add(1, Ordering::SeqCst);
        if self.tick_ms == 0 {
            self.uptime_ms.load(Ordering::SeqCst)
        } else {
            self.uptime_ms.fetch_add(self.tick_ms, Ordering::SeqCst)
        }
    }

    pub fn current_time_millis(&self) -> u64 {
        self.base_ms + self.uptime_millis()
    }

    pub fn nano_time(&self) -> u64 {
        self.uptime_millis().saturating_mul(1_000_000)
    }

    /// Current uptime without ticking.
    pub fn peek_uptime_millis(&self) -> u64 {
        self.uptime_ms.load(Ordering::SeqCst)
    }

    pub fn access_count(&self) -> u64 {
        self.accesses.load(Ordering::SeqCst)
    }

    /// Back to the initial uptime. Used by reused sandboxes between tests.
    pub fn reset(&self) {
        self.uptime_ms
            .store(Self::DEFAULT_UPTIME_MS, Ordering::SeqCst);
        self.accesses.store(0, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for SandboxClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxClock")
            .field("base_ms", &self.base_ms)
            .field("tick_ms", &self.tick_ms)
            .field("uptime_ms", &self.peek_uptime_millis())
            .finish()
    }
}
