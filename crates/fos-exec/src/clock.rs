//! Clocks
//!
//! Work queues schedule against a millisecond clock. The default clock is
//! monotonic; tests pin time with [`ManualClock`].

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Millisecond time source for a work queue
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time in milliseconds
    fn now_millis(&self) -> u64;
}

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Process uptime clock, counted from its first reading
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl MonotonicClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        let epoch = EPOCH.get_or_init(Instant::now);
        epoch.elapsed().as_millis() as u64
    }
}

/// Uptime in milliseconds on the process-wide monotonic clock
pub fn uptime_millis() -> u64 {
    MonotonicClock.now_millis()
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Set the current time
    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    /// Move time forward
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
