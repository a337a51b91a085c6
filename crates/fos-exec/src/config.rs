//! Looper Configuration

/// Diagnostic settings copied into every looper a registry prepares
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LooperConfig {
    /// Warn when a single dispatch takes longer than this (ms, 0 = off)
    pub slow_dispatch_threshold_ms: u64,

    /// Warn when an item starts this late after its scheduled time (ms, 0 = off)
    pub slow_delivery_threshold_ms: u64,
}

impl LooperConfig {
    /// Thresholds a UI thread would typically use
    pub fn ui() -> Self {
        Self {
            slow_dispatch_threshold_ms: 100,
            slow_delivery_threshold_ms: 200,
        }
    }
}
