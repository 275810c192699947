use std::time::Duration;

/// Parameters an overlay is configured with; handed to every node by the
/// registry's `MessagingNodesList`.
#[derive(Debug, Clone, Copy)]
pub struct OverlayConfig {
    pub pool_size: usize,
    pub overlay_size: usize,
}

impl OverlayConfig {
    pub fn new(pool_size: usize, overlay_size: usize) -> Self {
        assert!(
            (2..=16).contains(&pool_size),
            "poolSize must be in [2, 16], got {pool_size}"
        );
        assert!(overlay_size >= 2, "overlaySize must be at least 2");
        Self {
            pool_size,
            overlay_size,
        }
    }
}

/// Tuning knobs for the balancing protocol, kept as a `Config` so tests can
/// shrink the balancing tick without touching protocol logic.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolTuning {
    pub batch_size: usize,
    pub balance_threshold: f64,
    pub balancing_tick: Duration,
    pub channel_buffer_size: usize,
}

impl Default for ProtocolTuning {
    fn default() -> Self {
        Self {
            batch_size: 10,
            balance_threshold: 0.70,
            balancing_tick: Duration::from_millis(10),
            channel_buffer_size: 256,
        }
    }
}
