use std::sync::atomic::{AtomicU64, Ordering};

/// Per-round counters. Each is its own `AtomicU64`: the four never need to be
/// read back as a consistent snapshot mid-round (only at `TrafficSummary`
/// time, after the round has already closed out), so independent `Relaxed`
/// increments are enough.
#[derive(Debug, Default)]
pub struct Statistics {
    generated: AtomicU64,
    pushed: AtomicU64,
    pulled: AtomicU64,
    completed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub generated: u64,
    pub pushed: u64,
    pub pulled: u64,
    pub completed: u64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_generated(&self, n: u64) {
        self.generated.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_pushed(&self, n: u64) {
        self.pushed.fetch_add(n, Ordering::Relaxed);
    }

    /// Backs out a push that was counted optimistically but then rejected
    /// by the receiving neighbor.
    pub fn sub_pushed(&self, n: u64) {
        self.pushed.fetch_sub(n, Ordering::Relaxed);
    }

    pub fn add_pulled(&self, n: u64) {
        self.pulled.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_completed(&self, n: u64) {
        self.completed.fetch_add(n, Ordering::Relaxed);
    }

    /// Reads the four counters and resets them to zero, as `TrafficSummary`
    /// handling requires ("send ... then reset").
    pub fn take_snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            generated: self.generated.swap(0, Ordering::Relaxed),
            pushed: self.pushed.swap(0, Ordering::Relaxed),
            pulled: self.pulled.swap(0, Ordering::Relaxed),
            completed: self.completed.swap(0, Ordering::Relaxed),
        }
    }
}
