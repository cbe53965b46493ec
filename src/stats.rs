// SPDX-License-Identifier: MPL-2.0

//! Relaxed-atomic I/O counters backing the `status`/`stats` admin
//! commands. Per the concurrency design, readers may observe a
//! momentarily inconsistent tuple across fields — acceptable for a
//! diagnostics surface that is never used to make correctness
//! decisions.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Stats {
    reads: AtomicU64,
    writes: AtomicU64,
    errors: AtomicU64,
    remapped_ios: AtomicU64,
    auto_remaps: AtomicU64,
}

/// A point-in-time copy of the counters, for the admin surface to
/// format without holding anything live.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub errors: u64,
    pub remapped_ios: u64,
    pub auto_remaps: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remapped_io(&self) {
        self.remapped_ios.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auto_remap(&self) {
        self.auto_remaps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.reads.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.remapped_ios.store(0, Ordering::Relaxed);
        self.auto_remaps.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            remapped_ios: self.remapped_ios.load(Ordering::Relaxed),
            auto_remaps: self.auto_remaps.load(Ordering::Relaxed),
        }
    }
}

/// `100 * (1 - used_spare_fraction)`, saturating at 0. A target with no
/// spare capacity configured at all (`capacity == 0`) reports 100: it
/// has nothing to exhaust, so it isn't degraded by this metric.
pub fn health_score(spare_free: usize, spare_capacity: usize) -> u8 {
    if spare_capacity == 0 {
        return 100;
    }
    let used_fraction = 1.0 - (spare_free as f64 / spare_capacity as f64);
    let score = 100.0 * (1.0 - used_fraction);
    score.clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_score_full_then_half_then_empty() {
        assert_eq!(health_score(100, 100), 100);
        assert_eq!(health_score(50, 100), 50);
        assert_eq!(health_score(0, 100), 0);
    }

    #[test]
    fn health_score_zero_capacity_is_100() {
        assert_eq!(health_score(0, 0), 100);
    }

    #[test]
    fn counters_round_trip_through_clear() {
        let stats = Stats::new();
        stats.record_read();
        stats.record_write();
        stats.record_error();
        let snap = stats.snapshot();
        assert_eq!(snap, StatsSnapshot { reads: 1, writes: 1, errors: 1, remapped_ios: 0, auto_remaps: 0 });
        stats.clear();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}
