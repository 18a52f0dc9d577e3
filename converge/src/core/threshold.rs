//! Fleet failure-ratio arithmetic.

/// Failures observed for one operation over the hosts active when it started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureTally {
    pub active: usize,
    pub failed: usize,
}

impl FailureTally {
    pub fn new(active: usize) -> Self {
        Self { active, failed: 0 }
    }

    pub fn record_failure(&mut self) {
        self.failed += 1;
    }

    /// `failed / active`, or 0 when no host was active.
    pub fn ratio(&self) -> f64 {
        if self.active == 0 {
            return 0.0;
        }
        self.failed as f64 / self.active as f64
    }

    /// Abort is triggered only when the ratio is strictly above the threshold.
    pub fn exceeds(&self, threshold: f64) -> bool {
        self.ratio() > threshold
    }
}

/// Whether `unreachable` hosts out of `total` stay within `tolerance`.
pub fn unreachable_within(unreachable: usize, total: usize, tolerance: f64) -> bool {
    if unreachable == 0 {
        return true;
    }
    if total == 0 {
        return false;
    }
    unreachable as f64 / total as f64 <= tolerance
}
