//! Session-level progress aggregation.
//!
//! The flasher reports bytes written per image. These are folded into one
//! percentage for the whole run, weighted by each image's share of the plan's
//! total bytes. Writes occupy the first 90%; the rest is reserved for the
//! post-write reset steps.

use crate::plan::FirmwarePlan;

/// Portion of the visible range covered by image writes.
pub const WRITE_SPAN: f64 = 90.0;

/// Percentage shown while post-write reset and verification run.
pub const VERIFY_PERCENT: f64 = 95.0;

/// Percentage shown once the run has fully completed.
pub const COMPLETE_PERCENT: f64 = 100.0;

/// Progress snapshot for one flashing run.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionProgress {
    /// What is happening right now.
    pub label: String,
    /// Overall completion in `[0, 100]`.
    pub percent: f64,
}

impl SessionProgress {
    /// Create a snapshot.
    pub fn new(label: impl Into<String>, percent: f64) -> Self {
        Self {
            label: label.into(),
            percent: percent.clamp(0.0, COMPLETE_PERCENT),
        }
    }

    /// Percentage rounded for display.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn rounded(&self) -> u64 {
        self.percent.round() as u64
    }
}

/// Percent reached after `written` of `total` bytes of one entry.
///
/// `share` is the entry's fraction of the plan's total bytes and `base` the
/// percent reached before the entry started. A zero `total` counts as done.
#[allow(clippy::cast_precision_loss)]
pub fn weighted_percent(written: usize, total: usize, share: f64, base: f64) -> f64 {
    let fraction = if total == 0 {
        1.0
    } else {
        (written.min(total) as f64) / (total as f64)
    };
    base + fraction * share * WRITE_SPAN
}

/// Folds per-entry byte counts into a single non-decreasing percentage.
#[derive(Debug, Clone)]
pub struct ProgressAggregator {
    sizes: Vec<usize>,
    total: usize,
    last: f64,
}

impl ProgressAggregator {
    /// Create an aggregator for entries of the given sizes, in write order.
    pub fn new(sizes: Vec<usize>) -> Self {
        let total = sizes.iter().sum();
        Self {
            sizes,
            total,
            last: 0.0,
        }
    }

    /// Create an aggregator for a plan.
    pub fn for_plan(plan: &FirmwarePlan) -> Self {
        Self::new(plan.iter().map(|e| e.size).collect())
    }

    /// Total bytes across all entries.
    pub fn total_bytes(&self) -> usize {
        self.total
    }

    /// Fraction of the plan's bytes belonging to entry `index`.
    #[allow(clippy::cast_precision_loss)]
    pub fn share(&self, index: usize) -> f64 {
        match self.sizes.get(index) {
            Some(&size) if self.total > 0 => size as f64 / self.total as f64,
            _ => 0.0,
        }
    }

    /// Percent reached before entry `index` starts.
    #[allow(clippy::cast_precision_loss)]
    pub fn base(&self, index: usize) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let before: usize = self.sizes.iter().take(index).sum();
        before as f64 / self.total as f64 * WRITE_SPAN
    }

    /// Record bytes written for entry `index` and return the overall percent.
    pub fn report(&mut self, index: usize, written: usize, total: usize) -> f64 {
        let percent = weighted_percent(written, total, self.share(index), self.base(index));
        self.advance(percent)
    }

    /// Mark the start of entry `index`.
    pub fn begin_entry(&mut self, index: usize) -> f64 {
        let base = self.base(index);
        self.advance(base)
    }

    /// All writes are done; reset steps are running.
    pub fn finish_writes(&mut self) -> f64 {
        self.advance(VERIFY_PERCENT)
    }

    /// The run is complete.
    pub fn complete(&mut self) -> f64 {
        self.advance(COMPLETE_PERCENT)
    }

    /// Last percent handed out.
    pub fn current(&self) -> f64 {
        self.last
    }

    fn advance(&mut self, percent: f64) -> f64 {
        self.last = self.last.max(percent.min(COMPLETE_PERCENT));
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_first_entry_complete_is_22_5() {
        let mut agg = ProgressAggregator::new(vec![100, 300]);
        assert_eq!(agg.total_bytes(), 400);
        assert!(approx(agg.report(0, 100, 100), 22.5));
        assert!(approx(agg.base(1), 22.5));
        assert!(approx(agg.report(1, 150, 300), 22.5 + 0.5 * 0.75 * 90.0));
        assert!(approx(agg.report(1, 300, 300), 90.0));
    }

    #[test]
    fn test_weighted_percent_formula() {
        assert!(approx(weighted_percent(50, 100, 0.5, 10.0), 10.0 + 0.5 * 0.5 * 90.0));
        assert!(approx(weighted_percent(0, 0, 0.25, 0.0), 22.5));
        assert!(approx(weighted_percent(200, 100, 1.0, 0.0), 90.0));
    }

    #[test]
    fn test_non_decreasing() {
        let mut agg = ProgressAggregator::new(vec![10, 20, 30]);
        let mut last = 0.0;
        let steps = [
            (0, 0, 10),
            (0, 5, 10),
            (0, 3, 10),
            (0, 10, 10),
            (1, 0, 20),
            (1, 20, 20),
            (2, 15, 30),
            (2, 30, 30),
        ];
        for (index, written, total) in steps {
            let p = agg.report(index, written, total);
            assert!(p >= last, "{p} < {last}");
            last = p;
        }
        assert!(approx(last, 90.0));
        assert!(agg.finish_writes() >= last);
        assert!(approx(agg.complete(), 100.0));
        assert!(approx(agg.begin_entry(0), 100.0));
    }

    #[test]
    fn test_stays_below_complete_until_complete() {
        let mut agg = ProgressAggregator::new(vec![1]);
        agg.report(0, 1, 1);
        assert!(agg.finish_writes() < COMPLETE_PERCENT);
        assert!(approx(agg.current(), VERIFY_PERCENT));
        assert!(approx(agg.complete(), COMPLETE_PERCENT));
    }

    #[test]
    fn test_empty_aggregator() {
        let mut agg = ProgressAggregator::new(Vec::new());
        assert!(approx(agg.share(0), 0.0));
        assert!(approx(agg.report(0, 1, 1), 0.0));
    }

    #[test]
    fn test_session_progress_clamped_and_rounded() {
        assert!(approx(SessionProgress::new("x", 120.0).percent, 100.0));
        assert!(approx(SessionProgress::new("x", -3.0).percent, 0.0));
        assert_eq!(SessionProgress::new("x", 22.5).rounded(), 23);
    }
}
