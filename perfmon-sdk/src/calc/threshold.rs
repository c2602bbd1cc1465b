//! Counters of durations at or over a set of thresholds.

use std::time::Duration;

use perfmon_types::ThresholdResult;

use crate::duration::parse_duration_list;
use crate::error::Result;

/// Counts how many durations reached each configured threshold.
///
/// Thresholds are kept sorted ascending. A duration counts against every
/// threshold that is less than or equal to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThresholdCalculator {
    thresholds: Vec<Duration>,
    total: u64,
    over: Vec<u64>,
}

impl ThresholdCalculator {
    pub fn new(thresholds: impl IntoIterator<Item = Duration>) -> Self {
        let mut thresholds: Vec<Duration> = thresholds.into_iter().collect();
        thresholds.sort();
        thresholds.dedup();
        let over = vec![0; thresholds.len()];
        Self {
            thresholds,
            total: 0,
            over,
        }
    }

    /// Build from a list such as `"1 second, 2 seconds"`.
    pub fn parse(s: &str) -> Result<Self> {
        Ok(Self::new(parse_duration_list(s)?))
    }

    /// Configured thresholds in milliseconds, ascending.
    pub fn thresholds_ms(&self) -> Vec<u64> {
        self.thresholds.iter().map(|t| t.as_millis() as u64).collect()
    }

    pub fn total_count(&self) -> u64 {
        self.total
    }

    pub fn put_value(&mut self, duration: Duration) {
        self.total += 1;
        // Sorted, so stop at the first threshold above the duration
        for (threshold, count) in self.thresholds.iter().zip(self.over.iter_mut()) {
            if *threshold > duration {
                break;
            }
            *count += 1;
        }
    }

    /// Counts for one threshold, `None` if it was not configured.
    pub fn get_result(&self, threshold_ms: u64) -> Option<ThresholdResult> {
        self.thresholds
            .iter()
            .position(|t| t.as_millis() as u64 == threshold_ms)
            .map(|i| self.result_at(i))
    }

    /// Counts for every threshold, ascending.
    pub fn results(&self) -> Vec<ThresholdResult> {
        (0..self.thresholds.len()).map(|i| self.result_at(i)).collect()
    }

    fn result_at(&self, i: usize) -> ThresholdResult {
        ThresholdResult {
            threshold_ms: self.thresholds[i].as_millis() as u64,
            total_count: self.total,
            count_over_threshold: self.over[i],
        }
    }

    /// Whether `other` has the same thresholds, ignoring counts.
    pub fn same_definition(&self, other: &ThresholdCalculator) -> bool {
        self.thresholds == other.thresholds
    }

    /// A copy with the same thresholds and zeroed counters.
    pub fn fresh(&self) -> Self {
        Self::new(self.thresholds.iter().copied())
    }

    pub fn reset(&mut self) {
        self.total = 0;
        self.over.iter_mut().for_each(|c| *c = 0);
    }
}
