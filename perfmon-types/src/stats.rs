//! Results produced by the statistical calculators and the active-thread
//! monitor.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::Microseconds;

/// Direction in which a bounded median estimate may be off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[cfg_attr(feature = "minicbor", derive(minicbor::Encode, minicbor::Decode))]
pub enum OverflowFlag {
    /// The true median is greater than or equal to the estimate.
    #[cfg_attr(feature = "minicbor", n(0))]
    High,
    /// The true median is less than or equal to the estimate.
    #[cfg_attr(feature = "minicbor", n(1))]
    Low,
}

/// Median of the durations observed in an interval, in milliseconds.
///
/// `median` is `None` when no samples were recorded; such a result
/// displays as `NA`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "minicbor", derive(minicbor::Encode, minicbor::Decode))]
pub struct MedianResult {
    #[cfg_attr(feature = "minicbor", n(0))]
    pub median: Option<f64>,

    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    #[cfg_attr(feature = "minicbor", n(1))]
    pub overflow: Option<OverflowFlag>,
}

impl MedianResult {
    /// Result for a calculator that has seen no samples.
    pub const fn not_available() -> Self {
        Self {
            median: None,
            overflow: None,
        }
    }

    pub const fn exact(median: f64) -> Self {
        Self {
            median: Some(median),
            overflow: None,
        }
    }

    pub const fn estimate(median: f64, overflow: OverflowFlag) -> Self {
        Self {
            median: Some(median),
            overflow: Some(overflow),
        }
    }

    pub fn is_available(&self) -> bool {
        self.median.is_some()
    }
}

impl fmt::Display for MedianResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.median, self.overflow) {
            (None, _) => f.write_str("NA"),
            (Some(m), None) => write!(f, "{m}"),
            (Some(m), Some(OverflowFlag::High)) => write!(f, ">= {m}"),
            (Some(m), Some(OverflowFlag::Low)) => write!(f, "<= {m}"),
        }
    }
}

/// Counts for one configured threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "minicbor", derive(minicbor::Encode, minicbor::Decode))]
pub struct ThresholdResult {
    /// Threshold in milliseconds.
    #[cfg_attr(feature = "minicbor", n(0))]
    pub threshold_ms: u64,

    /// Every duration fed to the calculator.
    #[cfg_attr(feature = "minicbor", n(1))]
    pub total_count: u64,

    /// Durations at or above the threshold.
    #[cfg_attr(feature = "minicbor", n(2))]
    pub count_over_threshold: u64,
}

impl ThresholdResult {
    /// Percentage of durations over the threshold, `0.0` when empty.
    pub fn percent_over(&self) -> f64 {
        if self.total_count == 0 {
            0.0
        } else {
            self.count_over_threshold as f64 * 100.0 / self.total_count as f64
        }
    }
}

/// Number of threads that have been inside a monitor longer than a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "minicbor", derive(minicbor::Encode, minicbor::Decode))]
pub struct ThreadsOverThreshold {
    #[cfg_attr(feature = "minicbor", n(0))]
    pub threshold_ms: u64,

    #[cfg_attr(feature = "minicbor", n(1))]
    pub count: u64,
}

/// The longest-running thread currently inside a monitor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "minicbor", derive(minicbor::Encode, minicbor::Decode))]
pub struct OldestThread {
    #[cfg_attr(feature = "minicbor", n(0))]
    pub thread_name: String,

    /// Wall-clock start of the oldest outstanding timer (ms since epoch).
    #[cfg_attr(feature = "minicbor", n(1))]
    pub started_ms: u64,

    #[cfg_attr(feature = "minicbor", n(2))]
    pub elapsed: Microseconds,
}

/// Output of the active-thread monitor for one monitor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "minicbor", derive(minicbor::Encode, minicbor::Decode))]
pub struct ActiveThreadStatus {
    #[cfg_attr(feature = "minicbor", n(0))]
    pub active_count: u64,

    #[cfg_attr(feature = "minicbor", n(1))]
    pub over_thresholds: Vec<ThreadsOverThreshold>,

    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    #[cfg_attr(feature = "minicbor", n(2))]
    pub oldest: Option<OldestThread>,
}

impl ActiveThreadStatus {
    /// Count for a given threshold, if that threshold is monitored.
    pub fn over(&self, threshold_ms: u64) -> Option<u64> {
        self.over_thresholds
            .iter()
            .find(|t| t.threshold_ms == threshold_ms)
            .map(|t| t.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn median_display() {
        assert_eq!(MedianResult::not_available().to_string(), "NA");
        assert_eq!(MedianResult::exact(12.5).to_string(), "12.5");
        assert_eq!(
            MedianResult::estimate(40.0, OverflowFlag::High).to_string(),
            ">= 40"
        );
        assert_eq!(
            MedianResult::estimate(3.0, OverflowFlag::Low).to_string(),
            "<= 3"
        );
    }

    #[test]
    fn percent_over_handles_empty_calculator() {
        let empty = ThresholdResult {
            threshold_ms: 1000,
            ..Default::default()
        };
        assert_eq!(empty.percent_over(), 0.0);

        let quarter = ThresholdResult {
            threshold_ms: 1000,
            total_count: 8,
            count_over_threshold: 2,
        };
        assert_eq!(quarter.percent_over(), 25.0);
    }

    #[test]
    fn active_thread_lookup_by_threshold() {
        let status = ActiveThreadStatus {
            active_count: 3,
            over_thresholds: alloc::vec![
                ThreadsOverThreshold {
                    threshold_ms: 60_000,
                    count: 2
                },
                ThreadsOverThreshold {
                    threshold_ms: 300_000,
                    count: 0
                },
            ],
            oldest: None,
        };
        assert_eq!(status.over(60_000), Some(2));
        assert_eq!(status.over(300_000), Some(0));
        assert_eq!(status.over(1), None);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn median_serializes_without_flag_when_exact() {
        let json = serde_json::to_string(&MedianResult::exact(5.0)).unwrap();
        assert_eq!(json, r#"{"median":5.0}"#);
    }
}
