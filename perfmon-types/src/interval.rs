//! IntervalData - the aggregates of one monitor over one appender interval.

use alloc::string::String;
use alloc::vec::Vec;

use crate::{ActiveThreadStatus, MedianResult, Microseconds, ThresholdResult};

/// A duration extreme together with the wall-clock time it was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "minicbor", derive(minicbor::Encode, minicbor::Decode))]
pub struct DurationExtreme {
    #[cfg_attr(feature = "minicbor", n(0))]
    pub duration: Microseconds,

    /// Milliseconds since Unix epoch.
    #[cfg_attr(feature = "minicbor", n(1))]
    pub at_ms: u64,
}

/// SQL time spent inside timers of the interval.
///
/// Mirrors the wall-duration fields of [`IntervalData`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "minicbor", derive(minicbor::Encode, minicbor::Decode))]
pub struct SqlDurations {
    #[cfg_attr(feature = "minicbor", n(0))]
    pub total_duration: Microseconds,

    /// Sum of squared SQL durations, in ms².
    #[cfg_attr(feature = "minicbor", n(1))]
    pub sum_of_squares: f64,

    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    #[cfg_attr(feature = "minicbor", n(2))]
    pub max_duration: Option<DurationExtreme>,

    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    #[cfg_attr(feature = "minicbor", n(3))]
    pub min_duration: Option<DurationExtreme>,
}

impl SqlDurations {
    /// Fold one SQL duration into the aggregates.
    pub fn record(&mut self, duration: Microseconds, at_ms: u64) {
        self.total_duration += duration;
        let ms = duration.as_millis_f64();
        self.sum_of_squares += ms * ms;
        record_extremes(&mut self.max_duration, &mut self.min_duration, duration, at_ms);
    }
}

/// Aggregated timings of one monitor for one appender interval.
///
/// Produced once per monitor each time an appender rolls its interval.
/// The snapshot is immutable once handed to the appender.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "minicbor", derive(minicbor::Encode, minicbor::Decode))]
pub struct IntervalData {
    /// Dotted name of the owning monitor.
    #[cfg_attr(feature = "minicbor", n(0))]
    pub monitor: String,

    /// Interval start (ms since Unix epoch).
    #[cfg_attr(feature = "minicbor", n(1))]
    pub time_start_ms: u64,

    /// Interval end (ms since Unix epoch).
    #[cfg_attr(feature = "minicbor", n(2))]
    pub time_stop_ms: u64,

    #[cfg_attr(feature = "minicbor", n(3))]
    pub total_hits: u64,

    #[cfg_attr(feature = "minicbor", n(4))]
    pub total_completions: u64,

    #[cfg_attr(feature = "minicbor", n(5))]
    pub total_duration: Microseconds,

    /// Sum of squared durations, in ms².
    #[cfg_attr(feature = "minicbor", n(6))]
    pub sum_of_squares: f64,

    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    #[cfg_attr(feature = "minicbor", n(7))]
    pub max_duration: Option<DurationExtreme>,

    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    #[cfg_attr(feature = "minicbor", n(8))]
    pub min_duration: Option<DurationExtreme>,

    /// Highest number of concurrently active threads seen in the interval.
    #[cfg_attr(feature = "minicbor", n(9))]
    pub max_active_threads: u64,

    #[cfg_attr(feature = "minicbor", n(10))]
    pub max_active_threads_at_ms: u64,

    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    #[cfg_attr(feature = "minicbor", n(11))]
    pub sql: Option<SqlDurations>,

    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    #[cfg_attr(feature = "minicbor", n(12))]
    pub median: Option<MedianResult>,

    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Vec::is_empty"))]
    #[cfg_attr(feature = "minicbor", n(13))]
    pub thresholds: Vec<ThresholdResult>,

    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    #[cfg_attr(feature = "minicbor", n(14))]
    pub active_threads: Option<ActiveThreadStatus>,
}

impl IntervalData {
    /// Create a builder for interval data.
    pub fn builder(monitor: impl Into<String>) -> IntervalDataBuilder {
        IntervalDataBuilder::new(monitor)
    }

    /// Length of the interval in milliseconds.
    pub fn interval_ms(&self) -> u64 {
        self.time_stop_ms.saturating_sub(self.time_start_ms)
    }

    /// Mean duration of completed timers, `0.0` without completions.
    pub fn average_duration_ms(&self) -> f64 {
        if self.total_completions == 0 {
            0.0
        } else {
            self.total_duration.as_millis_f64() / self.total_completions as f64
        }
    }

    /// Population standard deviation of completed durations in ms.
    pub fn std_deviation_ms(&self) -> f64 {
        std_deviation(
            self.total_completions,
            self.total_duration.as_millis_f64(),
            self.sum_of_squares,
        )
    }

    /// Completions per minute over the interval.
    pub fn throughput_per_minute(&self) -> f64 {
        let interval = self.interval_ms();
        if interval == 0 {
            0.0
        } else {
            self.total_completions as f64 * 60_000.0 / interval as f64
        }
    }

    /// Result for one configured threshold.
    pub fn threshold(&self, threshold_ms: u64) -> Option<&ThresholdResult> {
        self.thresholds.iter().find(|t| t.threshold_ms == threshold_ms)
    }

    /// Fold one completed duration into the aggregates.
    pub fn record_completion(&mut self, duration: Microseconds, at_ms: u64) {
        self.total_completions += 1;
        self.total_duration += duration;
        let ms = duration.as_millis_f64();
        self.sum_of_squares += ms * ms;
        record_extremes(&mut self.max_duration, &mut self.min_duration, duration, at_ms);
    }
}

fn record_extremes(
    max: &mut Option<DurationExtreme>,
    min: &mut Option<DurationExtreme>,
    duration: Microseconds,
    at_ms: u64,
) {
    let sample = DurationExtreme { duration, at_ms };
    if max.map_or(true, |m| duration > m.duration) {
        *max = Some(sample);
    }
    if min.map_or(true, |m| duration < m.duration) {
        *min = Some(sample);
    }
}

fn std_deviation(count: u64, total: f64, sum_of_squares: f64) -> f64 {
    if count < 2 {
        return 0.0;
    }
    let n = count as f64;
    let mean = total / n;
    let variance = (sum_of_squares / n) - (mean * mean);
    if variance <= 0.0 {
        0.0
    } else {
        sqrt(variance)
    }
}

#[cfg(feature = "std")]
fn sqrt(v: f64) -> f64 {
    v.sqrt()
}

// Newton iteration for no_std builds.
#[cfg(not(feature = "std"))]
fn sqrt(v: f64) -> f64 {
    let mut x = if v > 1.0 { v / 2.0 } else { 1.0 };
    for _ in 0..64 {
        x = 0.5 * (x + v / x);
    }
    x
}

/// Builder for `IntervalData`.
#[derive(Debug, Default)]
pub struct IntervalDataBuilder {
    data: IntervalData,
}

impl IntervalDataBuilder {
    pub fn new(monitor: impl Into<String>) -> Self {
        Self {
            data: IntervalData {
                monitor: monitor.into(),
                ..Default::default()
            },
        }
    }

    /// Set the interval bounds (ms since Unix epoch).
    pub fn window(mut self, start_ms: u64, stop_ms: u64) -> Self {
        self.data.time_start_ms = start_ms;
        self.data.time_stop_ms = stop_ms;
        self
    }

    pub fn hits(mut self, hits: u64) -> Self {
        self.data.total_hits = hits;
        self
    }

    pub fn completions(mut self, completions: u64) -> Self {
        self.data.total_completions = completions;
        self
    }

    pub fn total_duration(mut self, duration: Microseconds) -> Self {
        self.data.total_duration = duration;
        self
    }

    pub fn sum_of_squares(mut self, sum: f64) -> Self {
        self.data.sum_of_squares = sum;
        self
    }

    pub fn max_active_threads(mut self, count: u64, at_ms: u64) -> Self {
        self.data.max_active_threads = count;
        self.data.max_active_threads_at_ms = at_ms;
        self
    }

    pub fn median(mut self, median: MedianResult) -> Self {
        self.data.median = Some(median);
        self
    }

    pub fn threshold(mut self, result: ThresholdResult) -> Self {
        self.data.thresholds.push(result);
        self
    }

    pub fn sql(mut self, sql: SqlDurations) -> Self {
        self.data.sql = Some(sql);
        self
    }

    pub fn active_threads(mut self, status: ActiveThreadStatus) -> Self {
        self.data.active_threads = Some(status);
        self
    }

    pub fn build(self) -> IntervalData {
        self.data
    }
}
