//! Appender writing structured `tracing` events.

use std::io;

use perfmon_types::{IntervalData, ThreadTraceData};
use tracing::info;

use super::Appender;

/// Emits every interval and trace as an `info` event on the
/// `perfmon::appender` target.
#[derive(Debug, Default)]
pub struct LogAppender;

impl LogAppender {
    pub const CLASS: &'static str = "log";

    pub fn new() -> Self {
        Self
    }
}

impl Appender for LogAppender {
    fn output_interval(&self, data: &IntervalData) -> io::Result<()> {
        let median = data.median.map(|m| m.to_string());
        let thresholds: Vec<String> = data
            .thresholds
            .iter()
            .map(|t| format!("{}ms:{:.1}%", t.threshold_ms, t.percent_over()))
            .collect();
        info!(
            target: "perfmon::appender",
            monitor = %data.monitor,
            start_ms = data.time_start_ms,
            stop_ms = data.time_stop_ms,
            hits = data.total_hits,
            completions = data.total_completions,
            avg_ms = data.average_duration_ms(),
            std_dev_ms = data.std_deviation_ms(),
            max_ms = data.max_duration.map(|m| m.duration.as_millis_f64()),
            min_ms = data.min_duration.map(|m| m.duration.as_millis_f64()),
            throughput_per_min = data.throughput_per_minute(),
            max_active = data.max_active_threads,
            median = median.as_deref(),
            thresholds = ?thresholds,
            "interval"
        );
        Ok(())
    }

    fn output_trace(&self, trace: &ThreadTraceData) -> io::Result<()> {
        let json = serde_json::to_string(trace)?;
        info!(
            target: "perfmon::appender",
            root = %trace.name,
            spans = trace.span_count(),
            duration_ms = trace.duration_ms(),
            trace = %json,
            "thread trace"
        );
        Ok(())
    }
}
