//! Appenders: periodic output sinks for interval data and thread traces.
//!
//! An [`Appender`] is the sink itself. The engine wraps every distinct
//! [`AppenderId`] in one handle that owns the set of monitors feeding it and
//! the scheduled task rolling their intervals.

mod channel;
mod file;
mod log;

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use perfmon_types::{IntervalData, ThreadTraceData};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::calc::{MedianCalculator, ThresholdCalculator, DEFAULT_FACTOR, DEFAULT_MAX_ELEMENTS};
use crate::error::{PerfMonError, Result};
use crate::monitor::Monitor;

pub use self::channel::{AppenderOutput, ChannelAppender};
pub use self::file::JsonFileAppender;
pub use self::log::LogAppender;

/// Attribute holding a threshold list for an appender-level calculator.
pub const THRESHOLD_ATTRIBUTE: &str = "threshold";
/// Attribute enabling an appender-level median: `true` or a max element count.
pub const MEDIAN_ATTRIBUTE: &str = "median";
/// Attribute setting the appender-level median bucket width.
pub const MEDIAN_FACTOR_ATTRIBUTE: &str = "median.factor";

/// An output sink.
///
/// Output methods run on the scheduler's blocking pool, never on an
/// instrumented thread, so they may do I/O.
pub trait Appender: Send + Sync + fmt::Debug {
    /// Receive the interval data of one monitor.
    fn output_interval(&self, data: &IntervalData) -> io::Result<()>;

    /// Receive a completed thread trace.
    fn output_trace(&self, _trace: &ThreadTraceData) -> io::Result<()> {
        Ok(())
    }

    /// Called once when the appender is removed from the configuration or
    /// the registry is dropped.
    fn de_init(&self) {}
}

/// Builds an appender for an identity.
pub type AppenderFactory = Arc<dyn Fn(&AppenderId) -> Result<Arc<dyn Appender>> + Send + Sync>;

/// Identity of an appender: class, interval and attributes. Attributes are
/// kept sorted, so their order in the configuration does not matter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppenderId {
    pub class: String,
    pub interval_ms: u64,
    pub attributes: BTreeMap<String, String>,
}

impl AppenderId {
    pub fn new(
        class: impl Into<String>,
        interval: Duration,
        attributes: BTreeMap<String, String>,
    ) -> Self {
        Self {
            class: class.into(),
            interval_ms: interval.as_millis() as u64,
            attributes,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Look up a required attribute.
    pub fn require(&self, name: &str) -> Result<&str> {
        self.attribute(name)
            .ok_or_else(|| PerfMonError::InvalidAppenderAttribute {
                appender: self.to_string(),
                attribute: name.to_string(),
                reason: "missing".to_string(),
            })
    }

    fn invalid(&self, attribute: &str, reason: impl fmt::Display) -> PerfMonError {
        PerfMonError::InvalidAppenderAttribute {
            appender: self.to_string(),
            attribute: attribute.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for AppenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}ms", self.class, self.interval_ms)?;
        if !self.attributes.is_empty() {
            let attrs: Vec<String> = self
                .attributes
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            write!(f, "[{}]", attrs.join(","))?;
        }
        Ok(())
    }
}

static NEXT_APPENDER_KEY: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
struct Tasks {
    monitors: Vec<Arc<Monitor>>,
    stopped: bool,
}

#[derive(Debug, Default)]
struct Schedule {
    stop_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

/// The live instance of one appender identity.
pub(crate) struct AppenderHandle {
    key: u64,
    id: AppenderId,
    sink: Arc<dyn Appender>,
    threshold: Option<ThresholdCalculator>,
    median: Option<MedianCalculator>,
    tasks: Mutex<Tasks>,
    schedule: Mutex<Schedule>,
    /// Read for every sink call, written once by `shutdown`. `false` after
    /// the sink has been de-initialized.
    live: RwLock<bool>,
}

impl fmt::Debug for AppenderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppenderHandle")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("sink", &self.sink)
            .finish_non_exhaustive()
    }
}

impl AppenderHandle {
    /// Wrap a sink, reading appender-level calculators from the identity's
    /// attributes.
    pub fn new(id: AppenderId, sink: Arc<dyn Appender>) -> Result<Self> {
        let attributes = &id.attributes;
        if id.interval_ms == 0 {
            return Err(id.invalid("interval", "must be at least 1 ms"));
        }

        let threshold = attributes
            .get(THRESHOLD_ATTRIBUTE)
            .map(|s| ThresholdCalculator::parse(s))
            .transpose()
            .map_err(|e| id.invalid(THRESHOLD_ATTRIBUTE, e))?;

        let median = match attributes.get(MEDIAN_ATTRIBUTE).map(|s| s.trim()) {
            None | Some("false") => None,
            Some(value) => {
                let max_elements = match value {
                    "true" => DEFAULT_MAX_ELEMENTS,
                    n => n
                        .parse::<usize>()
                        .map_err(|e| id.invalid(MEDIAN_ATTRIBUTE, e))?,
                };
                let factor = match attributes
                    .get(MEDIAN_FACTOR_ATTRIBUTE)
                    .or_else(|| attributes.get("median_factor"))
                {
                    Some(f) => f
                        .trim()
                        .parse::<f64>()
                        .map_err(|e| id.invalid(MEDIAN_FACTOR_ATTRIBUTE, e))?,
                    None => DEFAULT_FACTOR,
                };
                Some(MedianCalculator::new(max_elements, factor))
            }
        };

        Ok(Self {
            key: NEXT_APPENDER_KEY.fetch_add(1, Ordering::Relaxed),
            id,
            sink,
            threshold,
            median,
            tasks: Mutex::new(Tasks::default()),
            schedule: Mutex::new(Schedule::default()),
            live: RwLock::new(true),
        })
    }

    /// Process-unique key; monitors index their accumulators by it.
    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn id(&self) -> &AppenderId {
        &self.id
    }

    pub fn interval(&self) -> Duration {
        self.id.interval()
    }

    pub fn threshold(&self) -> Option<&ThresholdCalculator> {
        self.threshold.as_ref()
    }

    pub fn median(&self) -> Option<&MedianCalculator> {
        self.median.as_ref()
    }

    /// Replace the monitors feeding this appender.
    pub fn set_tasks(&self, monitors: Vec<Arc<Monitor>>) {
        let mut tasks = self.tasks.lock();
        if !tasks.stopped {
            tasks.monitors = monitors;
        }
    }

    /// Add one monitor, e.g. a dynamically created child.
    pub fn attach(&self, monitor: Arc<Monitor>) {
        let mut tasks = self.tasks.lock();
        if !tasks.stopped && !tasks.monitors.iter().any(|m| Arc::ptr_eq(m, &monitor)) {
            tasks.monitors.push(monitor);
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().monitors.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.tasks.lock().stopped
    }

    /// Close the current interval of every monitor feeding this appender.
    /// Produces nothing once the appender has been shut down.
    pub fn roll(&self, now_ms: u64) -> Vec<IntervalData> {
        let tasks = self.tasks.lock();
        if tasks.stopped {
            return Vec::new();
        }
        tasks
            .monitors
            .iter()
            .filter_map(|m| m.roll_interval(self.key, now_ms))
            .collect()
    }

    /// Hand a batch to the sink. Failures are logged, not propagated.
    /// Nothing reaches the sink once it has been de-initialized.
    pub fn output(&self, batch: &[IntervalData]) {
        let live = self.live.read();
        if !*live {
            return;
        }
        for data in batch {
            if let Err(e) = self.sink.output_interval(data) {
                error!(appender = %self.id, monitor = %data.monitor, error = %e, "Appender failed to output interval data");
            }
        }
    }

    pub fn output_trace(&self, trace: &ThreadTraceData) {
        let live = self.live.read();
        if !*live {
            return;
        }
        if let Err(e) = self.sink.output_trace(trace) {
            error!(appender = %self.id, trace = %trace.name, error = %e, "Appender failed to output thread trace");
        }
    }

    /// Remember the scheduled task so shutdown can stop it.
    pub fn set_schedule(&self, stop_tx: watch::Sender<bool>, task: JoinHandle<()>) {
        let mut schedule = self.schedule.lock();
        schedule.stop_tx = Some(stop_tx);
        schedule.task = Some(task);
    }

    /// Stop producing snapshots, cancel the scheduled task and de-initialize
    /// the sink. Waits for sink calls already in progress; no output reaches
    /// the sink after this returns.
    pub fn shutdown(&self) {
        {
            let mut tasks = self.tasks.lock();
            if tasks.stopped {
                return;
            }
            tasks.stopped = true;
            tasks.monitors.clear();
        }

        let (stop_tx, task) = {
            let mut schedule = self.schedule.lock();
            (schedule.stop_tx.take(), schedule.task.take())
        };
        if let Some(tx) = stop_tx {
            let _ = tx.send(true);
        }
        if let Some(task) = task {
            task.abort();
        }

        let mut live = self.live.write();
        *live = false;
        self.sink.de_init();
        drop(live);
        debug!(appender = %self.id, "Appender de-initialized");
    }
}

/// The factories registered on every new registry.
pub(crate) fn builtin_factories() -> Vec<(&'static str, AppenderFactory)> {
    vec![
        (
            LogAppender::CLASS,
            Arc::new(|_: &AppenderId| Ok(Arc::new(LogAppender::new()) as Arc<dyn Appender>)),
        ),
        (
            JsonFileAppender::CLASS,
            Arc::new(|id: &AppenderId| {
                let appender = JsonFileAppender::from_id(id)?;
                Ok(Arc::new(appender) as Arc<dyn Appender>)
            }),
        ),
    ]
}


#[cfg(test)]
mod tests {
    use super::testing::NullAppender;
    use super::*;

    fn id_with(attrs: &[(&str, &str)]) -> AppenderId {
        AppenderId::new(
            "null",
            Duration::from_secs(1),
            attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn identity_ignores_attribute_order() {
        let a = id_with(&[("x", "1"), ("y", "2")]);
        let b = id_with(&[("y", "2"), ("x", "1")]);
        assert_eq!(a, b);
        assert_ne!(a, id_with(&[("x", "1")]));
        assert_ne!(
            a,
            AppenderId::new("null", Duration::from_secs(2), a.attributes.clone())
        );
        assert_eq!(a.to_string(), "null@1000ms[x=1,y=2]");
    }

    #[test]
    fn calculators_from_attributes() {
        let id = id_with(&[
            ("threshold", "1 second, 250"),
            ("median", "50"),
            ("median.factor", "0.5"),
        ]);
        let handle = AppenderHandle::new(id, Arc::new(NullAppender)).unwrap();
        assert_eq!(handle.threshold().unwrap().thresholds_ms(), vec![250, 1000]);
        let median = handle.median().unwrap();
        assert_eq!(median.max_elements(), 50);
        assert_eq!(median.factor(), 0.5);
    }

    #[test]
    fn invalid_attributes_are_rejected() {
        let err = AppenderHandle::new(id_with(&[("threshold", "soon")]), Arc::new(NullAppender))
            .unwrap_err();
        assert!(matches!(
            err,
            PerfMonError::InvalidAppenderAttribute { ref attribute, .. } if attribute == "threshold"
        ));

        let bad_median = id_with(&[("median", "lots")]);
        assert!(AppenderHandle::new(bad_median, Arc::new(NullAppender)).is_err());

        let zero = AppenderId::new("null", Duration::ZERO, BTreeMap::new());
        assert!(AppenderHandle::new(zero, Arc::new(NullAppender)).is_err());
    }

    #[test]
    fn shutdown_stops_rolling() {
        let handle = AppenderHandle::new(id_with(&[]), Arc::new(NullAppender)).unwrap();
        let root = Monitor::new_root();
        handle.set_tasks(vec![Monitor::new_child(&root, "a")]);
        assert_eq!(handle.task_count(), 1);

        handle.shutdown();
        assert!(handle.is_stopped());
        assert_eq!(handle.task_count(), 0);
        assert!(handle.roll(0).is_empty());

        // Later attachments are ignored
        handle.attach(Monitor::new_child(&root, "b"));
        assert_eq!(handle.task_count(), 0);
    }

    /// Records sink calls in order; interval output is slow.
    #[derive(Debug, Default)]
    struct RecordingAppender {
        events: Mutex<Vec<&'static str>>,
    }

    impl Appender for RecordingAppender {
        fn output_interval(&self, _data: &IntervalData) -> io::Result<()> {
            self.events.lock().push("enter");
            std::thread::sleep(Duration::from_millis(100));
            self.events.lock().push("interval");
            Ok(())
        }

        fn output_trace(&self, _trace: &ThreadTraceData) -> io::Result<()> {
            self.events.lock().push("trace");
            Ok(())
        }

        fn de_init(&self) {
            self.events.lock().push("de_init");
        }
    }

    #[test]
    fn shutdown_waits_for_output_in_progress() {
        let sink = Arc::new(RecordingAppender::default());
        let handle = Arc::new(AppenderHandle::new(id_with(&[]), sink.clone()).unwrap());

        let writer = {
            let handle = handle.clone();
            std::thread::spawn(move || handle.output(&[IntervalData::builder("a").build()]))
        };
        while sink.events.lock().is_empty() {
            std::thread::sleep(Duration::from_millis(1));
        }
        handle.shutdown();
        assert_eq!(*sink.events.lock(), vec!["enter", "interval", "de_init"]);
        writer.join().unwrap();

        // A batch rolled before shutdown and a finished trace arrive late
        handle.output(&[IntervalData::builder("a").build()]);
        handle.output_trace(&ThreadTraceData::open("a", 0));
        assert_eq!(sink.events.lock().len(), 3);
    }

    #[test]
    fn builtin_classes() {
        let classes: Vec<_> = builtin_factories().into_iter().map(|(c, _)| c).collect();
        assert_eq!(classes, vec!["log", "json-file"]);
    }
}
