//! Monitors: named nodes of the hierarchy and their aggregates.
//!
//! A monitor keeps lifetime aggregates plus one interval accumulator per
//! appender it feeds. Hit and active-thread counts are updated at timer
//! start, completions and durations at stop. The active-thread count lives
//! outside the aggregate lock and is never reset, so threads that are inside
//! a monitor during a reconfiguration are still accounted for when they
//! leave.

use std::collections::BTreeMap;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use perfmon_types::{
    current_timestamp_ms, ActiveThreadStatus, IntervalData, MedianResult, Microseconds,
    OldestThread, SqlDurations, ThreadsOverThreshold, ThresholdResult,
};

use crate::appender::{AppenderHandle, AppenderId};
use crate::calc::{MedianCalculator, ThresholdCalculator};
use crate::pattern::CompiledPattern;
use crate::tracker::{ThreadTracker, TrackerToken};

/// Name of the root monitor.
pub const ROOT_NAME: &str = "<ROOT>";

static NEXT_MONITOR_ID: AtomicU64 = AtomicU64::new(1);

/// An appender attached to a monitor through a pattern.
#[derive(Debug, Clone)]
pub(crate) struct Binding {
    pub appender: Arc<AppenderHandle>,
    pub pattern: Arc<CompiledPattern>,
}

/// Public view of a binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingInfo {
    pub appender: AppenderId,
    /// Pattern as it applies at this monitor, after rewriting from the
    /// monitor it was configured on.
    pub pattern: String,
    /// Monitor the pattern is anchored at.
    pub anchor: String,
    pub applies_to_current: bool,
}

/// Effective calculator and tracking settings after cascading.
#[derive(Debug, Clone, Default)]
pub(crate) struct MonitorSettings {
    pub threshold: Option<ThresholdCalculator>,
    pub median: Option<MedianCalculator>,
    pub active_windows: Vec<Duration>,
}

#[derive(Debug)]
struct IntervalAccumulator {
    appender: u64,
    data: IntervalData,
    threshold: Option<ThresholdCalculator>,
    median: Option<MedianCalculator>,
}

impl IntervalAccumulator {
    fn new(
        monitor: &str,
        appender: &AppenderHandle,
        settings: &MonitorSettings,
        now_ms: u64,
        active: u64,
    ) -> Self {
        // The monitor's own definition wins over the appender's
        let threshold = settings
            .threshold
            .as_ref()
            .or(appender.threshold())
            .map(ThresholdCalculator::fresh);
        let median = settings
            .median
            .as_ref()
            .or(appender.median())
            .map(MedianCalculator::fresh);
        Self {
            appender: appender.key(),
            data: IntervalData::builder(monitor)
                .window(now_ms, now_ms)
                .max_active_threads(active, now_ms)
                .build(),
            threshold,
            median,
        }
    }

    /// Start the next interval with the same calculators.
    fn next(&self, now_ms: u64, active: u64) -> Self {
        Self {
            appender: self.appender,
            data: IntervalData::builder(self.data.monitor.clone())
                .window(now_ms, now_ms)
                .max_active_threads(active, now_ms)
                .build(),
            threshold: self.threshold.as_ref().map(ThresholdCalculator::fresh),
            median: self.median.as_ref().map(MedianCalculator::fresh),
        }
    }

    fn finish(self, now_ms: u64) -> IntervalData {
        let mut data = self.data;
        data.time_stop_ms = now_ms;
        if let Some(median) = &self.median {
            data.median = Some(median.get_median());
        }
        if let Some(threshold) = &self.threshold {
            data.thresholds = threshold.results();
        }
        data
    }
}

#[derive(Debug)]
struct MonitorState {
    /// Aggregates since creation or the last reset.
    lifetime: IntervalData,
    threshold: Option<ThresholdCalculator>,
    median: Option<MedianCalculator>,
    intervals: Vec<IntervalAccumulator>,
    settings: MonitorSettings,
    active: bool,
}

fn bump_max_active(data: &mut IntervalData, count: u64, now_ms: u64) {
    if count > data.max_active_threads {
        data.max_active_threads = count;
        data.max_active_threads_at_ms = now_ms;
    }
}

fn record_sql(data: &mut IntervalData, sql: Option<Duration>, now_ms: u64) {
    if let Some(sql) = sql {
        data.sql
            .get_or_insert_with(SqlDurations::default)
            .record(Microseconds::from(sql), now_ms);
    }
}

/// A named node in the monitor hierarchy.
#[derive(Debug)]
pub struct Monitor {
    id: u64,
    name: String,
    parent: Option<Weak<Monitor>>,
    depth: usize,
    children: RwLock<BTreeMap<String, Arc<Monitor>>>,
    bindings: RwLock<Vec<Binding>>,
    active: AtomicBool,
    active_count: AtomicU64,
    tracker: ThreadTracker,
    state: Mutex<MonitorState>,
}

impl Monitor {
    fn with_parent(name: String, parent: Option<Weak<Monitor>>, depth: usize) -> Self {
        let now_ms = current_timestamp_ms();
        Self {
            id: NEXT_MONITOR_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(MonitorState {
                lifetime: IntervalData::builder(name.clone()).window(now_ms, now_ms).build(),
                threshold: None,
                median: None,
                intervals: Vec::new(),
                settings: MonitorSettings::default(),
                active: false,
            }),
            name,
            parent,
            depth,
            children: RwLock::new(BTreeMap::new()),
            bindings: RwLock::new(Vec::new()),
            active: AtomicBool::new(false),
            active_count: AtomicU64::new(0),
            tracker: ThreadTracker::new(),
        }
    }

    pub(crate) fn new_root() -> Arc<Monitor> {
        Arc::new(Self::with_parent(ROOT_NAME.to_string(), None, 0))
    }

    /// Create a child under `parent` and link it in.
    #[cfg(test)]
    pub(crate) fn new_child(parent: &Arc<Monitor>, simple_name: &str) -> Arc<Monitor> {
        let child = Self::detached_child(parent, simple_name);
        parent.link_child(child.clone());
        child
    }

    /// Create a child that `parent` does not know about yet, so it can be
    /// configured before other threads can reach it.
    pub(crate) fn detached_child(parent: &Arc<Monitor>, simple_name: &str) -> Arc<Monitor> {
        let name = if parent.is_root() {
            simple_name.to_string()
        } else {
            format!("{}.{}", parent.name, simple_name)
        };
        Arc::new(Self::with_parent(
            name,
            Some(Arc::downgrade(parent)),
            parent.depth + 1,
        ))
    }

    pub(crate) fn link_child(&self, child: Arc<Monitor>) {
        self.children
            .write()
            .insert(child.simple_name().to_string(), child);
    }

    /// Process-unique identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Full dotted name; [`ROOT_NAME`] for the root.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last segment of the name.
    pub fn simple_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Number of segments in the name; 0 for the root.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn parent(&self) -> Option<Arc<Monitor>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn child(&self, simple_name: &str) -> Option<Arc<Monitor>> {
        self.children.read().get(simple_name).cloned()
    }

    /// Direct children ordered by simple name.
    pub fn children(&self) -> Vec<Arc<Monitor>> {
        self.children.read().values().cloned().collect()
    }

    /// Ancestry from the root down to this monitor.
    pub fn ancestry(self: &Arc<Self>) -> Vec<Arc<Monitor>> {
        let mut chain = vec![self.clone()];
        let mut current = self.parent();
        while let Some(m) = current {
            current = m.parent();
            chain.push(m);
        }
        chain.reverse();
        chain
    }

    /// True if at least one appender applies to this monitor or it tracks
    /// active threads on its own account.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Timers started since the last reset (aborted ones excluded).
    pub fn hits(&self) -> u64 {
        self.state.lock().lifetime.total_hits
    }

    pub fn completions(&self) -> u64 {
        self.state.lock().lifetime.total_completions
    }

    pub fn total_duration(&self) -> Microseconds {
        self.state.lock().lifetime.total_duration
    }

    /// Threads currently inside this monitor.
    pub fn active_thread_count(&self) -> u64 {
        self.active_count.load(Ordering::Acquire)
    }

    /// Number of appenders currently fed by this monitor.
    pub fn num_perfmon_tasks(&self) -> usize {
        self.state.lock().intervals.len()
    }

    /// Aggregates since creation or the last reset.
    pub fn lifetime(&self) -> IntervalData {
        let state = self.state.lock();
        let mut data = state.lifetime.clone();
        data.time_stop_ms = current_timestamp_ms();
        if let Some(median) = &state.median {
            data.median = Some(median.get_median());
        }
        if let Some(threshold) = &state.threshold {
            data.thresholds = threshold.results();
        }
        data
    }

    pub fn threshold_result(&self, threshold_ms: u64) -> Option<ThresholdResult> {
        self.state
            .lock()
            .threshold
            .as_ref()
            .and_then(|t| t.get_result(threshold_ms))
    }

    pub fn median(&self) -> Option<MedianResult> {
        self.state.lock().median.as_ref().map(|m| m.get_median())
    }

    pub fn bindings(&self) -> Vec<BindingInfo> {
        self.bindings
            .read()
            .iter()
            .map(|b| BindingInfo {
                appender: b.appender.id().clone(),
                pattern: b.pattern.source().to_string(),
                anchor: b.pattern.anchor().to_string(),
                applies_to_current: b.pattern.applies_to_current(),
            })
            .collect()
    }

    /// Active-thread report, if an active-thread monitor applies here.
    pub fn active_thread_status(&self) -> Option<ActiveThreadStatus> {
        let windows = self.state.lock().settings.active_windows.clone();
        if windows.is_empty() {
            None
        } else {
            Some(self.status_for(&windows))
        }
    }

    fn status_for(&self, windows: &[Duration]) -> ActiveThreadStatus {
        let now = Instant::now();
        ActiveThreadStatus {
            active_count: self.active_thread_count(),
            over_thresholds: windows
                .iter()
                .map(|w| ThreadsOverThreshold {
                    threshold_ms: w.as_millis() as u64,
                    count: self.tracker.count_older_than(*w, now),
                })
                .collect(),
            oldest: self.tracker.oldest().map(|t| OldestThread {
                elapsed: Microseconds::from(now.saturating_duration_since(t.started)),
                thread_name: t.thread_name,
                started_ms: t.started_ms,
            }),
        }
    }

    pub(crate) fn bindings_snapshot(&self) -> Vec<Binding> {
        self.bindings.read().clone()
    }

    /// True if some binding reaches the child named `simple_name`.
    pub(crate) fn admits_child(&self, simple_name: &str) -> bool {
        self.bindings
            .read()
            .iter()
            .any(|b| b.pattern.child_pattern(simple_name).is_some())
    }

    pub(crate) fn settings(&self) -> MonitorSettings {
        self.state.lock().settings.clone()
    }

    /// Replace the bindings. Activity and accumulators follow in
    /// [`Monitor::apply`].
    pub(crate) fn set_bindings(&self, bindings: Vec<Binding>) {
        *self.bindings.write() = bindings;
    }

    /// Appenders whose pattern includes this monitor, deduplicated.
    pub(crate) fn bound_appenders(&self) -> Vec<Arc<AppenderHandle>> {
        let mut out: Vec<Arc<AppenderHandle>> = Vec::new();
        for b in self.bindings.read().iter() {
            if b.pattern.applies_to_current() && !out.iter().any(|a| a.key() == b.appender.key())
            {
                out.push(b.appender.clone());
            }
        }
        out
    }

    /// Apply settings and bindings: recompute activity, keep accumulators
    /// of appenders still bound, open new ones and drop the rest. A monitor
    /// that stops being active has its aggregates reset; the active-thread
    /// count is left alone.
    pub(crate) fn apply(&self, settings: MonitorSettings, tracks_threads: bool, now_ms: u64) {
        let appenders = self.bound_appenders();
        let active = !appenders.is_empty() || tracks_threads;
        let current = self.active_thread_count();

        let mut state = self.state.lock();
        let was_active = state.active;

        let mut intervals = Vec::with_capacity(appenders.len());
        for appender in &appenders {
            let existing = state
                .intervals
                .iter()
                .position(|acc| acc.appender == appender.key())
                .map(|i| state.intervals.swap_remove(i));
            let fresh = IntervalAccumulator::new(&self.name, appender, &settings, now_ms, current);
            let acc = match existing {
                Some(mut acc) => {
                    // Keep counts unless the calculator definitions changed
                    if !same_threshold(&acc.threshold, &fresh.threshold) {
                        acc.threshold = fresh.threshold;
                    }
                    if !same_median(&acc.median, &fresh.median) {
                        acc.median = fresh.median;
                    }
                    acc
                }
                None => fresh,
            };
            intervals.push(acc);
        }
        state.intervals = intervals;

        if !same_threshold(&state.threshold, &settings.threshold) {
            state.threshold = settings.threshold.as_ref().map(ThresholdCalculator::fresh);
        }
        if !same_median(&state.median, &settings.median) {
            state.median = settings.median.as_ref().map(MedianCalculator::fresh);
        }
        state.settings = settings;

        if was_active && !active {
            state.lifetime = IntervalData::builder(self.name.clone())
                .window(now_ms, now_ms)
                .build();
            if let Some(t) = state.threshold.as_mut() {
                t.reset();
            }
            if let Some(m) = state.median.as_mut() {
                m.reset();
            }
        }
        state.active = active;
        self.active.store(active, Ordering::Release);
    }

    /// A timer entered this monitor. Returns a tracker token when an
    /// active-thread monitor applies.
    pub(crate) fn record_start(&self, now_ms: u64) -> Option<TrackerToken> {
        let count = self.active_count.fetch_add(1, Ordering::AcqRel) + 1;
        let track = {
            let mut state = self.state.lock();
            state.lifetime.total_hits += 1;
            bump_max_active(&mut state.lifetime, count, now_ms);
            for acc in state.intervals.iter_mut() {
                acc.data.total_hits += 1;
                bump_max_active(&mut acc.data, count, now_ms);
            }
            !state.settings.active_windows.is_empty()
        };
        track.then(|| self.tracker.add_current())
    }

    /// A timer left this monitor normally. Aggregates are only updated while
    /// the monitor is active.
    pub(crate) fn record_stop(
        &self,
        duration: Duration,
        sql: Option<Duration>,
        now_ms: u64,
        token: Option<TrackerToken>,
    ) {
        self.leave(token);

        let mut state = self.state.lock();
        if !state.active {
            return;
        }
        let us = Microseconds::from(duration);
        let ms = us.as_millis_f64();

        state.lifetime.record_completion(us, now_ms);
        record_sql(&mut state.lifetime, sql, now_ms);
        if let Some(t) = state.threshold.as_mut() {
            t.put_value(duration);
        }
        if let Some(m) = state.median.as_mut() {
            m.put_value(ms);
        }

        for acc in state.intervals.iter_mut() {
            acc.data.record_completion(us, now_ms);
            record_sql(&mut acc.data, sql, now_ms);
            if let Some(t) = acc.threshold.as_mut() {
                t.put_value(duration);
            }
            if let Some(m) = acc.median.as_mut() {
                m.put_value(ms);
            }
        }
    }

    /// A timer was aborted: undo its hit, leave completions alone.
    pub(crate) fn record_abort(&self, token: Option<TrackerToken>) {
        self.leave(token);

        let mut state = self.state.lock();
        state.lifetime.total_hits = state.lifetime.total_hits.saturating_sub(1);
        for acc in state.intervals.iter_mut() {
            acc.data.total_hits = acc.data.total_hits.saturating_sub(1);
        }
    }

    fn leave(&self, token: Option<TrackerToken>) {
        if let Some(token) = token {
            self.tracker.remove(token);
        }
        let _ = self
            .active_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
    }

    /// Close the interval feeding `appender` and open the next one.
    pub(crate) fn roll_interval(&self, appender: u64, now_ms: u64) -> Option<IntervalData> {
        let current = self.active_thread_count();
        let (mut data, windows) = {
            let mut state = self.state.lock();
            let acc = state.intervals.iter_mut().find(|a| a.appender == appender)?;
            let next = acc.next(now_ms, current);
            let finished = mem::replace(acc, next).finish(now_ms);
            (finished, state.settings.active_windows.clone())
        };
        if !windows.is_empty() {
            data.active_threads = Some(self.status_for(&windows));
        }
        Some(data)
    }
}

fn same_threshold(a: &Option<ThresholdCalculator>, b: &Option<ThresholdCalculator>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.same_definition(b),
        _ => false,
    }
}

fn same_median(a: &Option<MedianCalculator>, b: &Option<MedianCalculator>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.same_definition(b),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appender::testing::NullAppender;

    fn handle_with(attrs: &[(&str, &str)]) -> Arc<AppenderHandle> {
        let attributes = attrs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let id = AppenderId::new("null", Duration::from_secs(60), attributes);
        Arc::new(AppenderHandle::new(id, Arc::new(NullAppender)).unwrap())
    }

    fn handle() -> Arc<AppenderHandle> {
        handle_with(&[])
    }

    fn bound(monitor: &Arc<Monitor>, appender: &Arc<AppenderHandle>, pattern: &str) {
        monitor.set_bindings(vec![Binding {
            appender: appender.clone(),
            pattern: Arc::new(CompiledPattern::compile(monitor.name(), pattern).unwrap()),
        }]);
        monitor.apply(MonitorSettings::default(), false, current_timestamp_ms());
    }

    #[test]
    fn names_and_ancestry() {
        let root = Monitor::new_root();
        let a = Monitor::new_child(&root, "a");
        let b = Monitor::new_child(&a, "b");

        assert_eq!(root.name(), ROOT_NAME);
        assert_eq!(a.name(), "a");
        assert_eq!(b.name(), "a.b");
        assert_eq!(b.simple_name(), "b");
        assert_eq!(b.depth(), 2);
        assert!(Arc::ptr_eq(&b.parent().unwrap(), &a));
        assert!(Arc::ptr_eq(&a.child("b").unwrap(), &b));

        let names: Vec<_> = b.ancestry().iter().map(|m| m.name().to_string()).collect();
        assert_eq!(names, vec![ROOT_NAME, "a", "a.b"]);
    }

    #[test]
    fn inactive_monitor_ignores_completions() {
        let root = Monitor::new_root();
        let m = Monitor::new_child(&root, "m");

        let token = m.record_start(1);
        m.record_stop(Duration::from_millis(5), None, 2, token);
        assert_eq!(m.hits(), 1);
        assert_eq!(m.completions(), 0);
        assert_eq!(m.active_thread_count(), 0);
    }

    #[test]
    fn active_monitor_aggregates() {
        let root = Monitor::new_root();
        let m = Monitor::new_child(&root, "m");
        let appender = handle();
        bound(&m, &appender, "./");
        assert!(m.is_active());
        assert_eq!(m.num_perfmon_tasks(), 1);

        let t1 = m.record_start(10);
        let t2 = m.record_start(11);
        assert_eq!(m.active_thread_count(), 2);
        m.record_stop(Duration::from_millis(10), None, 20, t1);
        m.record_stop(Duration::from_millis(30), None, 21, t2);

        let lifetime = m.lifetime();
        assert_eq!(lifetime.total_hits, 2);
        assert_eq!(lifetime.total_completions, 2);
        assert_eq!(lifetime.total_duration, Microseconds::from_millis(40));
        assert_eq!(lifetime.max_active_threads, 2);
        assert_eq!(lifetime.max_duration.unwrap().at_ms, 21);
        assert_eq!(m.active_thread_count(), 0);
    }

    #[test]
    fn abort_rolls_back_hit_only() {
        let root = Monitor::new_root();
        let m = Monitor::new_child(&root, "m");
        bound(&m, &handle(), "./");

        let token = m.record_start(1);
        m.record_abort(token);
        assert_eq!(m.hits(), 0);
        assert_eq!(m.completions(), 0);
        assert_eq!(m.active_thread_count(), 0);
    }

    #[test]
    fn roll_interval_starts_fresh_window() {
        let root = Monitor::new_root();
        let m = Monitor::new_child(&root, "m");
        let appender = handle();
        bound(&m, &appender, "./");

        let outstanding = m.record_start(5);
        let t = m.record_start(5);
        m.record_stop(Duration::from_millis(4), None, 6, t);

        let first = m.roll_interval(appender.key(), 100).unwrap();
        assert_eq!(first.total_hits, 2);
        assert_eq!(first.total_completions, 1);
        assert_eq!(first.time_stop_ms, 100);

        let second = m.roll_interval(appender.key(), 200).unwrap();
        assert_eq!(second.total_hits, 0);
        assert_eq!(second.time_start_ms, 100);
        // The outstanding timer is still inside
        assert_eq!(second.max_active_threads, 1);

        m.record_stop(Duration::from_millis(1), None, 201, outstanding);
        assert!(m.roll_interval(999, 300).is_none());
    }

    #[test]
    fn deactivation_resets_aggregates_but_not_active_count() {
        let root = Monitor::new_root();
        let m = Monitor::new_child(&root, "m");
        bound(&m, &handle(), "./");

        let done = m.record_start(1);
        m.record_stop(Duration::from_millis(3), None, 2, done);
        let _inside = m.record_start(3);

        m.set_bindings(Vec::new());
        m.apply(MonitorSettings::default(), false, 4);

        assert!(!m.is_active());
        assert_eq!(m.hits(), 0);
        assert_eq!(m.completions(), 0);
        assert_eq!(m.num_perfmon_tasks(), 0);
        assert_eq!(m.active_thread_count(), 1);
    }

    #[test]
    fn monitor_threshold_wins_over_appender() {
        let root = Monitor::new_root();
        let m = Monitor::new_child(&root, "m");
        let appender = handle_with(&[("threshold", "5 seconds")]);

        m.set_bindings(vec![Binding {
            appender: appender.clone(),
            pattern: Arc::new(CompiledPattern::compile("m", "./").unwrap()),
        }]);
        let settings = MonitorSettings {
            threshold: Some(ThresholdCalculator::parse("1 second").unwrap()),
            ..Default::default()
        };
        m.apply(settings, false, 0);

        let t = m.record_start(1);
        m.record_stop(Duration::from_millis(1500), None, 2, t);

        let data = m.roll_interval(appender.key(), 3).unwrap();
        assert_eq!(data.threshold(1000).unwrap().count_over_threshold, 1);
        assert!(data.threshold(5000).is_none());
        assert_eq!(m.threshold_result(1000).unwrap().total_count, 1);
    }

    #[test]
    fn appender_calculators_apply_without_monitor_settings() {
        let root = Monitor::new_root();
        let m = Monitor::new_child(&root, "m");
        let appender = handle_with(&[
            ("threshold", "100"),
            ("median", "true"),
            ("median.factor", "1"),
        ]);
        m.set_bindings(vec![Binding {
            appender: appender.clone(),
            pattern: Arc::new(CompiledPattern::compile("m", "./").unwrap()),
        }]);
        m.apply(MonitorSettings::default(), false, 0);

        for ms in [50, 150, 250] {
            let t = m.record_start(1);
            m.record_stop(Duration::from_millis(ms), None, 2, t);
        }

        let data = m.roll_interval(appender.key(), 3).unwrap();
        assert_eq!(data.threshold(100).unwrap().count_over_threshold, 2);
        assert_eq!(data.median, Some(MedianResult::exact(150.0)));
        // Lifetime calculators only come from monitor settings
        assert!(m.median().is_none());
    }

    #[test]
    fn sql_durations_are_aggregated() {
        let root = Monitor::new_root();
        let m = Monitor::new_child(&root, "m");
        bound(&m, &handle(), "./");

        let t = m.record_start(1);
        m.record_stop(
            Duration::from_millis(10),
            Some(Duration::from_millis(4)),
            2,
            t,
        );
        let sql = m.lifetime().sql.unwrap();
        assert_eq!(sql.total_duration, Microseconds::from_millis(4));
    }

    #[test]
    fn active_thread_status_reports_windows() {
        let root = Monitor::new_root();
        let m = Monitor::new_child(&root, "m");
        let settings = MonitorSettings {
            active_windows: vec![Duration::ZERO, Duration::from_secs(3600)],
            ..Default::default()
        };
        m.apply(settings, true, 0);
        assert!(m.is_active());

        let token = m.record_start(1);
        let status = m.active_thread_status().unwrap();
        assert_eq!(status.active_count, 1);
        assert_eq!(status.over(0), Some(1));
        assert_eq!(status.over(3_600_000), Some(0));
        assert!(status.oldest.is_some());

        m.record_stop(Duration::from_millis(1), None, 2, token);
        let status = m.active_thread_status().unwrap();
        assert_eq!(status.active_count, 0);
        assert!(status.oldest.is_none());
    }
}
