//! Timers and their per-thread nesting.
//!
//! A timer records on the monitor it resolved to and on every active
//! ancestor. A monitor already open on the calling thread is not recorded
//! again: only the outermost timer on a monitor owns its hit, its duration
//! and its active-thread slot.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::monitor::Monitor;
use crate::registry::Registry;
use crate::tracker::TrackerToken;

thread_local! {
    static NESTING: RefCell<HashMap<u64, u32>> = RefCell::new(HashMap::new());
}

/// Mark `monitor` open on this thread. Returns true for the outermost entry.
fn enter(monitor: u64) -> bool {
    NESTING
        .try_with(|n| {
            let mut nesting = n.borrow_mut();
            let depth = nesting.entry(monitor).or_insert(0);
            *depth += 1;
            *depth == 1
        })
        .unwrap_or(true)
}

fn leave(monitor: u64) {
    let _ = NESTING.try_with(|n| {
        let mut nesting = n.borrow_mut();
        if let Some(depth) = nesting.get_mut(&monitor) {
            *depth -= 1;
            if *depth == 0 {
                nesting.remove(&monitor);
            }
        }
    });
}

/// How a timer was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerState {
    /// Nothing in the requested monitor's ancestry is active.
    Inactive,
    /// The requested monitor itself is active.
    Bound,
    /// The requested monitor is inactive and the timer resolved to its
    /// nearest active ancestor.
    Bypassed,
}

/// One monitor a timer records on.
pub(crate) struct TimerEntry {
    monitor: Arc<Monitor>,
    owned: bool,
    token: Option<TrackerToken>,
}

impl TimerEntry {
    pub(crate) fn enter(monitor: Arc<Monitor>, now_ms: u64) -> Self {
        let owned = enter(monitor.id());
        let token = if owned {
            monitor.record_start(now_ms)
        } else {
            None
        };
        Self {
            monitor,
            owned,
            token,
        }
    }

    pub(crate) fn stop(self, duration: Duration, sql: Option<Duration>, now_ms: u64) {
        leave(self.monitor.id());
        if self.owned {
            self.monitor.record_stop(duration, sql, now_ms, self.token);
        }
    }

    pub(crate) fn abort(self) {
        leave(self.monitor.id());
        if self.owned {
            self.monitor.record_abort(self.token);
        }
    }
}

pub(crate) struct TimerInner {
    pub registry: u64,
    pub name: String,
    pub state: TimerState,
    /// Resolved monitor first, then its active ancestors.
    pub entries: Vec<TimerEntry>,
    pub started: Instant,
    pub sql_start: Option<Duration>,
    pub trace_seq: Option<u64>,
}

/// A started timer. Hand it back to [`Registry::stop`] or
/// [`Registry::abort`] on the thread that started it.
///
/// Timers that resolve to no active monitor and no thread trace are null:
/// stopping them does nothing.
#[must_use = "a timer must be stopped or aborted"]
pub struct Timer {
    pub(crate) inner: Option<TimerInner>,
    _not_send: PhantomData<*const ()>,
}

impl Timer {
    /// The timer that records nothing.
    pub fn null() -> Self {
        Self {
            inner: None,
            _not_send: PhantomData,
        }
    }

    pub(crate) fn new(inner: TimerInner) -> Self {
        Self {
            inner: Some(inner),
            _not_send: PhantomData,
        }
    }

    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    pub fn state(&self) -> TimerState {
        self.inner
            .as_ref()
            .map_or(TimerState::Inactive, |inner| inner.state)
    }

    /// The name the timer was started with.
    pub fn name(&self) -> Option<&str> {
        self.inner.as_ref().map(|inner| inner.name.as_str())
    }

    /// The monitor the timer resolved to.
    pub fn monitor(&self) -> Option<&Arc<Monitor>> {
        self.inner
            .as_ref()
            .and_then(|inner| inner.entries.first())
            .map(|entry| &entry.monitor)
    }

    /// Whether the timer is part of a thread trace.
    pub fn is_traced(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|inner| inner.trace_seq.is_some())
    }

    pub fn elapsed(&self) -> Duration {
        self.inner
            .as_ref()
            .map_or(Duration::ZERO, |inner| inner.started.elapsed())
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            None => f.write_str("Timer(null)"),
            Some(inner) => f
                .debug_struct("Timer")
                .field("name", &inner.name)
                .field("state", &inner.state)
                .field("monitor", &self.monitor().map(|m| m.name()))
                .field("traced", &inner.trace_seq.is_some())
                .finish(),
        }
    }
}

/// Stops its timer when dropped.
///
/// ```rust
/// use perfmon_sdk::Registry;
///
/// let registry = Registry::builder().build().unwrap();
/// {
///     let _guard = registry.scope("orders.submit");
///     // timed work
/// }
/// ```
#[must_use = "the timer stops when the guard is dropped"]
pub struct TimerGuard<'a> {
    registry: &'a Registry,
    timer: Option<Timer>,
}

impl<'a> TimerGuard<'a> {
    pub(crate) fn new(registry: &'a Registry, timer: Timer) -> Self {
        Self {
            registry,
            timer: Some(timer),
        }
    }

    pub fn timer(&self) -> Option<&Timer> {
        self.timer.as_ref()
    }

    /// Stop now instead of at the end of the scope.
    pub fn stop(mut self) {
        if let Some(timer) = self.timer.take() {
            self.registry.stop(timer);
        }
    }

    /// Abort instead of stopping.
    pub fn abort(mut self) {
        if let Some(timer) = self.timer.take() {
            self.registry.abort(timer);
        }
    }
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            self.registry.stop(timer);
        }
    }
}

impl fmt::Debug for TimerGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerGuard")
            .field("timer", &self.timer)
            .finish_non_exhaustive()
    }
}
