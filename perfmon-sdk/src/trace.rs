//! Thread trace capture.
//!
//! When a timer starts on a monitor selected by a thread trace
//! configuration and one of its triggers fires, the calling thread begins a
//! trace. Every timer started on that thread until the triggering timer
//! stops becomes a span in the trace tree. Completed traces are handed to
//! the scheduler for delivery, never written on the calling thread.
//!
//! A timer stopped while timers started after it are still open is
//! miss-nested: its span is dropped and its children move up to the
//! enclosing span.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use perfmon_types::{current_timestamp_ms, ThreadTraceData};
use rand::Rng;
use serde::Deserialize;
use tracing::debug;

use crate::appender::AppenderHandle;
use crate::pattern::CompiledPattern;

/// Kinds of entries on a thread's property stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKind {
    Thread,
    RequestParameter,
    SessionAttribute,
    Cookie,
}

#[derive(Debug, Clone)]
struct Property {
    kind: PropertyKind,
    name: String,
    value: String,
}

thread_local! {
    static PROPERTIES: RefCell<Vec<Property>> = const { RefCell::new(Vec::new()) };
    static TRACES: RefCell<Vec<ActiveTrace>> = const { RefCell::new(Vec::new()) };
}

/// Push a property on the calling thread's stack. It is visible to trace
/// triggers until the returned guard is dropped.
///
/// Guards should be dropped in reverse order of creation; dropping a guard
/// also removes every property pushed after it.
///
/// ```rust
/// use perfmon_sdk::trace::{property, push_property, PropertyKind};
///
/// let _user = push_property(PropertyKind::SessionAttribute, "user", "alice");
/// assert_eq!(property(PropertyKind::SessionAttribute, "user").as_deref(), Some("alice"));
/// ```
pub fn push_property(
    kind: PropertyKind,
    name: impl Into<String>,
    value: impl Into<String>,
) -> PropertyGuard {
    // After thread-local teardown the guard truncates to usize::MAX, a no-op.
    let depth = PROPERTIES
        .try_with(|p| {
            let mut props = p.borrow_mut();
            let depth = props.len();
            props.push(Property {
                kind,
                name: name.into(),
                value: value.into(),
            });
            depth
        })
        .unwrap_or(usize::MAX);
    PropertyGuard {
        depth,
        _not_send: PhantomData,
    }
}

/// Most recently pushed value of a property on the calling thread.
pub fn property(kind: PropertyKind, name: &str) -> Option<String> {
    PROPERTIES
        .try_with(|p| {
            p.borrow()
                .iter()
                .rev()
                .find(|prop| prop.kind == kind && prop.name == name)
                .map(|prop| prop.value.clone())
        })
        .ok()
        .flatten()
}

fn has_property(kind: PropertyKind, name: &str, value: &str) -> bool {
    PROPERTIES
        .try_with(|p| {
            p.borrow()
                .iter()
                .any(|prop| prop.kind == kind && prop.name == name && prop.value == value)
        })
        .unwrap_or(false)
}

/// Pops its property when dropped.
#[must_use = "the property is removed when the guard is dropped"]
#[derive(Debug)]
pub struct PropertyGuard {
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

impl Drop for PropertyGuard {
    fn drop(&mut self) {
        let _ = PROPERTIES.try_with(|p| p.borrow_mut().truncate(self.depth));
    }
}

/// Condition under which a matching monitor starts a trace.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// The calling thread has this name.
    ThreadName { name: String },
    /// A [`PropertyKind::Thread`] property with this value is on the stack.
    ThreadProperty { name: String, value: String },
    RequestParameter { name: String, value: String },
    SessionAttribute { name: String, value: String },
    Cookie { name: String, value: String },
    /// Fires for one call in `factor` on average.
    Random { factor: u32 },
}

impl Trigger {
    pub fn is_satisfied(&self) -> bool {
        match self {
            Trigger::ThreadName { name } => std::thread::current().name() == Some(name.as_str()),
            Trigger::ThreadProperty { name, value } => {
                has_property(PropertyKind::Thread, name, value)
            }
            Trigger::RequestParameter { name, value } => {
                has_property(PropertyKind::RequestParameter, name, value)
            }
            Trigger::SessionAttribute { name, value } => {
                has_property(PropertyKind::SessionAttribute, name, value)
            }
            Trigger::Cookie { name, value } => has_property(PropertyKind::Cookie, name, value),
            Trigger::Random { factor } => {
                *factor <= 1 || rand::thread_rng().gen_range(0..*factor) == 0
            }
        }
    }
}

/// A compiled thread trace configuration.
#[derive(Debug)]
pub(crate) struct TraceBinding {
    pub pattern: Arc<CompiledPattern>,
    pub max_depth: usize,
    pub min_duration: Duration,
    pub appenders: Vec<Arc<AppenderHandle>>,
    pub triggers: Vec<Trigger>,
}

impl TraceBinding {
    fn should_start(&self, name: &str) -> bool {
        self.pattern.matches(name)
            && (self.triggers.is_empty() || self.triggers.iter().any(Trigger::is_satisfied))
    }
}

#[derive(Debug)]
struct Node {
    name: String,
    start_ms: u64,
    started: Instant,
    end_ms: Option<u64>,
    elapsed: Option<Duration>,
    parent: Option<usize>,
    children: Vec<usize>,
}

#[derive(Debug, Clone, Copy)]
struct OpenSpan {
    seq: u64,
    /// `None` when the span is below the trace's max depth.
    node: Option<usize>,
}

#[derive(Debug)]
struct ActiveTrace {
    registry: u64,
    binding: Arc<TraceBinding>,
    nodes: Vec<Node>,
    open: Vec<OpenSpan>,
    next_seq: u64,
}

impl ActiveTrace {
    fn begin(registry: u64, binding: Arc<TraceBinding>, name: &str) -> (Self, u64) {
        let mut trace = Self {
            registry,
            binding,
            nodes: Vec::new(),
            open: Vec::new(),
            next_seq: 0,
        };
        let seq = trace.push(name);
        (trace, seq)
    }

    fn push(&mut self, name: &str) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;

        let depth = self.open.len() + 1;
        let max_depth = self.binding.max_depth;
        let node = if max_depth > 0 && depth > max_depth {
            None
        } else {
            let parent = self.open.iter().rev().find_map(|s| s.node);
            let index = self.nodes.len();
            self.nodes.push(Node {
                name: name.to_string(),
                start_ms: current_timestamp_ms(),
                started: Instant::now(),
                end_ms: None,
                elapsed: None,
                parent,
                children: Vec::new(),
            });
            if let Some(p) = parent {
                self.nodes[p].children.push(index);
            }
            Some(index)
        };

        self.open.push(OpenSpan { seq, node });
        seq
    }

    fn close(&mut self, index: usize) {
        let node = &mut self.nodes[index];
        node.elapsed = Some(node.started.elapsed());
        node.end_ms = Some(current_timestamp_ms().max(node.start_ms));
    }

    /// Drop a span, moving its children to its parent in its place.
    fn unlink(&mut self, index: usize) {
        let parent = self.nodes[index].parent;
        let children = mem::take(&mut self.nodes[index].children);
        for &c in &children {
            self.nodes[c].parent = parent;
        }
        if let Some(p) = parent {
            let siblings = &mut self.nodes[p].children;
            if let Some(i) = siblings.iter().position(|&x| x == index) {
                siblings.splice(i..=i, children);
            }
        }
    }

    fn build(&self, index: usize, is_root: bool) -> Option<ThreadTraceData> {
        let node = &self.nodes[index];
        let min = self.binding.min_duration;
        if !is_root && !min.is_zero() && node.elapsed.map_or(true, |e| e < min) {
            return None;
        }
        Some(ThreadTraceData {
            name: node.name.clone(),
            start_ms: node.start_ms,
            end_ms: node.end_ms,
            children: node
                .children
                .iter()
                .filter_map(|&c| self.build(c, false))
                .collect(),
        })
    }
}

/// Result of stopping a traced timer.
#[derive(Debug, Default)]
pub(crate) struct TraceStop {
    /// Spans dropped because they were not stopped in nesting order.
    pub miss_nested: u64,
    /// Set when the triggering timer stopped.
    pub finished: Option<(Arc<TraceBinding>, ThreadTraceData)>,
}

/// A timer started on the calling thread. Returns the span sequence when
/// the timer is part of a trace.
pub(crate) fn on_start(registry: u64, bindings: &[Arc<TraceBinding>], name: &str) -> Option<u64> {
    TRACES
        .try_with(|cell| {
            let mut traces = cell.borrow_mut();
            if let Some(active) = traces.iter_mut().find(|t| t.registry == registry) {
                return Some(active.push(name));
            }
            let binding = bindings.iter().find(|b| b.should_start(name))?;
            let (trace, seq) = ActiveTrace::begin(registry, binding.clone(), name);
            traces.push(trace);
            Some(seq)
        })
        .ok()
        .flatten()
}

/// A traced timer stopped.
pub(crate) fn on_stop(registry: u64, seq: u64) -> TraceStop {
    TRACES
        .try_with(|cell| {
            let mut traces = cell.borrow_mut();
            let Some(t) = traces.iter().position(|t| t.registry == registry) else {
                return TraceStop::default();
            };
            let trace = &mut traces[t];
            let Some(pos) = trace.open.iter().rposition(|s| s.seq == seq) else {
                return TraceStop::default();
            };

            let mut result = TraceStop::default();
            let top = trace.open.len() - 1;

            if pos == 0 {
                // The triggering timer: spans still open are miss-nested
                let dropped: Vec<OpenSpan> = trace.open.drain(1..).collect();
                for span in dropped.iter().rev() {
                    result.miss_nested += 1;
                    if let Some(n) = span.node {
                        debug!(monitor = %trace.nodes[n].name, "Discarding miss-nested timer span");
                        trace.unlink(n);
                    }
                }
                trace.open.clear();
                trace.close(0);
                let trace = traces.swap_remove(t);
                result.finished = trace
                    .build(0, true)
                    .map(|data| (trace.binding.clone(), data));
                return result;
            }

            let span = trace.open.remove(pos);
            if let Some(n) = span.node {
                if pos == top {
                    trace.close(n);
                } else {
                    debug!(monitor = %trace.nodes[n].name, "Discarding miss-nested timer span");
                    trace.unlink(n);
                }
            }
            if pos != top {
                result.miss_nested += 1;
            }
            result
        })
        .unwrap_or_default()
}

/// A traced timer was aborted: its span is dropped. Aborting the
/// triggering timer drops the whole trace.
pub(crate) fn on_abort(registry: u64, seq: u64) {
    let _ = TRACES.try_with(|cell| {
        let mut traces = cell.borrow_mut();
        let Some(t) = traces.iter().position(|t| t.registry == registry) else {
            return;
        };
        let trace = &mut traces[t];
        let Some(pos) = trace.open.iter().rposition(|s| s.seq == seq) else {
            return;
        };
        if pos == 0 {
            traces.swap_remove(t);
            return;
        }
        let span = trace.open.remove(pos);
        if let Some(n) = span.node {
            trace.unlink(n);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn binding(
        anchor: &str,
        pattern: &str,
        max_depth: usize,
        triggers: Vec<Trigger>,
    ) -> Arc<TraceBinding> {
        Arc::new(TraceBinding {
            pattern: Arc::new(CompiledPattern::compile(anchor, pattern).unwrap()),
            max_depth,
            min_duration: Duration::ZERO,
            appenders: Vec::new(),
            triggers,
        })
    }

    const REG: u64 = 7;

    struct StartsOnDrop(Vec<Arc<TraceBinding>>);

    impl Drop for StartsOnDrop {
        fn drop(&mut self) {
            let _guard = push_property(PropertyKind::SessionAttribute, "late", "x");
            let _ = property(PropertyKind::SessionAttribute, "late");
            let _ = on_start(REG, &self.0, "R");
        }
    }

    thread_local! {
        static LATE: RefCell<Option<StartsOnDrop>> = const { RefCell::new(None) };
    }

    #[test]
    fn thread_teardown_does_not_panic() {
        let worker = thread::spawn(|| {
            // Registered first, so destroyed after the trace and property stacks.
            LATE.with(|l| *l.borrow_mut() = Some(StartsOnDrop(vec![binding("R", "./", 0, vec![])])));
            let _guard = push_property(PropertyKind::SessionAttribute, "early", "x");
            assert_eq!(on_start(REG + 1, &[], "R"), None);
        });
        assert!(worker.join().is_ok());
    }

    #[test]
    fn captures_nested_spans() {
        let bindings = vec![binding("R", "./", 0, vec![])];
        let r = on_start(REG, &bindings, "R").unwrap();
        let a = on_start(REG, &bindings, "A").unwrap();
        let b = on_start(REG, &bindings, "B").unwrap();
        assert!(on_stop(REG, b).finished.is_none());
        assert!(on_stop(REG, a).finished.is_none());
        let c = on_start(REG, &bindings, "C").unwrap();
        assert!(on_stop(REG, c).finished.is_none());

        let stop = on_stop(REG, r);
        let (_, trace) = stop.finished.unwrap();
        assert_eq!(stop.miss_nested, 0);
        assert_eq!(trace.name, "R");
        assert_eq!(trace.child_names(), vec!["A", "C"]);
        assert_eq!(trace.find("A").unwrap().child_names(), vec!["B"]);
        assert!(trace.end_ms.is_some());
    }

    #[test]
    fn unmatched_monitor_does_not_start_a_trace() {
        let bindings = vec![binding("R", "./", 0, vec![])];
        assert!(on_start(REG, &bindings, "Other").is_none());
        assert!(on_start(REG, &[], "R").is_none());
    }

    #[test]
    fn miss_nested_span_is_discarded_and_children_reparented() {
        let bindings = vec![binding("R", "./", 0, vec![])];
        let r = on_start(REG, &bindings, "R").unwrap();
        let a = on_start(REG, &bindings, "A").unwrap();
        let b = on_start(REG, &bindings, "B").unwrap();
        let c = on_start(REG, &bindings, "C").unwrap();
        assert_eq!(on_stop(REG, c).miss_nested, 0);

        // A stops before B
        assert_eq!(on_stop(REG, a).miss_nested, 1);
        assert_eq!(on_stop(REG, b).miss_nested, 0);

        let (_, trace) = on_stop(REG, r).finished.unwrap();
        assert_eq!(trace.child_names(), vec!["B"]);
        assert_eq!(trace.find("B").unwrap().child_names(), vec!["C"]);
        assert!(trace.find("A").is_none());
    }

    #[test]
    fn max_depth_truncates_but_keeps_bookkeeping() {
        let bindings = vec![binding("R", "./", 2, vec![])];
        let r = on_start(REG, &bindings, "R").unwrap();
        let a = on_start(REG, &bindings, "A").unwrap();
        let b = on_start(REG, &bindings, "B").unwrap();
        let c = on_start(REG, &bindings, "C").unwrap();
        on_stop(REG, c);
        on_stop(REG, b);
        let d = on_start(REG, &bindings, "D").unwrap();
        on_stop(REG, d);
        on_stop(REG, a);
        let e = on_start(REG, &bindings, "E").unwrap();
        on_stop(REG, e);

        let (_, trace) = on_stop(REG, r).finished.unwrap();
        assert_eq!(trace.depth(), 2);
        assert_eq!(trace.child_names(), vec!["A", "E"]);
        assert!(trace.find("A").unwrap().children.is_empty());
    }

    #[test]
    fn root_stop_discards_open_spans() {
        let bindings = vec![binding("R", "./", 0, vec![])];
        let r = on_start(REG, &bindings, "R").unwrap();
        let a = on_start(REG, &bindings, "A").unwrap();
        let b = on_start(REG, &bindings, "B").unwrap();
        on_stop(REG, b);

        let stop = on_stop(REG, r);
        assert_eq!(stop.miss_nested, 1);
        let (_, trace) = stop.finished.unwrap();
        assert_eq!(trace.child_names(), vec!["B"]);

        // The late stop belongs to no trace any more
        let late = on_stop(REG, a);
        assert_eq!(late.miss_nested, 0);
        assert!(late.finished.is_none());
    }

    #[test]
    fn abort_drops_span_or_trace() {
        let bindings = vec![binding("R", "./", 0, vec![])];
        let r = on_start(REG, &bindings, "R").unwrap();
        let a = on_start(REG, &bindings, "A").unwrap();
        let b = on_start(REG, &bindings, "B").unwrap();
        on_stop(REG, b);
        on_abort(REG, a);
        let (_, trace) = on_stop(REG, r).finished.unwrap();
        assert_eq!(trace.child_names(), vec!["B"]);

        let r = on_start(REG, &bindings, "R").unwrap();
        on_abort(REG, r);
        // A new timer on the same monitor starts a fresh trace
        let again = on_start(REG, &bindings, "R").unwrap();
        assert_eq!(again, 0);
        assert!(on_stop(REG, again).finished.is_some());
    }

    #[test]
    fn min_duration_prunes_short_spans() {
        let bindings = vec![Arc::new(TraceBinding {
            pattern: Arc::new(CompiledPattern::compile("R", "./").unwrap()),
            max_depth: 0,
            min_duration: Duration::from_millis(20),
            appenders: Vec::new(),
            triggers: Vec::new(),
        })];
        let r = on_start(REG, &bindings, "R").unwrap();
        let fast = on_start(REG, &bindings, "fast").unwrap();
        on_stop(REG, fast);
        let slow = on_start(REG, &bindings, "slow").unwrap();
        thread::sleep(Duration::from_millis(30));
        on_stop(REG, slow);

        let (_, trace) = on_stop(REG, r).finished.unwrap();
        assert_eq!(trace.child_names(), vec!["slow"]);
    }

    #[test]
    fn traces_are_per_registry() {
        let bindings = vec![binding("R", "./", 0, vec![])];
        let one = on_start(1, &bindings, "R").unwrap();
        let two = on_start(2, &bindings, "R").unwrap();
        assert!(on_stop(1, one).finished.is_some());
        assert!(on_stop(2, two).finished.is_some());
    }

    #[test]
    fn descendant_pattern_selects_triggering_monitors() {
        let bindings = vec![binding("svc", "/**", 0, vec![])];
        assert!(on_start(REG, &bindings, "svc").is_none());
        let seq = on_start(REG, &bindings, "svc.db").unwrap();
        assert!(on_stop(REG, seq).finished.is_some());
    }

    #[test]
    fn thread_name_trigger() {
        let trigger = Trigger::ThreadName {
            name: "trace-me".into(),
        };
        let inside = thread::Builder::new()
            .name("trace-me".into())
            .spawn({
                let trigger = trigger.clone();
                move || trigger.is_satisfied()
            })
            .unwrap()
            .join()
            .unwrap();
        assert!(inside);

        let outside = thread::Builder::new()
            .name("other".into())
            .spawn(move || trigger.is_satisfied())
            .unwrap()
            .join()
            .unwrap();
        assert!(!outside);
    }

    #[test]
    fn property_triggers_follow_the_stack() {
        let trigger = Trigger::SessionAttribute {
            name: "user".into(),
            value: "alice".into(),
        };
        assert!(!trigger.is_satisfied());
        {
            let _guard = push_property(PropertyKind::SessionAttribute, "user", "alice");
            assert!(trigger.is_satisfied());
            // Same name under a different kind does not count
            assert!(!Trigger::Cookie {
                name: "user".into(),
                value: "alice".into()
            }
            .is_satisfied());
        }
        assert!(!trigger.is_satisfied());
        assert!(property(PropertyKind::SessionAttribute, "user").is_none());
    }

    #[test]
    fn property_stack_shadows_older_values() {
        let _outer = push_property(PropertyKind::Thread, "tenant", "a");
        {
            let _inner = push_property(PropertyKind::Thread, "tenant", "b");
            assert_eq!(property(PropertyKind::Thread, "tenant").as_deref(), Some("b"));
        }
        assert_eq!(property(PropertyKind::Thread, "tenant").as_deref(), Some("a"));
    }

    #[test]
    fn random_trigger_with_factor_one_always_fires() {
        assert!(Trigger::Random { factor: 1 }.is_satisfied());
        assert!(Trigger::Random { factor: 0 }.is_satisfied());
    }

    #[test]
    fn triggers_gate_trace_start() {
        let bindings = vec![binding(
            "R",
            "./",
            0,
            vec![Trigger::ThreadProperty {
                name: "debug".into(),
                value: "on".into(),
            }],
        )];
        assert!(on_start(REG, &bindings, "R").is_none());

        let _guard = push_property(PropertyKind::Thread, "debug", "on");
        let seq = on_start(REG, &bindings, "R").unwrap();
        assert!(on_stop(REG, seq).finished.is_some());
    }
}
