//! The registry: monitor tree, appender identities and the timer API.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use perfmon_types::current_timestamp_ms;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::appender::{builtin_factories, Appender, AppenderFactory, AppenderHandle, AppenderId};
use crate::calc::{MedianCalculator, ThresholdCalculator};
use crate::config::Configuration;
use crate::duration::parse_duration_list;
use crate::error::{PerfMonError, Result};
use crate::monitor::{Binding, Monitor, MonitorSettings, ROOT_NAME};
use crate::pattern::PatternCache;
use crate::scheduler::{Scheduler, DEFAULT_TRACE_QUEUE_CAPACITY};
use crate::sql;
use crate::timer::{Timer, TimerEntry, TimerGuard, TimerInner, TimerState};
use crate::trace::{self, TraceBinding};

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Outcome of [`Registry::configure`].
///
/// A configuration is applied as far as possible; entries that fail are
/// skipped and reported here.
#[derive(Debug, Default)]
pub struct ConfigureStatus {
    pub partial_load: bool,
    /// Appender aliases, monitor names or patterns that were skipped.
    pub unresolved: Vec<String>,
    pub errors: Vec<PerfMonError>,
}

impl ConfigureStatus {
    pub fn is_complete(&self) -> bool {
        !self.partial_load
    }

    fn fail(&mut self, name: impl Into<String>, error: PerfMonError) {
        let name = name.into();
        warn!(name = %name, error = %error, "Skipping configuration entry");
        self.partial_load = true;
        if !self.unresolved.contains(&name) {
            self.unresolved.push(name);
        }
        self.errors.push(error);
    }
}

/// Settings named directly on a monitor in the configuration.
#[derive(Default)]
struct Explicit {
    bindings: Vec<Binding>,
    threshold: Option<ThresholdCalculator>,
    median: Option<MedianCalculator>,
    windows: Option<Vec<Duration>>,
}

#[derive(Default)]
struct ActiveConfig {
    appenders: HashMap<AppenderId, Arc<AppenderHandle>>,
    traces: Vec<Arc<TraceBinding>>,
    sql_time: bool,
}

struct RegistryInner {
    id: u64,
    root: Arc<Monitor>,
    /// Held for reading by timers and for writing by `configure`.
    config: RwLock<ActiveConfig>,
    /// Serializes linking new monitors into the tree.
    arena: Mutex<()>,
    patterns: PatternCache,
    factories: HashMap<String, AppenderFactory>,
    scheduler: Scheduler,
    miss_nested: AtomicU64,
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        for handle in self.config.get_mut().appenders.values() {
            handle.shutdown();
        }
    }
}

/// The monitor tree and everything attached to it.
///
/// Cloning is cheap and yields a handle to the same registry. Appenders are
/// shut down when the last clone is dropped.
///
/// ```rust
/// use perfmon_sdk::{Configuration, Registry};
/// use std::time::Duration;
///
/// let registry = Registry::builder().build().unwrap();
/// let status = registry.configure(
///     &Configuration::builder()
///         .appender("console", "log", Duration::from_secs(60))
///         .monitor("orders", |m| m.appender("console", "./**"))
///         .build(),
/// );
/// assert!(status.is_complete());
///
/// let timer = registry.start("orders.submit");
/// registry.stop(timer);
/// assert_eq!(registry.monitor("orders.submit").unwrap().completions(), 1);
/// ```
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name == ROOT_NAME {
        return Ok(());
    }
    let valid = !name.is_empty()
        && name
            .split('.')
            .all(|s| !s.is_empty() && !s.chars().any(char::is_whitespace));
    if valid {
        Ok(())
    } else {
        Err(PerfMonError::InvalidMonitorName(name.to_string()))
    }
}

impl Registry {
    /// A registry with the built-in appender classes and its own scheduler
    /// runtime.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn root(&self) -> &Arc<Monitor> {
        &self.inner.root
    }

    /// The monitor named `name`, creating it and any missing ancestors.
    /// Repeated calls return the same monitor.
    pub fn get_or_create(&self, name: &str) -> Result<Arc<Monitor>> {
        let _config = self.inner.config.read();
        self.create_path(name)
    }

    /// Look up a monitor without creating it.
    pub fn monitor(&self, name: &str) -> Option<Arc<Monitor>> {
        if name == ROOT_NAME {
            return Some(self.inner.root.clone());
        }
        validate_name(name).ok()?;
        let mut node = self.inner.root.clone();
        for segment in name.split('.') {
            node = node.child(segment)?;
        }
        Some(node)
    }

    /// Names of every monitor below the root, parents before children.
    pub fn monitor_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        let mut pending = self.inner.root.children();
        pending.reverse();
        while let Some(monitor) = pending.pop() {
            names.push(monitor.name().to_string());
            let mut children = monitor.children();
            children.reverse();
            pending.extend(children);
        }
        names
    }

    /// Identities of the live appenders.
    pub fn appender_ids(&self) -> Vec<AppenderId> {
        let mut ids: Vec<AppenderId> = self.inner.config.read().appenders.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Start a timer, creating monitors below configured ones as their
    /// descendant patterns allow.
    pub fn start(&self, name: &str) -> Timer {
        self.start_with(name, true)
    }

    /// Start a timer. With `dynamic` false no monitor is created and the
    /// timer resolves to the nearest existing active ancestor.
    ///
    /// Never fails: a name that is invalid or has nothing active in its
    /// ancestry yields the null timer.
    pub fn start_with(&self, name: &str, dynamic: bool) -> Timer {
        if validate_name(name).is_err() {
            return Timer::null();
        }
        let inner = &*self.inner;
        let config = inner.config.read();
        let resolved = self.resolve(name, dynamic);
        let started = Instant::now();
        let now_ms = current_timestamp_ms();

        let state = if resolved.name() == name && resolved.is_active() {
            TimerState::Bound
        } else {
            TimerState::Bypassed
        };

        let mut entries = Vec::new();
        let mut current = Some(resolved);
        while let Some(monitor) = current {
            current = monitor.parent();
            if monitor.is_active() {
                entries.push(TimerEntry::enter(monitor, now_ms));
            }
        }

        let trace_seq = trace::on_start(inner.id, &config.traces, name);
        if entries.is_empty() && trace_seq.is_none() {
            return Timer::null();
        }
        let sql_start = config.sql_time.then(sql::current);

        Timer::new(TimerInner {
            registry: inner.id,
            name: name.to_string(),
            state: if entries.is_empty() {
                TimerState::Inactive
            } else {
                state
            },
            entries,
            started,
            sql_start,
            trace_seq,
        })
    }

    /// Stop a timer: record its duration on every monitor it owns.
    pub fn stop(&self, timer: Timer) {
        let Some(t) = timer.inner else {
            return;
        };
        let duration = t.started.elapsed();
        let now_ms = current_timestamp_ms();
        let sql = t.sql_start.map(|s| sql::current().saturating_sub(s));

        {
            let _config = self.inner.config.read();
            for entry in t.entries {
                entry.stop(duration, sql, now_ms);
            }
        }

        if let Some(seq) = t.trace_seq {
            let outcome = trace::on_stop(t.registry, seq);
            if outcome.miss_nested > 0 {
                self.inner
                    .miss_nested
                    .fetch_add(outcome.miss_nested, Ordering::Relaxed);
            }
            if let Some((binding, data)) = outcome.finished {
                self.inner
                    .scheduler
                    .deliver_trace(binding.appenders.clone(), data);
            }
        }
    }

    /// Abort a timer: undo its hit and active-thread slot without recording
    /// a completion.
    pub fn abort(&self, timer: Timer) {
        let Some(t) = timer.inner else {
            return;
        };
        {
            let _config = self.inner.config.read();
            for entry in t.entries {
                entry.abort();
            }
        }
        if let Some(seq) = t.trace_seq {
            trace::on_abort(t.registry, seq);
        }
    }

    /// Start a timer that stops when the guard is dropped.
    pub fn scope(&self, name: &str) -> TimerGuard<'_> {
        TimerGuard::new(self, self.start(name))
    }

    /// Apply a configuration snapshot, replacing the previous one.
    ///
    /// Appenders are shared by identity: an identity present before and
    /// after keeps its instance and its current interval. Monitors that lose
    /// every appender have their aggregates reset; threads still inside
    /// them stay counted.
    pub fn configure(&self, config: &Configuration) -> ConfigureStatus {
        let inner = &*self.inner;
        let mut status = ConfigureStatus::default();
        let now_ms = current_timestamp_ms();
        let mut active = inner.config.write();

        // Appenders, one instance per identity
        let mut handles: HashMap<AppenderId, Arc<AppenderHandle>> = HashMap::new();
        let mut aliases: HashMap<&str, Arc<AppenderHandle>> = HashMap::new();
        let mut created = Vec::new();
        for def in &config.appenders {
            let id = AppenderId::new(def.class.as_str(), def.interval, def.attributes.clone());
            let handle = match handles.get(&id).or_else(|| active.appenders.get(&id)) {
                Some(handle) => handle.clone(),
                None => match self.create_appender(&id) {
                    Ok(handle) => {
                        created.push(handle.clone());
                        handle
                    }
                    Err(e) => {
                        status.fail(def.name.as_str(), e);
                        continue;
                    }
                },
            };
            handles.insert(id, handle.clone());
            aliases.insert(def.name.as_str(), handle);
        }

        // Bindings and settings named on monitors
        let mut explicit: HashMap<String, Explicit> = HashMap::new();
        for mc in &config.monitors {
            let monitor = match self.create_path(&mc.name) {
                Ok(monitor) => monitor,
                Err(e) => {
                    status.fail(mc.name.as_str(), e);
                    continue;
                }
            };
            let entry = explicit.entry(monitor.name().to_string()).or_default();

            for bc in &mc.appenders {
                let Some(appender) = aliases.get(bc.appender.as_str()) else {
                    status.fail(
                        bc.appender.as_str(),
                        PerfMonError::UnknownAppender(bc.appender.clone()),
                    );
                    continue;
                };
                match inner.patterns.get_or_compile(monitor.name(), &bc.pattern) {
                    Ok(pattern) => entry.bindings.push(Binding {
                        appender: appender.clone(),
                        pattern,
                    }),
                    Err(e) => status.fail(format!("{}:{}", mc.name, bc.pattern), e),
                }
            }
            if let Some(thresholds) = &mc.threshold {
                match ThresholdCalculator::parse(thresholds) {
                    Ok(calc) => entry.threshold = Some(calc),
                    Err(e) => status.fail(mc.name.as_str(), e),
                }
            }
            if let Some(windows) = &mc.active_thread_monitor {
                match parse_duration_list(windows) {
                    Ok(windows) => entry.windows = Some(windows),
                    Err(e) => status.fail(mc.name.as_str(), e),
                }
            }
            if let Some(median) = &mc.median {
                entry.median = Some(MedianCalculator::new(median.max_elements, median.factor));
            }
        }

        // Walk the whole tree so inherited bindings and cascading settings
        // are recomputed everywhere, including for monitors no longer named
        let mut tasks: HashMap<u64, Vec<Arc<Monitor>>> = HashMap::new();
        let mut pending = vec![(inner.root.clone(), Vec::new(), MonitorSettings::default())];
        let mut monitors = 0usize;
        while let Some((monitor, mut bindings, mut settings)) = pending.pop() {
            if let Some(e) = explicit.get(monitor.name()) {
                bindings.extend(e.bindings.iter().cloned());
                if let Some(t) = &e.threshold {
                    settings.threshold = Some(t.clone());
                }
                if let Some(m) = &e.median {
                    settings.median = Some(m.clone());
                }
                if let Some(w) = &e.windows {
                    settings.active_windows = w.clone();
                }
            }

            monitor.set_bindings(bindings);
            let tracks = !settings.active_windows.is_empty();
            monitor.apply(settings.clone(), tracks, now_ms);
            for appender in monitor.bound_appenders() {
                tasks.entry(appender.key()).or_default().push(monitor.clone());
            }
            monitors += 1;

            for child in monitor.children() {
                let inherited = self.inherited_bindings(&monitor, &child);
                pending.push((child, inherited, settings.clone()));
            }
        }

        for handle in handles.values() {
            handle.set_tasks(tasks.remove(&handle.key()).unwrap_or_default());
        }
        for handle in &created {
            inner.scheduler.spawn_appender(handle);
        }

        // Thread traces
        let mut traces = Vec::new();
        for tc in &config.thread_traces {
            if let Err(e) = validate_name(&tc.monitor) {
                status.fail(tc.monitor.as_str(), e);
                continue;
            }
            let pattern = match inner.patterns.get_or_compile(&tc.monitor, &tc.pattern) {
                Ok(pattern) => pattern,
                Err(e) => {
                    status.fail(format!("{}:{}", tc.monitor, tc.pattern), e);
                    continue;
                }
            };
            let mut appenders = Vec::new();
            for alias in &tc.appenders {
                match aliases.get(alias.as_str()) {
                    Some(handle) => appenders.push(handle.clone()),
                    None => status.fail(alias.as_str(), PerfMonError::UnknownAppender(alias.clone())),
                }
            }
            traces.push(Arc::new(TraceBinding {
                pattern,
                max_depth: tc.max_depth,
                min_duration: tc.min_duration,
                appenders,
                triggers: tc.triggers.clone(),
            }));
        }

        for (id, handle) in active.appenders.iter() {
            if !handles.contains_key(id) {
                handle.shutdown();
            }
        }
        *active = ActiveConfig {
            appenders: handles,
            traces,
            sql_time: config.sql_time,
        };

        info!(
            monitors,
            appenders = active.appenders.len(),
            thread_traces = active.traces.len(),
            partial_load = status.partial_load,
            "Configuration applied"
        );
        status
    }

    /// Roll every appender's interval now and output on the calling thread.
    pub fn flush_now(&self) {
        let handles: Vec<Arc<AppenderHandle>> =
            self.inner.config.read().appenders.values().cloned().collect();
        let now_ms = current_timestamp_ms();
        for handle in handles {
            let batch = handle.roll(now_ms);
            handle.output(&batch);
        }
    }

    /// Traces dropped because the delivery queue was full.
    pub fn dropped_deliveries(&self) -> u64 {
        self.inner.scheduler.dropped()
    }

    /// Timer spans discarded from thread traces for being stopped out of
    /// nesting order.
    pub fn miss_nested_count(&self) -> u64 {
        self.inner.miss_nested.load(Ordering::Relaxed)
    }

    /// Deepest monitor on the path to `name`, creating children that some
    /// binding's pattern reaches when `dynamic` is set.
    fn resolve(&self, name: &str, dynamic: bool) -> Arc<Monitor> {
        let mut node = self.inner.root.clone();
        if name == ROOT_NAME {
            return node;
        }
        for segment in name.split('.') {
            let next = match node.child(segment) {
                Some(child) => child,
                None if dynamic && node.admits_child(segment) => {
                    self.create_child(&node, segment)
                }
                None => break,
            };
            node = next;
        }
        node
    }

    fn create_path(&self, name: &str) -> Result<Arc<Monitor>> {
        validate_name(name)?;
        let mut node = self.inner.root.clone();
        if name == ROOT_NAME {
            return Ok(node);
        }
        for segment in name.split('.') {
            let next = match node.child(segment) {
                Some(child) => child,
                None => self.create_child(&node, segment),
            };
            node = next;
        }
        Ok(node)
    }

    /// Create a child with the bindings and settings it inherits, then link
    /// it so other threads only ever see it fully configured.
    fn create_child(&self, parent: &Arc<Monitor>, simple_name: &str) -> Arc<Monitor> {
        let _arena = self.inner.arena.lock();
        if let Some(existing) = parent.child(simple_name) {
            return existing;
        }

        let child = Monitor::detached_child(parent, simple_name);
        child.set_bindings(self.inherited_bindings(parent, &child));
        let settings = parent.settings();
        let tracks = !settings.active_windows.is_empty();
        child.apply(settings, tracks, current_timestamp_ms());
        for appender in child.bound_appenders() {
            appender.attach(child.clone());
        }
        parent.link_child(child.clone());
        tracing::trace!(monitor = child.name(), active = child.is_active(), "Monitor created");
        child
    }

    /// Bindings of `parent` rewritten for `child`.
    fn inherited_bindings(&self, parent: &Monitor, child: &Monitor) -> Vec<Binding> {
        parent
            .bindings_snapshot()
            .into_iter()
            .filter_map(|b| {
                let pattern = b.pattern.child_pattern(child.simple_name())?;
                match self.inner.patterns.get_or_compile(child.name(), &pattern) {
                    Ok(compiled) => Some(Binding {
                        appender: b.appender,
                        pattern: compiled,
                    }),
                    Err(e) => {
                        warn!(monitor = child.name(), pattern = %pattern, error = %e, "Failed to inherit appender pattern");
                        None
                    }
                }
            })
            .collect()
    }

    fn create_appender(&self, id: &AppenderId) -> Result<Arc<AppenderHandle>> {
        let factory = self
            .inner
            .factories
            .get(&id.class)
            .ok_or_else(|| PerfMonError::UnknownAppenderClass(id.class.clone()))?;
        let sink = factory(id)?;
        let handle = Arc::new(AppenderHandle::new(id.clone(), sink)?);
        debug!(appender = %id, "Appender created");
        Ok(handle)
    }
}

/// Builder for a [`Registry`].
pub struct RegistryBuilder {
    factories: HashMap<String, AppenderFactory>,
    runtime: Option<Handle>,
    trace_queue_capacity: usize,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self {
            factories: builtin_factories()
                .into_iter()
                .map(|(class, factory)| (class.to_string(), factory))
                .collect(),
            runtime: None,
            trace_queue_capacity: DEFAULT_TRACE_QUEUE_CAPACITY,
        }
    }
}

impl fmt::Debug for RegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut classes: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        classes.sort_unstable();
        f.debug_struct("RegistryBuilder")
            .field("classes", &classes)
            .field("runtime", &self.runtime.is_some())
            .field("trace_queue_capacity", &self.trace_queue_capacity)
            .finish()
    }
}

impl RegistryBuilder {
    /// Register an appender class. Replaces any factory of the same name,
    /// built-in ones included.
    pub fn appender_class<F>(mut self, class: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&AppenderId) -> Result<Arc<dyn Appender>> + Send + Sync + 'static,
    {
        self.factories.insert(class.into(), Arc::new(factory));
        self
    }

    /// Schedule appenders on an existing runtime instead of starting one.
    pub fn runtime_handle(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Capacity of the queue between instrumented threads and trace output.
    pub fn trace_queue_capacity(mut self, capacity: usize) -> Self {
        self.trace_queue_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<Registry> {
        let scheduler = Scheduler::new(self.runtime, self.trace_queue_capacity)?;
        Ok(Registry {
            inner: Arc::new(RegistryInner {
                id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
                root: Monitor::new_root(),
                config: RwLock::new(ActiveConfig::default()),
                arena: Mutex::new(()),
                patterns: PatternCache::new(),
                factories: self.factories,
                scheduler,
                miss_nested: AtomicU64::new(0),
            }),
        })
    }
}
