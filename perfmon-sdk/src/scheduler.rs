//! Background scheduling and delivery.
//!
//! Each appender identity gets one task that ticks at the appender's
//! interval, rolls the intervals of the monitors feeding it and hands the
//! batch to the sink on the blocking pool. Completed thread traces go
//! through a bounded queue to a single delivery task. Nothing here runs on
//! the instrumented thread except the non-blocking enqueue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use perfmon_types::{current_timestamp_ms, ThreadTraceData};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::appender::AppenderHandle;
use crate::error::Result;

/// Default capacity of the trace delivery queue.
pub const DEFAULT_TRACE_QUEUE_CAPACITY: usize = 1024;

struct TraceDelivery {
    appenders: Vec<Arc<AppenderHandle>>,
    trace: ThreadTraceData,
}

pub(crate) struct Scheduler {
    runtime: Option<Runtime>,
    handle: Handle,
    trace_tx: mpsc::Sender<TraceDelivery>,
    dropped: AtomicU64,
}

impl Scheduler {
    /// Run on `handle` when given, otherwise on a small runtime of our own.
    pub fn new(handle: Option<Handle>, trace_capacity: usize) -> Result<Self> {
        let (runtime, handle) = match handle {
            Some(handle) => (None, handle),
            None => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .thread_name("perfmon-scheduler")
                    .enable_time()
                    .build()?;
                let handle = runtime.handle().clone();
                (Some(runtime), handle)
            }
        };

        let (trace_tx, trace_rx) = mpsc::channel(trace_capacity.max(1));
        handle.spawn(deliver_traces(trace_rx));

        Ok(Self {
            runtime,
            handle,
            trace_tx,
            dropped: AtomicU64::new(0),
        })
    }

    /// Start the periodic task of a new appender. The task holds the
    /// appender weakly and ends when it is shut down or dropped.
    pub fn spawn_appender(&self, appender: &Arc<AppenderHandle>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = self.handle.spawn(run_appender(
            Arc::downgrade(appender),
            appender.interval(),
            stop_rx,
        ));
        appender.set_schedule(stop_tx, task);
        debug!(appender = %appender.id(), "Appender scheduled");
    }

    /// Queue a completed trace for delivery. Never blocks: when the queue is
    /// full the trace is dropped and counted.
    pub fn deliver_trace(&self, appenders: Vec<Arc<AppenderHandle>>, trace: ThreadTraceData) {
        if appenders.is_empty() {
            return;
        }
        match self.trace_tx.try_send(TraceDelivery { appenders, trace }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(delivery)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(trace = %delivery.trace.name, dropped, "Trace delivery queue full, dropping trace");
            }
            Err(mpsc::error::TrySendError::Closed(delivery)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(trace = %delivery.trace.name, "Trace delivery stopped, dropping trace");
            }
        }
    }

    /// Deliveries dropped because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn run_appender(
    appender: Weak<AppenderHandle>,
    period: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(appender) = appender.upgrade() else {
                    break;
                };
                let batch = appender.roll(current_timestamp_ms());
                if batch.is_empty() {
                    continue;
                }
                let id = appender.id().to_string();
                let output = tokio::task::spawn_blocking(move || appender.output(&batch));
                if let Err(e) = output.await {
                    error!(appender = %id, error = %e, "Appender output panicked");
                }
            }
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
        }
    }
}

async fn deliver_traces(mut trace_rx: mpsc::Receiver<TraceDelivery>) {
    while let Some(delivery) = trace_rx.recv().await {
        let name = delivery.trace.name.clone();
        let output = tokio::task::spawn_blocking(move || {
            for appender in &delivery.appenders {
                appender.output_trace(&delivery.trace);
            }
        });
        if let Err(e) = output.await {
            error!(trace = %name, error = %e, "Trace output panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appender::{AppenderId, AppenderOutput, ChannelAppender};
    use crate::monitor::{Binding, Monitor, MonitorSettings};
    use crate::pattern::CompiledPattern;
    use std::collections::BTreeMap;

    fn channel_handle(
        interval: Duration,
    ) -> (Arc<AppenderHandle>, mpsc::Receiver<AppenderOutput>) {
        let (sink, rx) = ChannelAppender::new(16);
        let id = AppenderId::new("channel", interval, BTreeMap::new());
        (Arc::new(AppenderHandle::new(id, Arc::new(sink)).unwrap()), rx)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn appender_task_rolls_bound_monitors() {
        let scheduler = Scheduler::new(Some(Handle::current()), 4).unwrap();
        let (appender, mut rx) = channel_handle(Duration::from_millis(20));

        let root = Monitor::new_root();
        let m = Monitor::new_child(&root, "m");
        m.set_bindings(vec![Binding {
            appender: appender.clone(),
            pattern: Arc::new(CompiledPattern::compile("m", "./").unwrap()),
        }]);
        m.apply(MonitorSettings::default(), false, current_timestamp_ms());
        appender.set_tasks(vec![m.clone()]);

        let token = m.record_start(current_timestamp_ms());
        m.record_stop(Duration::from_millis(3), None, current_timestamp_ms(), token);
        scheduler.spawn_appender(&appender);

        let received = time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match received {
            AppenderOutput::Interval(data) => {
                assert_eq!(data.monitor, "m");
                assert_eq!(data.total_completions, 1);
            }
            other => panic!("unexpected output {other:?}"),
        }

        appender.shutdown();
        assert!(appender.is_stopped());
    }

    #[tokio::test]
    async fn full_trace_queue_drops_newest() {
        let scheduler = Scheduler::new(Some(Handle::current()), 1).unwrap();
        let (appender, _rx) = channel_handle(Duration::from_secs(60));

        // The delivery task cannot run before the test yields
        for i in 0..4 {
            scheduler.deliver_trace(
                vec![appender.clone()],
                ThreadTraceData::open(format!("t{i}"), 0),
            );
        }
        assert_eq!(scheduler.dropped(), 3);
    }

    #[test]
    fn traces_without_appenders_are_ignored() {
        let scheduler = Scheduler::new(None, 1).unwrap();
        scheduler.deliver_trace(Vec::new(), ThreadTraceData::open("t", 0));
        assert_eq!(scheduler.dropped(), 0);
    }
}
