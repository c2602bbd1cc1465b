//! Synthetic multi-threaded workload.
//!
//! Each worker loops over a small set of nested operations under `demo`
//! until the deadline, sleeping to simulate work and SQL time.

use std::thread;
use std::time::{Duration, Instant};

use perfmon_sdk::trace::{push_property, PropertyKind};
use perfmon_sdk::{sql, Configuration, Registry, Trigger};
use rand::Rng;
use tracing::debug;

const OPERATIONS: &[&str] = &["demo.orders.submit", "demo.orders.query", "demo.catalog.browse"];
const QUERY: &str = "demo.db.select";

/// Logs every monitor under `demo` every five seconds and samples traces of
/// order handling.
pub fn demo_configuration() -> Configuration {
    Configuration::builder()
        .appender("console", "log", Duration::from_secs(5))
        .monitor("demo", |m| {
            m.appender("console", "./**")
                .threshold("2 ms, 5 ms")
                .active_thread_monitor("1 second")
        })
        .thread_trace("demo.orders", |t| {
            t.pattern("./**")
                .appender("console")
                .trigger(Trigger::SessionAttribute {
                    name: "user".to_string(),
                    value: "worker-0".to_string(),
                })
                .trigger(Trigger::Random { factor: 50 })
        })
        .sql_time(true)
        .build()
}

#[derive(Debug, Clone)]
pub struct Workload {
    threads: usize,
    duration: Duration,
}

impl Workload {
    pub fn new(threads: usize, duration: Duration) -> Self {
        Self {
            threads: threads.max(1),
            duration,
        }
    }

    /// Run to completion and return the number of top-level operations.
    pub fn run(&self, registry: &Registry) -> u64 {
        let deadline = Instant::now() + self.duration;
        let workers: Vec<_> = (0..self.threads)
            .map(|id| {
                let registry = registry.clone();
                thread::Builder::new()
                    .name(format!("worker-{id}"))
                    .spawn(move || worker(&registry, id, deadline))
            })
            .collect();

        workers
            .into_iter()
            .filter_map(|spawned| spawned.ok())
            .filter_map(|handle| handle.join().ok())
            .sum()
    }
}

fn worker(registry: &Registry, id: usize, deadline: Instant) -> u64 {
    let _user = push_property(PropertyKind::SessionAttribute, "user", format!("worker-{id}"));
    let mut rng = rand::thread_rng();
    let mut completed = 0;

    while Instant::now() < deadline {
        let name = OPERATIONS[rng.gen_range(0..OPERATIONS.len())];
        let timer = registry.start(name);
        thread::sleep(Duration::from_micros(rng.gen_range(200..2_000)));

        for _ in 0..rng.gen_range(0..3) {
            let _query = registry.scope(QUERY);
            let sql_time = Duration::from_micros(rng.gen_range(100..1_500));
            thread::sleep(sql_time);
            sql::record(sql_time);
        }

        if rng.gen_range(0..20) == 0 {
            registry.abort(timer);
        } else {
            registry.stop(timer);
            completed += 1;
        }
    }

    debug!(worker = id, completed, "Worker finished");
    completed
}
