//! # perfmon-sdk
//!
//! In-process performance monitoring for Rust services.
//!
//! Application code wraps units of work in timers named by dotted monitor
//! names (`orders.submit`, `db.query.select`). The [`Registry`] keeps those
//! monitors in a tree, aggregates hits, completions, durations and
//! concurrency per monitor, and periodically hands [`IntervalData`]
//! snapshots to the appenders bound to it through patterns.
//!
//! ## Quick Start
//!
//! ```rust
//! use perfmon_sdk::{Configuration, Registry};
//! use std::time::Duration;
//!
//! let registry = Registry::new().unwrap();
//!
//! // Log every monitor under `orders` once a minute
//! registry.configure(
//!     &Configuration::builder()
//!         .appender("console", "log", Duration::from_secs(60))
//!         .monitor("orders", |m| m.appender("console", "./**").threshold("100 ms, 1 second"))
//!         .build(),
//! );
//!
//! let timer = registry.start("orders.submit");
//! // ... the work being measured ...
//! registry.stop(timer);
//!
//! let submit = registry.monitor("orders.submit").unwrap();
//! assert_eq!(submit.completions(), 1);
//! ```
//!
//! ## Features
//!
//! - **Pattern binding**: an appender applies to a monitor, its children,
//!   all its descendants, or segments matched by an enhanced glob
//! - **Bypass**: timers on unmonitored names resolve to the nearest active
//!   ancestor, or to a null timer that records nothing
//! - **Calculators**: bounded approximate medians and threshold counters
//! - **Thread traces**: capture the tree of timers one thread runs,
//!   triggered by thread name, thread properties or sampling
//! - **Non-blocking output**: appenders run on a background runtime; the
//!   instrumented thread never waits for them

pub mod appender;
pub mod calc;
mod config;
mod duration;
mod error;
mod monitor;
pub mod pattern;
mod registry;
mod scheduler;
pub mod sql;
mod timer;
pub mod trace;
mod tracker;

pub use appender::{
    Appender, AppenderFactory, AppenderId, AppenderOutput, ChannelAppender, JsonFileAppender,
    LogAppender,
};
pub use calc::{MedianCalculator, ThresholdCalculator};
pub use config::{
    AppenderConfig, BindingConfig, Configuration, ConfigurationBuilder, MedianConfig,
    MonitorConfig, MonitorConfigBuilder, ThreadTraceConfig, ThreadTraceConfigBuilder,
};
pub use duration::{parse_duration, parse_duration_list};
pub use error::{PerfMonError, Result};
pub use monitor::{BindingInfo, Monitor, ROOT_NAME};
pub use pattern::{rewrite_for_child, CompiledPattern};
pub use registry::{ConfigureStatus, Registry, RegistryBuilder};
pub use scheduler::DEFAULT_TRACE_QUEUE_CAPACITY;
pub use timer::{Timer, TimerGuard, TimerState};
pub use trace::{PropertyKind, Trigger};
pub use tracker::{ThreadTracker, TrackedThread, TrackerToken};

// Re-export types for convenience
pub use perfmon_types::{
    ActiveThreadStatus, IntervalData, MedianResult, Microseconds, OverflowFlag, ThreadTraceData,
    ThresholdResult,
};
