//! The configuration snapshot consumed by [`Registry::configure`].
//!
//! A configuration is supplied wholesale: every call replaces the previous
//! one. It can be loaded from a file (TOML, JSON or YAML) or built in code:
//!
//! ```rust
//! use perfmon_sdk::{Configuration, Trigger};
//! use std::time::Duration;
//!
//! let config = Configuration::builder()
//!     .appender("five-minute", "log", Duration::from_secs(300))
//!     .monitor("WebRequest", |m| {
//!         m.appender("five-minute", "./**")
//!             .threshold("1 second, 5 seconds")
//!             .active_thread_monitor("1 minute")
//!     })
//!     .thread_trace("WebRequest.checkout", |t| {
//!         t.appender("five-minute")
//!             .max_depth(10)
//!             .trigger(Trigger::Random { factor: 100 })
//!     })
//!     .build();
//!
//! assert_eq!(config.monitors.len(), 1);
//! ```
//!
//! [`Registry::configure`]: crate::Registry::configure

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::duration::serde_duration;
use crate::error::Result;
use crate::pattern::PARENT_ONLY;
use crate::trace::Trigger;

/// Prefix for environment overrides, e.g. `PERFMON__SQL_TIME=true`.
pub const ENV_PREFIX: &str = "PERFMON";

const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

fn default_pattern() -> String {
    PARENT_ONLY.to_string()
}

fn default_interval() -> Duration {
    DEFAULT_INTERVAL
}

/// A complete configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub appenders: Vec<AppenderConfig>,
    pub monitors: Vec<MonitorConfig>,
    pub thread_traces: Vec<ThreadTraceConfig>,
    /// Aggregate SQL time alongside wall time.
    pub sql_time: bool,
}

/// An appender definition. `name` is the alias bindings refer to; identity
/// is `(class, interval, attributes)`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AppenderConfig {
    pub name: String,
    pub class: String,
    #[serde(default = "default_interval", deserialize_with = "serde_duration::deserialize")]
    pub interval: Duration,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// A monitor and the appenders bound to it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MonitorConfig {
    pub name: String,
    #[serde(default)]
    pub appenders: Vec<BindingConfig>,
    /// Threshold list such as `"1 second, 2 seconds"`.
    #[serde(default)]
    pub threshold: Option<String>,
    /// Active-thread window list such as `"1 minute, 5 minutes"`.
    #[serde(default)]
    pub active_thread_monitor: Option<String>,
    #[serde(default)]
    pub median: Option<MedianConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BindingConfig {
    pub appender: String,
    #[serde(default = "default_pattern")]
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MedianConfig {
    #[serde(default = "default_max_elements")]
    pub max_elements: usize,
    #[serde(default = "default_factor")]
    pub factor: f64,
}

fn default_max_elements() -> usize {
    crate::calc::DEFAULT_MAX_ELEMENTS
}

fn default_factor() -> f64 {
    crate::calc::DEFAULT_FACTOR
}

impl Default for MedianConfig {
    fn default() -> Self {
        Self {
            max_elements: default_max_elements(),
            factor: default_factor(),
        }
    }
}

/// Thread trace capture rooted at a monitor.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ThreadTraceConfig {
    pub monitor: String,
    /// Which monitors at or below `monitor` start a trace.
    #[serde(default = "default_pattern")]
    pub pattern: String,
    /// Deepest nesting level captured; `0` captures everything.
    #[serde(default)]
    pub max_depth: usize,
    /// Spans shorter than this are pruned from the delivered trace.
    #[serde(default, deserialize_with = "serde_duration::deserialize")]
    pub min_duration: Duration,
    #[serde(default)]
    pub appenders: Vec<String>,
    /// Any trigger matching starts a trace; no triggers means always.
    #[serde(default)]
    pub triggers: Vec<Trigger>,
}

impl Configuration {
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder::default()
    }

    /// Load from a file, layered with `PERFMON__`-prefixed environment
    /// variables.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn appender(&self, name: &str) -> Option<&AppenderConfig> {
        self.appenders.iter().find(|a| a.name == name)
    }

    pub fn monitor(&self, name: &str) -> Option<&MonitorConfig> {
        self.monitors.iter().find(|m| m.name == name)
    }
}

#[derive(Debug, Default)]
pub struct ConfigurationBuilder {
    config: Configuration,
}

impl ConfigurationBuilder {
    /// Define an appender with no attributes.
    pub fn appender(self, name: impl Into<String>, class: impl Into<String>, interval: Duration) -> Self {
        self.appender_with(name, class, interval, std::iter::empty::<(String, String)>())
    }

    /// Define an appender with attributes.
    pub fn appender_with<K, V>(
        mut self,
        name: impl Into<String>,
        class: impl Into<String>,
        interval: Duration,
        attributes: impl IntoIterator<Item = (K, V)>,
    ) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.config.appenders.push(AppenderConfig {
            name: name.into(),
            class: class.into(),
            interval,
            attributes: attributes
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        });
        self
    }

    /// Add a monitor configured with a closure.
    pub fn monitor<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(MonitorConfigBuilder) -> MonitorConfigBuilder,
    {
        let builder = f(MonitorConfigBuilder::new(name.into()));
        self.config.monitors.push(builder.config);
        self
    }

    /// Add a thread trace configured with a closure.
    pub fn thread_trace<F>(mut self, monitor: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(ThreadTraceConfigBuilder) -> ThreadTraceConfigBuilder,
    {
        let builder = f(ThreadTraceConfigBuilder::new(monitor.into()));
        self.config.thread_traces.push(builder.config);
        self
    }

    pub fn sql_time(mut self, enabled: bool) -> Self {
        self.config.sql_time = enabled;
        self
    }

    pub fn build(self) -> Configuration {
        self.config
    }
}

#[derive(Debug)]
pub struct MonitorConfigBuilder {
    config: MonitorConfig,
}

impl MonitorConfigBuilder {
    fn new(name: String) -> Self {
        Self {
            config: MonitorConfig {
                name,
                appenders: Vec::new(),
                threshold: None,
                active_thread_monitor: None,
                median: None,
            },
        }
    }

    /// Bind an appender alias with a pattern.
    pub fn appender(mut self, appender: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.config.appenders.push(BindingConfig {
            appender: appender.into(),
            pattern: pattern.into(),
        });
        self
    }

    pub fn threshold(mut self, thresholds: impl Into<String>) -> Self {
        self.config.threshold = Some(thresholds.into());
        self
    }

    pub fn active_thread_monitor(mut self, windows: impl Into<String>) -> Self {
        self.config.active_thread_monitor = Some(windows.into());
        self
    }

    pub fn median(mut self, max_elements: usize, factor: f64) -> Self {
        self.config.median = Some(MedianConfig {
            max_elements,
            factor,
        });
        self
    }
}

#[derive(Debug)]
pub struct ThreadTraceConfigBuilder {
    config: ThreadTraceConfig,
}

impl ThreadTraceConfigBuilder {
    fn new(monitor: String) -> Self {
        Self {
            config: ThreadTraceConfig {
                monitor,
                pattern: default_pattern(),
                max_depth: 0,
                min_duration: Duration::ZERO,
                appenders: Vec::new(),
                triggers: Vec::new(),
            },
        }
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.config.pattern = pattern.into();
        self
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.config.max_depth = depth;
        self
    }

    pub fn min_duration(mut self, duration: Duration) -> Self {
        self.config.min_duration = duration;
        self
    }

    pub fn appender(mut self, appender: impl Into<String>) -> Self {
        self.config.appenders.push(appender.into());
        self
    }

    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.config.triggers.push(trigger);
        self
    }
}
