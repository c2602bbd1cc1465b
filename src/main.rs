use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use perfmon_sdk::{parse_duration, Configuration, Registry};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod workload;

use workload::Workload;

#[derive(Parser, Debug)]
#[command(name = "perfmon")]
#[command(about = "Validate perfmon configurations and drive synthetic workloads through them")]
struct Args {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load a configuration file and report what could not be applied
    Check {
        /// Path to a TOML, JSON or YAML configuration
        config: PathBuf,
    },

    /// Run a synthetic multi-threaded workload under a configuration
    Run {
        /// Configuration to apply; a built-in demo configuration otherwise
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of worker threads
        #[arg(short, long, default_value = "4")]
        threads: usize,

        /// How long to run (e.g. "10 seconds", "1 minute")
        #[arg(short, long, default_value = "10 seconds")]
        duration: String,

        /// Print lifetime totals as JSON lines instead of a table
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs);

    match args.command {
        Command::Check { config } => check(&config),
        Command::Run {
            config,
            threads,
            duration,
            json,
        } => {
            let duration = parse_duration(&duration)
                .with_context(|| format!("Invalid --duration {duration:?}"))?;
            run(config.as_deref(), threads, duration, json)
        }
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load(path: &Path) -> Result<Configuration> {
    Configuration::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

/// Apply the configuration to a scratch registry and report the outcome.
fn check(path: &Path) -> Result<()> {
    let config = load(path)?;
    let registry = Registry::new()?;
    let status = registry.configure(&config);

    println!(
        "{}: {} appender(s), {} monitor(s), {} thread trace(s)",
        path.display(),
        config.appenders.len(),
        config.monitors.len(),
        config.thread_traces.len()
    );
    for name in registry.monitor_names() {
        println!("  monitor {name}");
    }

    if status.is_complete() {
        println!("OK");
        return Ok(());
    }
    for error in &status.errors {
        println!("  error: {error}");
    }
    anyhow::bail!(
        "Configuration partially loaded; unresolved: {}",
        status.unresolved.join(", ")
    )
}

fn run(path: Option<&Path>, threads: usize, duration: Duration, json: bool) -> Result<()> {
    let config = match path {
        Some(path) => load(path)?,
        None => workload::demo_configuration(),
    };

    let registry = Registry::new()?;
    let status = registry.configure(&config);
    if !status.is_complete() {
        warn!(unresolved = ?status.unresolved, "Running with a partial configuration");
    }

    info!(threads, duration = ?duration, "Starting synthetic workload");
    let workload = Workload::new(threads, duration);
    let completed = workload.run(&registry);
    registry.flush_now();
    info!(
        completed,
        dropped = registry.dropped_deliveries(),
        miss_nested = registry.miss_nested_count(),
        "Workload finished"
    );

    for name in registry.monitor_names() {
        let Some(monitor) = registry.monitor(&name) else {
            continue;
        };
        let lifetime = monitor.lifetime();
        if lifetime.total_completions == 0 {
            continue;
        }
        if json {
            println!("{}", serde_json::to_string(&lifetime)?);
        } else {
            println!(
                "{:<32} {:>8} completions {:>9.2} ms avg {:>9.2} ms stddev",
                name,
                lifetime.total_completions,
                lifetime.average_duration_ms(),
                lifetime.std_deviation_ms()
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn toml_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn check_accepts_complete_configuration() {
        let file = toml_file(
            r#"
[[appenders]]
name = "console"
class = "log"
interval = "5 seconds"

[[monitors]]
name = "svc"

[[monitors.appenders]]
appender = "console"
pattern = "./**"
"#,
        );
        check(file.path()).unwrap();
    }

    #[test]
    fn check_fails_on_unknown_appender_class() {
        let file = toml_file(
            r#"
[[appenders]]
name = "remote"
class = "carrier-pigeon"
interval = "5 seconds"

[[monitors]]
name = "svc"

[[monitors.appenders]]
appender = "remote"
pattern = "./"
"#,
        );
        let err = check(file.path()).unwrap_err();
        assert!(err.to_string().contains("partially loaded"), "{err}");
    }

    #[test]
    fn check_reports_missing_file() {
        let err = check(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to load configuration"), "{err}");
    }
}
