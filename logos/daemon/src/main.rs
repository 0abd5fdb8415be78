//! Logos Daemon - Scheduling Engine Host
//!
//! Loads configuration, wires the scheduling engine to its providers and
//! keeps the background loops (scheduling, Ollama telemetry, temp provider
//! health) running until a shutdown signal arrives.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (~/.config/logos/config.toml if present)
//! logos-daemon
//!
//! # Custom config file
//! logos-daemon --config /etc/logos/config.toml
//!
//! # First-come-first-served scheduling, JSON logs
//! logos-daemon --scheduler fcfs --log-format json
//!
//! # Verbose logging
//! RUST_LOG=debug logos-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod engine;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use logos_core::config::{default_config_path, load_config_from_path};
use logos_core::{ConfigOverrides, LogosConfig, SchedulerKind};

use engine::Engine;

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Logos Daemon - policy-aware LLM request scheduler
#[derive(Parser, Debug)]
#[command(name = "logos-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "LOGOS_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Scheduling strategy (fcfs, priority)
    #[arg(short = 's', long, value_name = "KIND")]
    scheduler: Option<SchedulerKind>,

    /// Scheduling loop poll interval in milliseconds
    #[arg(long, value_name = "MS")]
    poll_interval_ms: Option<u64>,

    /// Seconds between metrics summary lines (0 disables)
    #[arg(long, env = "LOGOS_METRICS_INTERVAL", default_value_t = 60)]
    metrics_interval_secs: u64,

    /// Log format
    #[arg(long, env = "LOGOS_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "LOGOS_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(kind) = self.scheduler {
            overrides = overrides.with_scheduler(kind);
        }
        if let Some(ms) = self.poll_interval_ms {
            overrides = overrides.with_poll_interval(Duration::from_millis(ms));
        }
        overrides
    }
}

/// Initialize logging with the specified level and format
fn init_logging(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("logos_daemon={level},logos_core={level}")));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.with_file(true).with_line_number(true).init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Resolve the configuration: file, then environment, then CLI
fn resolve_config(args: &Args) -> Result<LogosConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path.as_deref())
        .with_context(|| format!("Failed to load configuration from {path:?}"))?;
    args.overrides().apply(&mut config);
    Ok(config)
}

/// Wait for SIGTERM or SIGINT
async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
        _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level, args.log_format);

    info!("Logos Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let config = resolve_config(&args)?;
    info!(
        source = %config.source,
        config_path = ?config.config_file_path,
        scheduler = %config.scheduler.kind,
        "Configuration resolved"
    );

    let mut engine = Engine::build(&config)?;
    engine.start()?;
    if args.metrics_interval_secs > 0 {
        engine.spawn_metrics_log(Duration::from_secs(args.metrics_interval_secs));
    }

    let result = wait_for_shutdown().await;

    info!("Shutting down...");
    engine.shutdown().await?;

    match result {
        Ok(()) => {
            info!("Logos daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logos_core::ConfigSource;
    use std::io::Write;

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["logos-daemon", "--scheduler", "fcfs", "--log-format", "json"]).unwrap();
        assert_eq!(args.scheduler, Some(SchedulerKind::Fcfs));
        assert_eq!(args.log_format, LogFormat::Json);
        assert!(Args::try_parse_from(["logos-daemon", "--scheduler", "lottery"]).is_err());
    }

    #[test]
    fn test_cli_beats_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[scheduler]\nkind = \"priority\"\npoll_interval_ms = 250").unwrap();

        let path = file.path().to_string_lossy().to_string();
        let args = Args::try_parse_from(["logos-daemon", "--config", &path, "--scheduler", "fcfs"]).unwrap();
        let config = resolve_config(&args).unwrap();

        assert_eq!(config.scheduler.kind, SchedulerKind::Fcfs);
        assert_eq!(config.scheduler.poll_interval_ms, 250);
        assert_eq!(config.source, ConfigSource::Cli);
    }
}
