//! tunwatchd: the tunwatch daemon.
//!
//! Single binary that assembles the tunnel health subsystems:
//! - State store (redb)
//! - HTTP tunnel probe
//! - Single-flight check scheduler
//! - Periodic tunnel monitor
//!
//! # Usage
//!
//! ```text
//! tunwatchd watch --url https://abc123.ngrok.io --data-dir /var/lib/tunwatch
//! tunwatchd check --url https://abc123.ngrok.io
//! tunwatchd status --data-dir /var/lib/tunwatch
//! ```
//!
//! While `watch` runs, `SIGUSR1` forces an immediate check.

mod config;
mod report;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use tunwatch_health::{CheckOutcome, HttpProbe, Scheduler, TunnelMonitor};
use tunwatch_state::StateStore;

use crate::config::TunwatchConfig;

const DEFAULT_LOG_FILTER: &str = "info,tunwatchd=debug,tunwatch_health=debug";

#[derive(Parser)]
#[command(name = "tunwatchd", about = "Tunnel health monitor")]
struct Cli {
    /// Path to tunwatch.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch a tunnel until Ctrl-C, checking it on every tick.
    Watch {
        /// Public tunnel URL. Overrides `tunnel.public_url`.
        #[arg(long)]
        url: Option<String>,

        /// Tunnel name in the state store. Overrides `tunnel.name`.
        #[arg(long)]
        name: Option<String>,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/tunwatch")]
        data_dir: PathBuf,

        /// Tick interval (e.g. "10s"). Overrides `schedule.tick`.
        #[arg(long)]
        tick: Option<String>,
    },

    /// Check a tunnel once and print the outcome as JSON.
    Check {
        /// Public tunnel URL. Overrides `tunnel.public_url`.
        #[arg(long)]
        url: Option<String>,

        /// Probe timeout (e.g. "5s"). Overrides `probe.timeout`.
        #[arg(long)]
        timeout: Option<String>,
    },

    /// Print the stored state of a tunnel as JSON.
    Status {
        /// Tunnel name in the state store. Overrides `tunnel.name`.
        #[arg(long)]
        name: Option<String>,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/tunwatch")]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = TunwatchConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Watch {
            url,
            name,
            data_dir,
            tick,
        } => {
            if let Some(name) = name {
                config.tunnel.name = name;
            }
            if let Some(tick) = tick {
                config.schedule.tick = tick;
            }
            run_watch(config, url, data_dir).await
        }
        Command::Check { url, timeout } => {
            if let Some(timeout) = timeout {
                config.probe.timeout = timeout;
            }
            run_check(config, url).await
        }
        Command::Status { name, data_dir } => {
            if let Some(name) = name {
                config.tunnel.name = name;
            }
            print_status(&config, data_dir)
        }
    }
}

/// Logs go to stderr so `check` and `status` output stays parseable.
fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let log_layer = match std::env::var("RUST_LOG_FORMAT").as_deref() {
        Ok("json") => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
            .boxed(),
        _ => tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry().with(log_layer).init();
}

async fn run_watch(
    config: TunwatchConfig,
    url: Option<String>,
    data_dir: PathBuf,
) -> anyhow::Result<()> {
    let name = config.tunnel.name.clone();
    info!(tunnel = %name, "tunwatch daemon starting");

    // Ensure data directory exists.
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;
    let db_path = data_dir.join("tunwatch.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    if let Some(url) = url.or_else(|| config.tunnel.public_url.clone()) {
        state.set_public_url(&name, &url)?;
        info!(tunnel = %name, %url, "tunnel url set");
    }

    let probe = Arc::new(HttpProbe::new(config.probe_timeout()?)?);
    let scheduler = Scheduler::new(name.clone(), state.clone(), probe)
        .with_thresholds(config.thresholds()?);

    let (on_success, on_error) = report::status_hooks(state.clone(), name.clone());
    let monitor = TunnelMonitor::new(scheduler, config.tick()?).with_callbacks(on_success, on_error);

    // ── Run until shutdown ─────────────────────────────────────

    monitor.start().await;
    wait_for_shutdown(&monitor).await?;
    info!("shutdown signal received");
    monitor.stop().await;

    info!("tunwatch daemon stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown(monitor: &TunnelMonitor) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut check_now = signal(SignalKind::user_defined1())?;
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => return Ok(res?),
            _ = check_now.recv() => {
                info!("forced tunnel check requested");
                // The run reports through the monitor's callbacks.
                let _ = monitor.check_now().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_monitor: &TunnelMonitor) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

async fn run_check(config: TunwatchConfig, url: Option<String>) -> anyhow::Result<()> {
    let name = config.tunnel.name.clone();
    let state = StateStore::open_in_memory()?;
    if let Some(url) = url.or_else(|| config.tunnel.public_url.clone()) {
        state.set_public_url(&name, &url)?;
    }

    let probe = Arc::new(HttpProbe::new(config.probe_timeout()?)?);
    let scheduler = Scheduler::new(name, state, probe);
    let outcome = scheduler.check(true).await?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);

    match &outcome {
        CheckOutcome::Probed(probe) if probe.is_healthy() => Ok(()),
        other => match other.response_info() {
            Some(info) => bail!("tunnel unhealthy: {}", info.describe()),
            None => bail!("tunnel was not probed"),
        },
    }
}

fn print_status(config: &TunwatchConfig, data_dir: PathBuf) -> anyhow::Result<()> {
    let db_path = data_dir.join("tunwatch.redb");
    if !db_path.exists() {
        bail!("no state store at {}", db_path.display());
    }
    let state = StateStore::open(&db_path)?;
    let tunnel = state.tunnel_or_default(&config.tunnel.name)?;
    println!("{}", serde_json::to_string_pretty(&tunnel)?);
    Ok(())
}
