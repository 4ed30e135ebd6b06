//! timeguard-agent: remote-controlled screen time enforcement
//!
//! Runs the command server and the enforcement monitor on a monitored machine.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use timeguard_agent::config::AgentConfig;
use timeguard_agent::daemon::{AgentServer, CommandProcessor, ServerConfig, ServerError};
use timeguard_agent::logging::{self, LogConfig};
use timeguard_agent::metrics::MetricsCollector;
use timeguard_agent::monitor::{EnforcementMonitor, MonitorConfig};
use timeguard_agent::session::{DryRunSession, SessionControl, SystemSession};
use timeguard_agent::state::EnforcementState;

#[derive(Parser)]
#[command(name = "timeguard-agent")]
#[command(about = "Screen time agent: accepts controller commands and enforces limits")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.config/timeguard/agent.yaml, then env)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent (default)
    Serve {
        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        bind: Option<IpAddr>,

        /// Idle seconds before a keepalive is sent
        #[arg(long)]
        idle_timeout: Option<u64>,

        /// Also write logs to this file
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// Log session actions instead of performing them
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the effective configuration as YAML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AgentConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => AgentConfig::load().context("Failed to load config")?,
    };

    match cli.command.unwrap_or(Commands::Serve {
        port: None,
        bind: None,
        idle_timeout: None,
        log_file: None,
        dry_run: false,
    }) {
        Commands::Serve {
            port,
            bind,
            idle_timeout,
            log_file,
            dry_run,
        } => {
            let mut config = config;
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(bind) = bind {
                config.bind = bind;
            }
            if let Some(idle) = idle_timeout {
                config.idle_timeout_secs = idle;
            }
            if log_file.is_some() {
                config.log_file = log_file;
            }
            config.validate()?;
            run_serve(config, dry_run).await
        }

        Commands::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}

/// Run the agent until Ctrl+C
async fn run_serve(config: AgentConfig, dry_run: bool) -> anyhow::Result<()> {
    let _log_guard = logging::init(&LogConfig {
        file: config.log_file.clone(),
    })?;

    let session: Arc<dyn SessionControl> = if dry_run {
        info!("Dry run: session actions are only logged");
        Arc::new(DryRunSession::for_local_host())
    } else {
        Arc::new(SystemSession::new())
    };

    let state = Arc::new(RwLock::new(EnforcementState::new()));
    let metrics = Arc::new(MetricsCollector::new());
    let processor = Arc::new(CommandProcessor::new(
        Arc::clone(&state),
        Arc::clone(&session),
        Arc::clone(&metrics),
        config.enforcement.shutdown_delay(),
    ));

    let server = AgentServer::new(ServerConfig::from(&config), processor);
    let handle = match server.start().await {
        Ok(handle) => handle,
        Err(e @ ServerError::Bind { .. }) => {
            error!(error = %e, "Cannot start command server");
            let notice = format!(
                "Port {} is already in use or blocked!\nCheck your firewall or other running applications.",
                config.port
            );
            if let Err(popup) = session.show_message("Network Error", &notice) {
                error!(error = %popup, "Could not show startup error");
            }
            return Err(e.into());
        }
    };

    let monitor = Arc::new(EnforcementMonitor::new(
        state,
        session,
        metrics,
        MonitorConfig::from(&config.enforcement),
    ));
    let monitor_cancel = CancellationToken::new();
    let monitor_tasks = monitor.spawn(monitor_cancel.clone());

    println!("timeguard-agent listening on {}", handle.local_addr());
    println!("Press Ctrl+C to stop");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            info!("Shutting down");
        }
        _ = handle.stopped() => {}
    }

    handle.stop().await;
    monitor_cancel.cancel();
    for task in monitor_tasks {
        let _ = task.await;
    }

    info!("Agent stopped");
    Ok(())
}
