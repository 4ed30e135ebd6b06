//! timeguard: operator console for timeguard agents

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use timeguard_controller::config::ControllerConfig;
use timeguard_controller::directory::DirectorySnapshot;
use timeguard_controller::{api, Action, CommandOutcome, Controller};

#[derive(Parser)]
#[command(name = "timeguard")]
#[command(about = "Find timeguard agents on the LAN and send them commands")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.config/timeguard/controller.yaml, then env)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Agent port
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan the local /24 for agents
    Scan,

    /// Send a raw command line, e.g. `SET_LIMIT:90`
    Send { ip: IpAddr, command: String },

    /// Query whether an agent's session is locked
    Status { ip: IpAddr },

    /// Send an operator action
    Action {
        ip: IpAddr,
        #[command(subcommand)]
        action: Action,
    },

    /// Run the dashboard JSON API
    Serve {
        /// Address to listen on
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "timeguard_controller=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ControllerConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => ControllerConfig::load().context("Failed to load config")?,
    };
    if let Some(port) = cli.port {
        config.port = port;
    }

    match cli.command {
        Commands::Scan => {
            let controller = Controller::new(&config);
            print_directory(&*controller.scan().await);
            Ok(())
        }

        Commands::Send { ip, command } => {
            let controller = Controller::new(&config);
            report(controller.send_command(ip, &command).await)
        }

        Commands::Status { ip } => {
            let controller = Controller::new(&config);
            report(controller.query_status(ip).await)
        }

        Commands::Action { ip, action } => {
            let controller = Controller::new(&config);
            report(controller.perform(ip, &action).await)
        }

        Commands::Serve { listen } => {
            let listen = listen.unwrap_or(config.listen);
            let controller = Arc::new(Controller::new(&config));

            let listener = tokio::net::TcpListener::bind(listen)
                .await
                .with_context(|| format!("Failed to bind {}", listen))?;

            let initial = controller.scan().await;
            info!(agents = initial.len(), "Initial scan complete");

            println!("Dashboard API on http://{}", listen);
            tokio::select! {
                result = api::serve(listener, controller) => result.context("API server failed")?,
                signal = tokio::signal::ctrl_c() => {
                    signal.context("Failed to listen for Ctrl+C")?;
                    info!("Shutting down");
                }
            }
            Ok(())
        }
    }
}

fn print_directory(snapshot: &DirectorySnapshot) {
    if snapshot.is_empty() {
        println!("No agents found");
        return;
    }
    println!("{:<16} {:<9} NAME", "ADDRESS", "STATUS");
    for agent in snapshot.agents.values() {
        let status = if agent.locked { "locked" } else { "-" };
        println!("{:<16} {:<9} {}", agent.address, status, agent.display_name);
    }
}

fn report(outcome: CommandOutcome) -> anyhow::Result<()> {
    if outcome.success {
        println!("{}", outcome.response);
        Ok(())
    } else {
        anyhow::bail!("{}", outcome.response)
    }
}
