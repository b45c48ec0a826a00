//! fleetwatch agent: serves host snapshots to authenticated hubs.

use fleetwatch::agent::{health, listen_address, AgentConfig, AgentFlags, AgentServer};
use fleetwatch::collector::{Collector, DockerClient, SysinfoProbe};
use fleetwatch::config::{EnvResolver, AGENT_ENV_PREFIX};
use fleetwatch::transport::{Listener, Network};

use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "fleetwatch-agent", version, about = "fleetwatch monitoring agent")]
struct Cli {
    /// Public key(s) of hubs allowed to connect
    #[arg(short, long)]
    key: Option<String>,

    /// Address or port to listen on
    #[arg(short, long)]
    listen: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Exit 0 if the agent's listen address accepts connections
    Health,
    /// Print the version and exit
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    let env = EnvResolver::new(AGENT_ENV_PREFIX);

    let level = env
        .resolve("LOG_LEVEL", None)
        .map(|r| r.value.to_ascii_lowercase())
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(format!("fleetwatch={}", level).parse()?))
        .init();

    let flags = AgentFlags {
        key: cli.key,
        listen: cli.listen,
    };

    match cli.command {
        Some(Command::Version) => {
            println!("fleetwatch-agent {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some(Command::Health) => {
            let addr = listen_address(&env, flags.listen.as_deref());
            let network = env
                .resolve("NETWORK", None)
                .and_then(|r| r.value.parse::<Network>().ok())
                .unwrap_or_else(|| Network::detect(&addr));
            std::process::exit(health(network, &addr).await);
        }
        None => {}
    }

    let cfg = AgentConfig::load_from(&env, &flags)?;
    tracing::info!(
        "Starting fleetwatch agent {} ({} authorized keys)",
        env!("CARGO_PKG_VERSION"),
        cfg.keys.len()
    );

    let docker = DockerClient::from_host(cfg.docker_host.as_deref());
    if docker.is_none() {
        tracing::info!("Docker socket not available, container stats disabled");
    }
    let probe = SysinfoProbe::new(cfg.sensors.clone(), docker);
    let collector = Arc::new(Collector::new(Box::new(probe), cfg.extra_filesystems.clone()));

    let listener = Listener::bind(cfg.network, &cfg.listen).await?;
    let server = Arc::new(AgentServer::new(cfg.keys, collector, cfg.fingerprint));

    let (stop_tx, stop_rx) = broadcast::channel(1);
    let serving = tokio::spawn(server.serve(listener, stop_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    let _ = stop_tx.send(());
    serving.await?;

    Ok(())
}
