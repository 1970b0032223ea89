//! Veil node
//!
//! Runs a simulated network of routers in one process, hosts a destination
//! on two of them and exchanges garlic messages through their tunnels.

mod simulation;

use anyhow::{Context, Result};
use clap::Parser;
use simulation::Simulation;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use veil_router::RouterConfig;

#[derive(Parser, Debug)]
#[command(name = "veilnode")]
#[command(author, version, about = "Tunnel and garlic routing over a simulated network")]
struct Cli {
    /// Router configuration file (YAML)
    #[arg(short, long, env = "VEIL_CONFIG")]
    config: Option<PathBuf>,

    /// Write the default configuration to this path and exit
    #[arg(long)]
    write_config: Option<PathBuf>,

    /// Number of routers in the simulated network
    #[arg(short, long, default_value = "12")]
    peers: usize,

    /// Messages sent from the first destination to the second
    #[arg(short, long, default_value = "10")]
    messages: usize,

    /// Seconds to wait for tunnels and deliveries
    #[arg(short, long, default_value = "30")]
    duration: u64,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => RouterConfig::load(path)?,
        None => RouterConfig::default(),
    };
    let timeout = Duration::from_secs(cli.duration);

    let mut sim = Simulation::new(cli.peers, &config)?;
    let sender = sim.add_destination(0)?;
    let receiver = sim.add_destination(1)?;
    info!("Destinations {} and {} hosted", sender, receiver);

    sim.start().await;
    let outcome = async {
        sim.wait_ready(0, &sender, timeout).await?;
        sim.wait_ready(1, &receiver, timeout).await?;
        sim.exchange((0, sender), (1, receiver), cli.messages, timeout)
            .await
    }
    .await;
    sim.shutdown().await;

    let report = outcome?;
    let yaml = serde_yaml::to_string(&report).context("Failed to render report")?;
    println!("{}", yaml);

    if report.messages_delivered < report.messages_sent {
        anyhow::bail!(
            "Only {} of {} messages delivered",
            report.messages_delivered,
            report.messages_sent
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.json);

    if let Some(path) = &cli.write_config {
        RouterConfig::default().save(path)?;
        info!("Default configuration written to {}", path.display());
        return Ok(());
    }

    tokio::select! {
        result = run(cli) => {
            if let Err(e) = &result {
                error!("Simulation failed: {:#}", e);
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            Ok(())
        }
    }
}
