mod registry;

use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use fabric_core::OverlayConfig;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use registry::Registry;

/// Address book and round coordinator for a fabric overlay: accepts node
/// registrations, assigns ring neighbors once the overlay is full, then
/// drives the requested number of rounds.
#[derive(Parser, Debug)]
#[command(name = "fabric-registry")]
struct Args {
    /// Address to accept node registrations on.
    #[arg(long, default_value = "0.0.0.0:7000")]
    bind: String,

    /// Worker-thread pool size handed to every node.
    #[arg(long)]
    pool_size: usize,

    /// Number of nodes the overlay waits for before forming the ring.
    #[arg(long)]
    overlay_size: usize,

    /// Number of rounds to run once the overlay is formed.
    #[arg(long, default_value_t = 1)]
    rounds: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    fabric_core::error::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let overlay = OverlayConfig::new(args.pool_size, args.overlay_size);

    let listener = TcpListener::bind(&args.bind)
        .await
        .wrap_err_with(|| format!("failed to bind registry listener on {}", args.bind))?;
    tracing::info!(bind = %args.bind, overlay_size = args.overlay_size, pool_size = args.pool_size, "registry listening");

    let registry = Registry::new(overlay, args.rounds);
    registry.run(listener).await
}
