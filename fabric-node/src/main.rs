mod net;

use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::{eyre, Result, WrapErr};
use fabric_core::{
    Connection, Message, NeighborLink, NodeController, OverlayConfig, PeerAddr, ProtocolTuning,
    RegisterStatus, Statistics, WorkerPool,
};
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;

/// A single participant in the overlay: registers with the registry, dials
/// its `next` ring neighbor, accepts a connection from its `prev` neighbor,
/// then runs rounds until the registry connection closes.
#[derive(Parser, Debug)]
#[command(name = "fabric-node")]
struct Args {
    /// Host this node is reachable at, advertised to the registry and to
    /// the neighbor that dials in as `prev`.
    #[arg(long)]
    host: String,

    /// Port this node listens on and advertises.
    #[arg(long)]
    port: u16,

    /// Registry address to register with, e.g. `127.0.0.1:7000`.
    #[arg(long)]
    registry: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    fabric_core::error::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let self_addr = PeerAddr::new(args.host.clone(), args.port);
    let tuning = ProtocolTuning::default();

    let listener = TcpListener::bind((args.host.as_str(), args.port))
        .await
        .wrap_err_with(|| format!("failed to bind on {}:{}", args.host, args.port))?;
    tracing::info!(%self_addr, "listening for ring connections");

    let registry_stream = TcpStream::connect(&args.registry)
        .await
        .wrap_err_with(|| format!("failed to connect to registry at {}", args.registry))?;
    let mut registry_conn = Connection::new(registry_stream);
    registry_conn
        .send(&Message::RegisterRequest {
            host: self_addr.host.clone(),
            port: self_addr.port,
        })
        .await
        .wrap_err("failed to send registration request")?;

    match registry_conn.recv().await {
        Some(Message::RegisterResponse { status: RegisterStatus::Ok, info }) => {
            tracing::info!(info, "registered with registry");
        }
        Some(Message::RegisterResponse { status: RegisterStatus::Rejected, info }) => {
            return Err(eyre!("registration rejected: {info}"));
        }
        other => return Err(eyre!("unexpected response to registration: {other:?}")),
    }

    let (prev_addr, next_addr, overlay) = match registry_conn.recv().await {
        Some(Message::MessagingNodesList { neighbors, pool_size, overlay_size }) => {
            let [prev, next]: [PeerAddr; 2] = neighbors
                .try_into()
                .map_err(|n: Vec<PeerAddr>| eyre!("expected exactly 2 neighbors, got {}", n.len()))?;
            (prev, next, OverlayConfig::new(pool_size, overlay_size))
        }
        other => return Err(eyre!("expected MessagingNodesList, got {other:?}")),
    };
    tracing::info!(%prev_addr, %next_addr, pool_size = overlay.pool_size, "overlay formed");

    let (next_conn, prev_conn) = tokio::try_join!(
        dial_next(&next_addr, &self_addr),
        accept_prev(&listener),
    )?;

    let (registry_tx, registry_rx) = net::spawn_pump(registry_conn, tuning.channel_buffer_size);
    let (next_tx, next_rx) = net::spawn_pump(next_conn, tuning.channel_buffer_size);
    let (prev_tx, prev_rx) = net::spawn_pump(prev_conn, tuning.channel_buffer_size);

    let stats = Arc::new(Statistics::new());
    let pool = Arc::new(WorkerPool::new(overlay.pool_size, Arc::clone(&stats)));
    pool.start();

    let next = NeighborLink { addr: next_addr, tx: next_tx };
    let prev = NeighborLink { addr: prev_addr, tx: prev_tx };

    let mut controller = NodeController::new(
        self_addr, overlay, tuning, stats, pool, prev, prev_rx, next, next_rx, registry_tx, registry_rx,
    );
    controller.run().await;
    Ok(())
}

async fn dial_next(next_addr: &PeerAddr, self_addr: &PeerAddr) -> Result<Connection> {
    let stream = TcpStream::connect((next_addr.host.as_str(), next_addr.port))
        .await
        .wrap_err_with(|| format!("failed to dial next neighbor at {next_addr}"))?;
    let mut conn = Connection::new(stream);
    conn.send(&Message::Hello { addr: self_addr.clone() })
        .await
        .wrap_err("failed to send handshake to next neighbor")?;
    Ok(conn)
}

async fn accept_prev(listener: &TcpListener) -> Result<Connection> {
    let (stream, peer) = listener
        .accept()
        .await
        .wrap_err("failed to accept prev neighbor connection")?;
    let mut conn = Connection::new(stream);
    match conn.recv().await {
        Some(Message::Hello { addr }) => tracing::info!(%addr, %peer, "accepted prev connection"),
        other => tracing::warn!(?other, %peer, "expected Hello handshake from prev connection"),
    }
    Ok(conn)
}
