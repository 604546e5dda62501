use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::{stream::FuturesUnordered, StreamExt};
use tokio::sync::broadcast;

use mediaroom::config::{ConfigStore, ServerConfig};
use mediaroom::engine::{LoopbackEngine, MediaEngine};
use mediaroom::server::RoomManager;
use mediaroom::state::AppState;
use mediaroom::utils::{init_logging, LogLevel};
use mediaroom::web;

/// mediaroom signaling server command line arguments
#[derive(Parser, Debug)]
#[command(name = "mediaroom")]
#[command(version, about = "SFU signaling server with a loopback media engine", long_about = None)]
struct CliArgs {
    /// Path to a TOML configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen address (overrides config file)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// WebSocket/HTTP port (overrides config file)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Log level
    #[arg(short = 'l', long, value_enum, default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v verbose, -vv debug, -vvv trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

enum Exit {
    Signal,
    EngineDied,
    ServerStopped,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting mediaroom v{}", env!("CARGO_PKG_VERSION"));

    let config_store = ConfigStore::load(args.config.as_deref()).await?;
    let mut config = (*config_store.get()).clone();
    let mut overridden = false;
    if let Some(addr) = args.address {
        config.server.bind_addresses = vec![addr];
        overridden = true;
    }
    if let Some(port) = args.port {
        config.server.port = port;
        overridden = true;
    }
    if overridden {
        config_store.set(config.clone())?;
    }

    let bind_ips = resolve_bind_addresses(&config.server)?;
    let grace = Duration::from_secs(config.server.engine_grace_secs);

    let engine = Arc::new(LoopbackEngine::new(config.engine.clone()));
    tracing::info!(
        "Media engine ready with {} codecs",
        config.engine.media_codecs.len()
    );
    let engine: Arc<dyn MediaEngine> = engine;
    let rooms = Arc::new(RoomManager::new(engine.clone()));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let state = AppState::new(config_store, rooms.clone(), engine.clone(), shutdown_tx.clone());
    let app = web::create_router(state.clone());

    let listeners = bind_tcp_listeners(&bind_ips, config.server.port).await?;

    let mut servers = FuturesUnordered::new();
    for listener in listeners {
        let local_addr = listener.local_addr()?;
        tracing::info!("Starting signaling server on {}", local_addr);

        let mut shutdown_rx = state.shutdown_signal();
        let server = axum::serve(listener, app.clone()).with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        });
        servers.push(async move { server.await });
    }

    let exit = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown signal received");
            Exit::Signal
        }
        _ = async {
            engine.closed().await;
            tracing::error!("Media engine died, exiting in {:?}", grace);
            tokio::time::sleep(grace).await;
        } => Exit::EngineDied,
        result = servers.next() => {
            if let Some(Err(e)) = result {
                tracing::error!("Signaling server error: {}", e);
            }
            Exit::ServerStopped
        }
    };

    cleanup(&rooms, &shutdown_tx).await;

    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(result) = servers.next().await {
            if let Err(e) = result {
                tracing::warn!("Signaling server error during shutdown: {}", e);
            }
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!("Timed out waiting for listeners to stop");
    }

    match exit {
        Exit::EngineDied => anyhow::bail!("media engine terminated unexpectedly"),
        Exit::Signal | Exit::ServerStopped => {
            tracing::info!("Server shutdown complete");
            Ok(())
        }
    }
}

async fn cleanup(rooms: &RoomManager, shutdown_tx: &broadcast::Sender<()>) {
    rooms.close_all().await;
    let _ = shutdown_tx.send(());
}

/// Resolve bind IPs from config, dropping duplicates
fn resolve_bind_addresses(server: &ServerConfig) -> anyhow::Result<Vec<IpAddr>> {
    let mut seen = HashSet::new();
    let mut addrs = Vec::new();
    for addr in &server.bind_addresses {
        let ip: IpAddr = addr
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid bind address: {}", addr))?;
        if seen.insert(ip) {
            addrs.push(ip);
        }
    }

    if addrs.is_empty() {
        anyhow::bail!("No bind addresses configured");
    }

    Ok(addrs)
}

async fn bind_tcp_listeners(
    addrs: &[IpAddr],
    port: u16,
) -> anyhow::Result<Vec<tokio::net::TcpListener>> {
    let mut listeners = Vec::new();
    for ip in addrs {
        let addr = SocketAddr::new(*ip, port);
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listeners.push(listener),
            Err(err) => {
                tracing::warn!("Failed to bind {}: {}", addr, err);
            }
        }
    }

    if listeners.is_empty() {
        anyhow::bail!("Failed to bind any addresses on port {}", port);
    }

    Ok(listeners)
}
