//! shardswarm node
//!
//! Joins a swarm, replicates one shard collection with its peers and serves
//! it on a local WebSocket control channel until interrupted.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use swarm_log::Hash;
use swarm_node::{
    ControlServer, Dispatcher, Node, NodeConfig, NodeState, PeerId, TcpTransport, DEFAULT_CONTROL_PORT, DEFAULT_SWARM,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "shardswarm", version, about = "Sharded peer-to-peer document node")]
struct Args {
    /// Shard index of this node
    #[arg(long, default_value_t = 1)]
    index: u32,

    /// Swarm name
    #[arg(long, default_value = DEFAULT_SWARM)]
    swarm_name: String,

    /// Number of shards in the swarm
    #[arg(long, default_value_t = 8)]
    shard_count: u32,

    /// Peer transport listen address
    #[arg(long, default_value = "0.0.0.0:0")]
    listen: SocketAddr,

    /// Local control channel port
    #[arg(long, short, default_value_t = DEFAULT_CONTROL_PORT)]
    port: u16,

    /// Peer address to dial at startup (repeatable)
    #[arg(long, short)]
    bootstrap: Vec<String>,

    /// UDP port for LAN discovery beacons
    #[arg(long)]
    lan_discovery_port: Option<u16>,

    /// Hex-encoded 32-byte identity seed
    #[arg(long)]
    seed: Option<String>,

    /// Seconds spent joining before commands are served
    #[arg(long, default_value_t = 5)]
    join_grace: u64,

    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn config(&self) -> anyhow::Result<NodeConfig> {
        let mut builder = NodeConfig::builder()
            .index(self.index)
            .swarm_name(&self.swarm_name)
            .shard_count(self.shard_count)
            .listen_addr(self.listen)
            .control_port(self.port)
            .join_grace(Duration::from_secs(self.join_grace));

        for peer in &self.bootstrap {
            builder = builder.bootstrap(peer);
        }
        if let Some(port) = self.lan_discovery_port {
            builder = builder.lan_discovery_port(port);
        }
        if let Some(seed) = &self.seed {
            let seed = Hash::from_hex(seed).context("--seed must be 64 hex characters")?;
            builder = builder.identity_seed(*seed.as_bytes());
        }
        Ok(builder.build())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose)?;
    let config = args.config()?;

    tracing::info!("shardswarm v{} starting...", env!("CARGO_PKG_VERSION"));

    let identity = config.identity();
    let transport = TcpTransport::new(PeerId::new(identity.id()), config.listen_addr);
    let node = Node::start(config.clone(), identity, transport)
        .await
        .context("failed to start node")?;

    tracing::info!("Collection: {}", node.collection());
    tracing::info!("Node: {} listening on {}", node.id(), node.address());

    if node.wait_ready().await != NodeState::Ready {
        anyhow::bail!(
            "node stopped while joining: {}",
            node.fatal_error().unwrap_or_default()
        );
    }

    let server = ControlServer::bind(config.control_addr, Dispatcher::new(node.clone()))
        .await
        .with_context(|| format!("failed to bind control channel on {}", config.control_addr))?;
    let cancel = CancellationToken::new();
    let serving = tokio::spawn(server.run(cancel.clone()));
    tracing::info!("Node ready. Press Ctrl+C to stop.");

    tokio::select! {
        signal = shutdown_signal() => {
            signal.context("failed to listen for shutdown signals")?;
            tracing::info!("Shutdown signal received...");
        }
        _ = node.stopped() => {}
    }

    cancel.cancel();
    let _ = serving.await;
    if let Err(e) = node.shutdown().await {
        tracing::error!("Shutdown error: {}", e);
    }

    if let Some(err) = node.fatal_error() {
        anyhow::bail!("node stopped after fatal error: {}", err);
    }
    tracing::info!("Node stopped");
    Ok(())
}

fn init_tracing(verbosity: u8) -> anyhow::Result<()> {
    let mut filter = EnvFilter::from_default_env();

    // Only apply defaults if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        let level = match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        filter = filter.add_directive(level.parse()?);
    }
    filter = filter.add_directive("tungstenite=warn".parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
