//! tnet proxy
//!
//! Exposes a local TCP listener and forwards every accepted connection
//! through the tunnel to wherever the agent can dial. The serve loop
//! reconnects forever with backoff; only startup problems exit.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;

use tnet::config::Config;
use tnet::proxy::{Proxy, ProxyOptions};
use tnet::supervisor::supervise;
use tnet::tunnel::{self, TunnelHandler};

/// TCP tunnel proxy.
///
/// Examples:
///   tnet-proxy --listen 0.0.0.0:56080 --connect 127.0.0.1:3128 \
///       --tunnel-connect ws://123.45.67.89:8080/stream --crypt-key 816559
///   tnet-proxy --tunnel-listen ws://0.0.0.0:8080/stream --connect 127.0.0.1:3128
#[derive(Parser, Debug)]
#[command(name = "tnet-proxy")]
#[command(about = "TCP tunnel proxy")]
#[command(version)]
struct Args {
    /// Proxy listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Agent-side connect address
    #[arg(short, long)]
    connect: Option<String>,

    /// Tunnel client connect address
    #[arg(long, group = "tunnel")]
    tunnel_connect: Option<String>,

    /// Tunnel server listening address (for reverse mode)
    #[arg(long, group = "tunnel")]
    tunnel_listen: Option<String>,

    /// Crypt key
    #[arg(short = 'k', long)]
    crypt_key: Option<i64>,

    /// Capture per-stream traffic under this directory
    #[arg(long)]
    dump_dir: Option<PathBuf>,

    /// Configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let file = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };
    let defaults = file.proxy.unwrap_or_default();

    let log_level = args.log_level.unwrap_or(file.logging.level);
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let listen = args.listen.unwrap_or(defaults.listen);
    let connect = args.connect.unwrap_or(defaults.connect);
    let crypt_key = args.crypt_key.unwrap_or(defaults.crypt_key);
    let tunnel_connect = args.tunnel_connect.or(defaults.tunnel_connect);
    let tunnel_listen = args.tunnel_listen.or(defaults.tunnel_listen);
    let dump_dir = args.dump_dir.or(defaults.dump_dir.map(PathBuf::from));

    if tunnel_connect.is_some() && tunnel_listen.is_some() {
        bail!("cannot specify both --tunnel-connect and --tunnel-listen");
    }

    let proxy: Arc<dyn TunnelHandler> = Arc::new(Proxy::new(ProxyOptions {
        listen_addr: listen.clone(),
        connect_addr: connect.clone(),
        crypt_key,
        dump_dir,
    }));

    info!("tnet proxy v{}", tnet::VERSION);
    info!("local listener: {}", listen);
    info!("agent connect target: {}", connect);

    if let Some(url) = tunnel_connect {
        let dialer = tunnel::dialer_for(&url).context("Invalid tunnel address")?;
        let dialer = &*dialer;
        info!("start tun client");
        tokio::select! {
            _ = supervise(|| dialer.dial_and_serve(Arc::clone(&proxy))) => {}
            _ = tokio::signal::ctrl_c() => info!("shutting down..."),
        }
    } else if let Some(url) = tunnel_listen {
        let listener = tunnel::listener_for(&url).context("Invalid tunnel address")?;
        let listener = &*listener;
        info!("start tun server (reverse mode)");
        tokio::select! {
            _ = supervise(|| listener.listen_and_serve(Arc::clone(&proxy))) => {}
            _ = tokio::signal::ctrl_c() => info!("shutting down..."),
        }
    } else {
        bail!("must specify either --tunnel-connect or --tunnel-listen");
    }

    Ok(())
}
