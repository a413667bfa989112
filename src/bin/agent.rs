//! tnet agent
//!
//! Sits next to the origin server, serves tunnel sessions, and dials
//! out wherever the proxy's Config frame points. The serve loop
//! reconnects forever with backoff; only startup problems exit.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;

use tnet::agent::{Agent, AgentOptions};
use tnet::config::Config;
use tnet::supervisor::supervise;
use tnet::tunnel::{self, TunnelHandler};

/// TCP tunnel agent.
///
/// Examples:
///   tnet-agent --tunnel-listen ws://0.0.0.0:8080/stream --crypt-key 816559
///   tnet-agent --tunnel-connect ws://proxy-server:8080/stream --crypt-key 816559
#[derive(Parser, Debug)]
#[command(name = "tnet-agent")]
#[command(about = "TCP tunnel agent")]
#[command(version)]
struct Args {
    /// Tunnel server listening address
    #[arg(long, group = "tunnel")]
    tunnel_listen: Option<String>,

    /// Tunnel client connect address (for reverse mode)
    #[arg(long, group = "tunnel")]
    tunnel_connect: Option<String>,

    /// Crypt key
    #[arg(short = 'k', long)]
    crypt_key: Option<i64>,

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
    let defaults = file.agent.unwrap_or_default();

    let log_level = args.log_level.unwrap_or(file.logging.level);
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let crypt_key = args.crypt_key.unwrap_or(defaults.crypt_key);
    let tunnel_listen = args.tunnel_listen.or(defaults.tunnel_listen);
    let tunnel_connect = args.tunnel_connect.or(defaults.tunnel_connect);

    if tunnel_connect.is_some() && tunnel_listen.is_some() {
        bail!("cannot specify both --tunnel-connect and --tunnel-listen");
    }

    let agent: Arc<dyn TunnelHandler> = Arc::new(Agent::new(AgentOptions { crypt_key }));

    info!("tnet agent v{}", tnet::VERSION);

    if let Some(url) = tunnel_listen {
        let listener = tunnel::listener_for(&url).context("Invalid tunnel address")?;
        let listener = &*listener;
        info!("start tun server");
        tokio::select! {
            _ = supervise(|| listener.listen_and_serve(Arc::clone(&agent))) => {}
            _ = tokio::signal::ctrl_c() => info!("shutting down..."),
        }
    } else if let Some(url) = tunnel_connect {
        let dialer = tunnel::dialer_for(&url).context("Invalid tunnel address")?;
        let dialer = &*dialer;
        info!("start tun client (reverse mode)");
        tokio::select! {
            _ = supervise(|| dialer.dial_and_serve(Arc::clone(&agent))) => {}
            _ = tokio::signal::ctrl_c() => info!("shutting down..."),
        }
    } else {
        bail!("must specify either --tunnel-connect or --tunnel-listen");
    }

    Ok(())
}
