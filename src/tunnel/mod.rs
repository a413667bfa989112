//! Tunnel transport abstraction
//!
//! A tunnel is any reliable full-duplex byte stream between the two
//! peers. Each backend hands the protocol layer a [`TunnelConn`]: a
//! reader/writer pair plus the session id assigned by the
//! transport-listening side.
//!
//! Backends:
//! - `ws://host:port/path` — WebSocket ([`websocket`])
//! - `mqtt://host:port/base` — MQTT topic pair ([`mqtt`])

pub mod mqtt;
pub mod websocket;

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use url::Url;

/// Transport layer errors.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid tunnel address {addr}: {reason}")]
    Address { addr: String, reason: String },

    #[error("bind failed: {0}")]
    Bind(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("transport failed: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Boxed read half of a tunnel.
pub type TunnelReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed write half of a tunnel.
pub type TunnelWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One established tunnel, handed to the protocol layer.
pub struct TunnelConn {
    /// Session id. Assigned by the transport-listening side; zero on
    /// the dialing side until the `TunID` frame arrives.
    pub tunnel_id: i64,
    /// Whether this peer is the transport listener.
    pub is_listener: bool,
    pub reader: TunnelReader,
    pub writer: TunnelWriter,
}

/// Protocol layer invoked once per established tunnel.
#[async_trait]
pub trait TunnelHandler: Send + Sync {
    async fn serve_tunnel(&self, conn: TunnelConn) -> crate::Result<()>;
}

/// Transport dialer: connects out, serves one tunnel, returns.
#[async_trait]
pub trait TunnelDialer: Send + Sync {
    async fn dial_and_serve(&self, handler: Arc<dyn TunnelHandler>) -> crate::Result<()>;
}

/// Transport listener: accepts tunnels and serves each with the
/// handler until the listener itself fails.
#[async_trait]
pub trait TunnelListener: Send + Sync {
    async fn listen_and_serve(&self, handler: Arc<dyn TunnelHandler>) -> crate::Result<()>;
}

fn parse_url(addr: &str) -> Result<Url, TunnelError> {
    Url::parse(addr).map_err(|e| TunnelError::Address {
        addr: addr.to_string(),
        reason: e.to_string(),
    })
}

/// Build a dialer for a tunnel URL, selected by scheme.
pub fn dialer_for(addr: &str) -> Result<Box<dyn TunnelDialer>, TunnelError> {
    let url = parse_url(addr)?;
    match url.scheme() {
        "ws" | "wss" => Ok(Box::new(websocket::WsDialer::new(addr))),
        // "tcp" is the MQTT broker-URL convention, not a raw transport.
        "mqtt" | "tcp" => Ok(Box::new(mqtt::MqttDialer::new(addr))),
        other => Err(TunnelError::Address {
            addr: addr.to_string(),
            reason: format!("unsupported scheme: {}", other),
        }),
    }
}

/// Build a listener for a tunnel URL, selected by scheme.
pub fn listener_for(addr: &str) -> Result<Box<dyn TunnelListener>, TunnelError> {
    let url = parse_url(addr)?;
    match url.scheme() {
        "ws" => Ok(Box::new(websocket::WsListener::new(addr))),
        // "tcp" is the MQTT broker-URL convention, not a raw transport.
        "mqtt" | "tcp" => Ok(Box::new(mqtt::MqttListener::new(addr))),
        other => Err(TunnelError::Address {
            addr: addr.to_string(),
            reason: format!("unsupported scheme: {}", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_selects_backend() {
        assert!(dialer_for("ws://127.0.0.1:8080/stream").is_ok());
        assert!(dialer_for("mqtt://127.0.0.1:1883/topic/tnet").is_ok());
        assert!(listener_for("ws://0.0.0.0:8080/stream").is_ok());
        assert!(matches!(
            dialer_for("gopher://x"),
            Err(TunnelError::Address { .. })
        ));
        assert!(matches!(
            dialer_for("not a url"),
            Err(TunnelError::Address { .. })
        ));
    }
}
