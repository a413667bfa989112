//! # tnet
//!
//! A bidirectional TCP tunnel that multiplexes many independent TCP
//! connections over a single long-lived, obfuscated transport.
//!
//! Two role-symmetric peers cooperate: the **proxy** exposes a local
//! TCP listener near the clients, the **agent** dials the origin server
//! on the far side. Either peer may be the transport listener, giving a
//! normal and a reverse deployment.
//!
//! ```text
//! TCP client → [proxy listener] → proxy ⇄ (tunnel) ⇄ agent → origin TCP
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │               Proxy / Agent cores                    │
//! │      (stream lifecycle, dispatch, bridging)          │
//! ├─────────────────────────────────────────────────────┤
//! │                  Session Layer                       │
//! │   (stream table, serialized writer, close signals)   │
//! ├─────────────────────────────────────────────────────┤
//! │              Frame + Obfuscation Codec               │
//! │        (command frames, LCG-keyed XOR stream)        │
//! ├─────────────────────────────────────────────────────┤
//! │                 Tunnel Transport                     │
//! │              (WebSocket, MQTT topics)                │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod config;
pub mod counter;
pub mod obfuscation;
pub mod protocol;
pub mod proxy;
pub mod session;
pub mod supervisor;
pub mod tcp;
pub mod tunnel;

pub use config::Config;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Obfuscation key used when none is configured.
pub const DEFAULT_CRYPT_KEY: i64 = 98545715754651;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("transport error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invariant violation: {0}")]
    Invariant(String),
}
