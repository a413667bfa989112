//! Managed TCP client

use std::io;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{set_keepalive, Conn, ConnHandler, ConnState, ConnTrack, KeepAlive, Registry};

/// TCP client dialing one target per call, with the same tracking and
/// shutdown behavior as the server side of the fabric.
pub struct Client<T> {
    connect_addr: String,
    keepalive: KeepAlive,
    handler: Arc<dyn ConnHandler<T>>,
    registry: Arc<Registry>,
}

impl<T: Send + 'static> Client<T> {
    pub fn new(
        connect_addr: impl Into<String>,
        keepalive: KeepAlive,
        handler: Arc<dyn ConnHandler<T>>,
    ) -> Self {
        Self {
            connect_addr: connect_addr.into(),
            keepalive,
            handler,
            registry: Arc::new(Registry::new()),
        }
    }

    pub fn connect_addr(&self) -> &str {
        &self.connect_addr
    }

    /// Dial the target and run the handler on the connection.
    ///
    /// A dial failure is returned to the caller; the agent core turns
    /// it into a `ConnectResult` for the peer.
    pub async fn dial_and_serve(&self, context: T) -> crate::Result<()> {
        if self.registry.shutting_down() {
            return Err(closed_error());
        }

        let stream = tokio::select! {
            _ = self.registry.done.cancelled() => return Err(closed_error()),
            res = TcpStream::connect(self.connect_addr.as_str()) => res?,
        };
        if let Err(e) = set_keepalive(&stream, self.keepalive) {
            debug!("keepalive setup for {} failed: {}", self.connect_addr, e);
        }

        let peer_addr = stream.peer_addr().ok();
        let track = Arc::new(ConnTrack::new());
        let id = self.registry.track(Arc::clone(&track));
        let conn = Conn {
            stream,
            peer_addr,
            context,
            track: Arc::clone(&track),
        };
        self.handler.serve(conn).await;
        track.set_state(ConnState::Closed);
        self.registry.untrack(id);
        Ok(())
    }

    /// Graceful shutdown; see [`Registry::shutdown`] semantics.
    pub async fn shutdown(&self, deadline: CancellationToken) -> crate::Result<()> {
        self.registry.shutdown(deadline).await
    }
}

fn closed_error() -> crate::Error {
    crate::Error::Io(io::Error::new(io::ErrorKind::Other, "tcp client closed"))
}
