//! Managed TCP server

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{set_keepalive, Conn, ConnHandler, ConnState, ConnTrack, KeepAlive, Registry};
use crate::supervisor::Backoff;

type ContextFn<T> = Box<dyn FnMut(&TcpStream) -> T + Send>;

/// TCP server with connection tracking and graceful shutdown.
///
/// The context function runs in the accept loop for every connection,
/// before the handler is spawned; the cores use it to preallocate
/// per-stream state with a plain (single-task) id counter.
pub struct Server<T> {
    listen_addr: String,
    keepalive: KeepAlive,
    handler: Arc<dyn ConnHandler<T>>,
    conn_context: Mutex<ContextFn<T>>,
    registry: Arc<Registry>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<T: Send + 'static> Server<T> {
    pub fn new(
        listen_addr: impl Into<String>,
        keepalive: KeepAlive,
        handler: Arc<dyn ConnHandler<T>>,
        conn_context: impl FnMut(&TcpStream) -> T + Send + 'static,
    ) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            keepalive,
            handler,
            conn_context: Mutex::new(Box::new(conn_context)),
            registry: Arc::new(Registry::new()),
            local_addr: Mutex::new(None),
        }
    }

    /// Bound address, available once `listen_and_serve` has bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.local_addr.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Accept and serve until shutdown or a fatal bind error.
    pub async fn listen_and_serve(&self) -> crate::Result<()> {
        if self.registry.shutting_down() {
            return Err(closed_error());
        }

        let listener = TcpListener::bind(self.listen_addr.as_str()).await?;
        let bound = listener.local_addr()?;
        match self.local_addr.lock() {
            Ok(mut guard) => *guard = Some(bound),
            Err(poisoned) => *poisoned.into_inner() = Some(bound),
        }
        info!("tcp server listening on {}", bound);

        let mut backoff = Backoff::new();
        loop {
            let accepted = tokio::select! {
                _ = self.registry.done.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    let delay = backoff.next();
                    warn!("accept error: {}; retrying in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            backoff.reset();

            if let Err(e) = set_keepalive(&stream, self.keepalive) {
                debug!("keepalive setup for {} failed: {}", peer, e);
            }

            let context = match self.conn_context.lock() {
                Ok(mut guard) => (guard)(&stream),
                Err(poisoned) => (poisoned.into_inner())(&stream),
            };
            let track = Arc::new(ConnTrack::new());
            let id = self.registry.track(Arc::clone(&track));
            let conn = Conn {
                stream,
                peer_addr: Some(peer),
                context,
                track: Arc::clone(&track),
            };
            let handler = Arc::clone(&self.handler);
            let registry = Arc::clone(&self.registry);
            tokio::spawn(async move {
                handler.serve(conn).await;
                track.set_state(ConnState::Closed);
                registry.untrack(id);
            });
        }
    }

    /// Graceful shutdown; see [`Registry::shutdown`] semantics.
    pub async fn shutdown(&self, deadline: CancellationToken) -> crate::Result<()> {
        self.registry.shutdown(deadline).await
    }
}

fn closed_error() -> crate::Error {
    crate::Error::Io(io::Error::new(io::ErrorKind::Other, "tcp server closed"))
}
