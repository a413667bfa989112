//! Managed TCP fabric
//!
//! A thin server/client pair that owns connection tracking and graceful
//! shutdown so the tunnel cores only deal with per-connection
//! bridging:
//!
//! - [`Server`] accepts with exponential backoff on transient errors
//!   and runs a caller-supplied context function per connection before
//!   invoking the handler.
//! - [`Client`] dials a single target per call with TCP keep-alive.
//! - Both track connection states (`New → Active → Idle → Closed`) and
//!   shut down by polling every 500 ms until quiescent or a deadline
//!   token fires.

mod client;
mod server;

pub use client::Client;
pub use server::Server;

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Interval between quiescence checks during shutdown.
pub const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A `New` connection older than this counts as idle for shutdown
/// purposes; its handler never progressed.
const NEW_CONN_IDLE_AFTER: Duration = Duration::from_secs(5);

/// Connection lifecycle as seen by the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted or dialed, handler not yet past its setup phase.
    New,
    /// Handler is actively serving.
    Active,
    /// Handler declared itself between requests.
    Idle,
    /// Connection finished.
    Closed,
}

/// Keep-alive settings applied to accepted and dialed sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepAlive {
    pub period: Option<Duration>,
    pub count: Option<u32>,
}

/// One tracked connection, handed to the [`ConnHandler`].
pub struct Conn<T> {
    pub stream: TcpStream,
    pub peer_addr: Option<SocketAddr>,
    /// Per-connection data attached by the context function.
    pub context: T,
    track: Arc<ConnTrack>,
}

impl<T> Conn<T> {
    /// Declare the connection's lifecycle state. The fabric only closes
    /// `Idle` (or stale `New`) connections during graceful shutdown.
    pub fn set_state(&self, state: ConnState) {
        self.track.set_state(state);
    }

    /// Fired when the fabric wants this connection to wind down.
    pub fn closing(&self) -> CancellationToken {
        self.track.cancel.clone()
    }

    /// Split into the socket, the attached context, and a control
    /// handle that keeps the lifecycle callbacks usable after the
    /// socket has been consumed.
    pub fn into_parts(self) -> (TcpStream, T, ConnControl) {
        (
            self.stream,
            self.context,
            ConnControl { track: self.track },
        )
    }
}

/// Lifecycle handle detached from a [`Conn`].
pub struct ConnControl {
    track: Arc<ConnTrack>,
}

impl ConnControl {
    pub fn set_state(&self, state: ConnState) {
        self.track.set_state(state);
    }

    pub fn closing(&self) -> CancellationToken {
        self.track.cancel.clone()
    }
}

pub(crate) struct ConnTrack {
    state: Mutex<ConnState>,
    since: Instant,
    cancel: CancellationToken,
}

impl ConnTrack {
    fn new() -> Self {
        Self {
            state: Mutex::new(ConnState::New),
            since: Instant::now(),
            cancel: CancellationToken::new(),
        }
    }

    fn set_state(&self, state: ConnState) {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = state;
    }

    fn state(&self) -> ConnState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Whether graceful shutdown may close this connection now.
    fn closable(&self, now: Instant) -> bool {
        match self.state() {
            ConnState::Idle | ConnState::Closed => true,
            ConnState::New => now.duration_since(self.since) > NEW_CONN_IDLE_AFTER,
            ConnState::Active => false,
        }
    }
}

/// Per-connection callback.
#[async_trait]
pub trait ConnHandler<T>: Send + Sync + 'static {
    async fn serve(&self, conn: Conn<T>);
}

/// Shared tracking state behind both the server and the client.
pub(crate) struct Registry {
    conns: Mutex<HashMap<u64, Arc<ConnTrack>>>,
    next_id: AtomicU64,
    in_shutdown: AtomicBool,
    done: CancellationToken,
}

impl Registry {
    fn new() -> Self {
        Self {
            conns: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            in_shutdown: AtomicBool::new(false),
            done: CancellationToken::new(),
        }
    }

    fn shutting_down(&self) -> bool {
        self.in_shutdown.load(Ordering::Relaxed)
    }

    fn lock_conns(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Arc<ConnTrack>>> {
        match self.conns.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn track(&self, track: Arc<ConnTrack>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.lock_conns().insert(id, track);
        id
    }

    fn untrack(&self, id: u64) {
        self.lock_conns().remove(&id);
    }

    /// Cancel every connection eligible for closing; report whether any
    /// connection is still tracked.
    fn sweep(&self) -> bool {
        let now = Instant::now();
        let conns = self.lock_conns();
        for track in conns.values() {
            if track.closable(now) {
                track.cancel.cancel();
            }
        }
        conns.is_empty()
    }

    fn cancel_all(&self) {
        for track in self.lock_conns().values() {
            track.cancel.cancel();
        }
    }

    /// Close the listener/dialer side, then poll every 500 ms until no
    /// connection remains or `deadline` fires.
    async fn shutdown(&self, deadline: CancellationToken) -> crate::Result<()> {
        self.in_shutdown.store(true, Ordering::Relaxed);
        self.done.cancel();

        let mut poll = tokio::time::interval(SHUTDOWN_POLL_INTERVAL);
        loop {
            if self.sweep() {
                return Ok(());
            }
            tokio::select! {
                _ = deadline.cancelled() => {
                    self.cancel_all();
                    return Err(crate::Error::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "shutdown deadline exceeded",
                    )));
                }
                _ = poll.tick() => {}
            }
        }
    }
}

#[cfg(all(unix, not(target_os = "openbsd")))]
fn keepalive_with_count(ka: socket2::TcpKeepalive, count: u32) -> socket2::TcpKeepalive {
    ka.with_retries(count)
}

#[cfg(not(all(unix, not(target_os = "openbsd"))))]
fn keepalive_with_count(ka: socket2::TcpKeepalive, _count: u32) -> socket2::TcpKeepalive {
    ka
}

/// Apply keep-alive options to a socket. The probe count is a no-op on
/// platforms without `TCP_KEEPCNT`.
pub(crate) fn set_keepalive(stream: &TcpStream, keepalive: KeepAlive) -> io::Result<()> {
    let period = match keepalive.period {
        Some(period) => period,
        None => return Ok(()),
    };
    let mut ka = socket2::TcpKeepalive::new()
        .with_time(period)
        .with_interval(period);
    if let Some(count) = keepalive.count {
        ka = keepalive_with_count(ka, count);
    }
    socket2::SockRef::from(stream).set_tcp_keepalive(&ka)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_conns_become_closable_after_five_seconds() {
        let track = ConnTrack::new();
        let now = Instant::now();
        assert!(!track.closable(now));
        assert!(track.closable(now + Duration::from_secs(6)));

        track.set_state(ConnState::Active);
        assert!(!track.closable(now + Duration::from_secs(6)));

        track.set_state(ConnState::Idle);
        assert!(track.closable(now));
    }

    #[test]
    fn sweep_reports_quiescence() {
        let registry = Registry::new();
        assert!(registry.sweep());

        let track = Arc::new(ConnTrack::new());
        let id = registry.track(Arc::clone(&track));
        assert!(!registry.sweep());

        registry.untrack(id);
        assert!(registry.sweep());
    }
}
