//! Session supervision
//!
//! Reconnects a peer's serve loop with exponential backoff. The same
//! backoff schedule is reused by the TCP fabric's accept loop.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::tunnel::TunnelError;
use crate::Error;

/// First retry delay.
pub const BACKOFF_INITIAL: Duration = Duration::from_millis(5);
/// Retry delay ceiling.
pub const BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Exponential backoff: 5 ms, doubling, capped at 1 s.
#[derive(Debug, Default)]
pub struct Backoff {
    delay: Option<Duration>,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next delay in the schedule.
    pub fn next(&mut self) -> Duration {
        let delay = match self.delay {
            None => BACKOFF_INITIAL,
            Some(prev) => (prev * 2).min(BACKOFF_MAX),
        };
        self.delay = Some(delay);
        delay
    }

    /// Restart the schedule from the beginning.
    pub fn reset(&mut self) {
        self.delay = None;
    }
}

/// Run `serve` forever, sleeping through the backoff schedule between
/// failures. Never returns.
///
/// The schedule resets once a session gets past the transport
/// handshake; a session that then dies still waits the base delay
/// before redialing, so a misbehaving peer cannot spin this loop.
pub async fn supervise<F, Fut>(mut serve: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), Error>>,
{
    let mut backoff = Backoff::new();
    loop {
        match serve().await {
            Ok(()) => backoff.reset(),
            Err(err) => {
                if !is_connect_error(&err) {
                    backoff.reset();
                }
                let delay = backoff.next();
                warn!("session failed: {}; retrying in {:?}", err, delay);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// True when the failure happened before the transport handshake
/// completed.
fn is_connect_error(err: &Error) -> bool {
    matches!(
        err,
        Error::Tunnel(TunnelError::Connect(_) | TunnelError::Bind(_) | TunnelError::Address { .. })
    )
}
