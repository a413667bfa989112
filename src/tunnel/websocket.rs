//! WebSocket tunnel transport
//!
//! One tunnel per WebSocket connection. Binary messages carry the
//! tunnel byte stream; the reader concatenates successive binary
//! payloads, and every other message type is drained and ignored. The
//! listening side pings every 10 s; either side gives up after 15 s
//! without hearing anything.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{accept_hdr_async, connect_async, WebSocketStream};
use tracing::{debug, info, warn};

use super::{TunnelConn, TunnelError, TunnelHandler, TunnelListener};
use crate::supervisor::Backoff;
use crate::tunnel::TunnelDialer;

const PING_PERIOD: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(15);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// In-memory pipe capacity between the socket pump and the protocol
/// layer.
const PUMP_BUFFER: usize = 256 * 1024;

/// Outbound chunk ceiling; one chunk becomes one binary message.
const CHUNK_SIZE: usize = 64 * 1024;

/// WebSocket tunnel dialer.
pub struct WsDialer {
    url: String,
}

impl WsDialer {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl TunnelDialer for WsDialer {
    async fn dial_and_serve(&self, handler: Arc<dyn TunnelHandler>) -> crate::Result<()> {
        let (socket, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TunnelError::Connect(e.to_string()))?;
        debug!("tunnel connected to {}", self.url);
        serve_socket(socket, 0, false, handler).await
    }
}

/// WebSocket tunnel listener.
pub struct WsListener {
    url: String,
    next_tunnel_id: AtomicI64,
}

impl WsListener {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            next_tunnel_id: AtomicI64::new(0),
        }
    }
}

#[async_trait]
impl TunnelListener for WsListener {
    async fn listen_and_serve(&self, handler: Arc<dyn TunnelHandler>) -> crate::Result<()> {
        let url = super::parse_url(&self.url)?;
        let host = url.host_str().ok_or_else(|| TunnelError::Address {
            addr: self.url.clone(),
            reason: "missing host".to_string(),
        })?;
        let port = url.port().unwrap_or(80);
        let path = url.path().to_string();

        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| TunnelError::Bind(e.to_string()))?;
        info!("tunnel listening on {}", self.url);

        let mut backoff = Backoff::new();
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    let delay = backoff.next();
                    warn!("tunnel accept error: {}; retrying in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            backoff.reset();

            let tunnel_id = self.next_tunnel_id.fetch_add(1, Ordering::Relaxed) + 1;
            let path = path.clone();
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let socket = match upgrade(stream, &path).await {
                    Ok(socket) => socket,
                    Err(e) => {
                        debug!("websocket upgrade from {} failed: {}", peer, e);
                        return;
                    }
                };
                info!("new tun connection, tunID {}", tunnel_id);
                if let Err(e) = serve_socket(socket, tunnel_id, true, handler).await {
                    warn!("tun connection failed, tunID {}: {}", tunnel_id, e);
                }
                info!("tun connection closed, tunID {}", tunnel_id);
            });
        }
    }
}

async fn upgrade(stream: TcpStream, path: &str) -> Result<WebSocketStream<TcpStream>, TunnelError> {
    let expected = path.to_string();
    let check_path = move |req: &Request, resp: Response| {
        if req.uri().path() == expected {
            Ok(resp)
        } else {
            let mut not_found = ErrorResponse::new(None);
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            Err(not_found)
        }
    };
    accept_hdr_async(stream, check_path)
        .await
        .map_err(|e| TunnelError::Transport(e.to_string()))
}

/// Bridge one WebSocket to an in-memory byte pipe and run the protocol
/// handler over the pipe's other end.
async fn serve_socket<S>(
    socket: WebSocketStream<S>,
    tunnel_id: i64,
    is_listener: bool,
    handler: Arc<dyn TunnelHandler>,
) -> crate::Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = socket.split();
    let (near, far) = tokio::io::duplex(PUMP_BUFFER);
    let (reader, writer) = tokio::io::split(near);
    let (mut pump_read, mut pump_write) = tokio::io::split(far);

    let conn = TunnelConn {
        tunnel_id,
        is_listener,
        reader: Box::new(reader),
        writer: Box::new(writer),
    };
    let handler_task = tokio::spawn(async move { handler.serve_tunnel(conn).await });

    let pump = async move {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut last_read = Instant::now();
        let mut ping = tokio::time::interval(PING_PERIOD);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ping.reset();

        loop {
            tokio::select! {
                msg = stream.next() => {
                    last_read = Instant::now();
                    match msg {
                        None | Some(Ok(Message::Close(_))) => break,
                        Some(Ok(Message::Binary(payload))) => {
                            if pump_write.write_all(&payload).await.is_err() {
                                // Protocol side is gone; unwind below.
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let pong = sink.send(Message::Pong(payload));
                            if tokio::time::timeout(WRITE_TIMEOUT, pong).await.is_err() {
                                return Err(TunnelError::Transport(
                                    "pong write timed out".to_string(),
                                ));
                            }
                        }
                        // Non-binary traffic is drained and ignored.
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(TunnelError::Transport(e.to_string())),
                    }
                }
                res = pump_read.read(&mut buf) => {
                    let n = res.map_err(TunnelError::Io)?;
                    if n == 0 {
                        // Protocol layer finished; say goodbye.
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    sink.send(Message::binary(buf[..n].to_vec()))
                        .await
                        .map_err(|e| TunnelError::Transport(e.to_string()))?;
                }
                _ = ping.tick() => {
                    if last_read.elapsed() > READ_TIMEOUT {
                        return Err(TunnelError::Transport(
                            "read deadline exceeded".to_string(),
                        ));
                    }
                    if is_listener {
                        let ping = sink.send(Message::Ping(Vec::new()));
                        if tokio::time::timeout(WRITE_TIMEOUT, ping).await.is_err() {
                            return Err(TunnelError::Transport(
                                "ping write timed out".to_string(),
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    };

    // When the pump future completes it drops the socket and the pipe,
    // which unblocks the handler if it is still running.
    let pump_result = pump.await;
    let handler_result = match handler_task.await {
        Ok(res) => res,
        Err(e) => Err(crate::Error::Io(std::io::Error::other(e))),
    };
    pump_result?;
    handler_result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::TunnelConn;

    struct EchoHandler;

    #[async_trait]
    impl TunnelHandler for EchoHandler {
        async fn serve_tunnel(&self, mut conn: TunnelConn) -> crate::Result<()> {
            let mut buf = vec![0u8; 1024];
            loop {
                let n = conn.reader.read(&mut buf).await?;
                if n == 0 {
                    return Ok(());
                }
                conn.writer.write_all(&buf[..n]).await?;
                conn.writer.flush().await?;
            }
        }
    }

    #[tokio::test]
    async fn dialer_reaches_listener_handler() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let url = format!("ws://127.0.0.1:{}/stream", port);
        let ws_listener = WsListener::new(&url);
        tokio::spawn(async move {
            let _ = ws_listener.listen_and_serve(Arc::new(EchoHandler)).await;
        });

        // The listener needs a moment to bind.
        let mut connected = None;
        for _ in 0..50 {
            match connect_async(url.as_str()).await {
                Ok((socket, _)) => {
                    connected = Some(socket);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        let mut socket = connected.expect("listener never came up");

        socket
            .send(Message::binary(b"ping me back".to_vec()))
            .await
            .unwrap();
        let mut echoed = Vec::new();
        while echoed.len() < 12 {
            match socket.next().await.expect("socket closed early").unwrap() {
                Message::Binary(b) => echoed.extend_from_slice(&b),
                _ => {}
            }
        }
        assert_eq!(&echoed, b"ping me back");
    }

    #[tokio::test]
    async fn wrong_path_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let url = format!("ws://127.0.0.1:{}/stream", port);
        let ws_listener = WsListener::new(&url);
        tokio::spawn(async move {
            let _ = ws_listener.listen_and_serve(Arc::new(EchoHandler)).await;
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let bad = format!("ws://127.0.0.1:{}/other", port);
        assert!(connect_async(bad.as_str()).await.is_err());
    }
}
