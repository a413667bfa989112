//! Agent core
//!
//! The agent sits next to the origin server. Per tunnel session it
//! exchanges `TunID`, learns the dial target from `Config`, and then
//! serves `Connect` requests by dialing out and bridging. Dial failures
//! fail only the one stream; the session keeps running.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::obfuscation::XorReader;
use crate::protocol::{Frame, ProtocolError};
use crate::session::{sync_tunnel_id, Bridge, FrameWriter, StreamEntry, StreamMap, StreamRx};
use crate::tcp::{Client, Conn, ConnHandler, ConnState, KeepAlive};
use crate::tunnel::{TunnelConn, TunnelHandler};

/// Keep-alive applied to dialed origin connections.
const ORIGIN_KEEPALIVE: KeepAlive = KeepAlive {
    period: Some(Duration::from_secs(15)),
    count: Some(3),
};

/// How long session teardown waits for origin connections to finish.
const TEARDOWN_GRACE: Duration = Duration::from_secs(5);

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Shared obfuscation seed.
    pub crypt_key: i64,
}

/// The agent-side tunnel handler.
pub struct Agent {
    opts: AgentOptions,
}

impl Agent {
    pub fn new(opts: AgentOptions) -> Self {
        Self { opts }
    }
}

/// Per-connection context carried through the dial.
struct AgentCtx {
    entry: Arc<StreamEntry>,
    rx: StreamRx,
}

#[async_trait]
impl TunnelHandler for Agent {
    async fn serve_tunnel(&self, conn: TunnelConn) -> crate::Result<()> {
        info!("new tun connection");
        let TunnelConn {
            tunnel_id,
            is_listener,
            reader,
            writer,
        } = conn;

        let writer = FrameWriter::new(writer, self.opts.crypt_key);
        let mut reader = XorReader::new(reader, self.opts.crypt_key);

        let tunnel_id = sync_tunnel_id(is_listener, tunnel_id, &mut reader, &writer).await?;
        let connect_addr = match Frame::read(&mut reader).await? {
            Frame::Config { connect_addr } => connect_addr,
            other => {
                return Err(ProtocolError::UnexpectedCommand {
                    expected: "Config",
                    got: other.name(),
                }
                .into())
            }
        };
        debug!("Read CmdConfig, connectAddr {}", connect_addr);

        let streams = StreamMap::new();
        let handler = Arc::new(AgentConnHandler {
            tunnel_id,
            writer: writer.clone(),
            streams: streams.clone(),
        });
        let client = Arc::new(Client::new(connect_addr, ORIGIN_KEEPALIVE, handler));

        // Frame dispatcher: the only tunnel reader for this session.
        let result = loop {
            let frame = match Frame::read(&mut reader).await {
                Ok(frame) => frame,
                Err(e) => break Err(e.into()),
            };
            match frame {
                Frame::Connect { stream_id } => {
                    debug!("Read CmdConnect, connID {}:{}", tunnel_id, stream_id);
                    let (entry, rx) = StreamEntry::new(stream_id, false);
                    streams.insert(Arc::clone(&entry));

                    let client = Arc::clone(&client);
                    let writer = writer.clone();
                    let streams = streams.clone();
                    tokio::spawn(async move {
                        if let Err(e) = client.dial_and_serve(AgentCtx { entry, rx }).await {
                            streams.remove(stream_id);
                            let reason = match &e {
                                crate::Error::Io(io) => io.to_string(),
                                other => other.to_string(),
                            };
                            debug!(
                                "dial failed: {}, connID {}:{}",
                                reason, tunnel_id, stream_id
                            );
                            let frame = Frame::ConnectResult {
                                stream_id,
                                error: Some(reason),
                            };
                            if let Err(e) = writer.send(&frame).await {
                                debug!(
                                    "write tun err: {}, connID {}:{}",
                                    e, tunnel_id, stream_id
                                );
                            }
                        }
                    });
                }
                Frame::Send { stream_id, data } => {
                    debug!(
                        "Read CmdSend, connID {}:{}, {} bytes",
                        tunnel_id,
                        stream_id,
                        data.len()
                    );
                    match streams.get(stream_id) {
                        Some(entry) => {
                            if !entry.push_data(data).await {
                                debug!(
                                    "dropped data for finished stream, connID {}:{}",
                                    tunnel_id, stream_id
                                );
                            }
                        }
                        None => debug!("connID {}:{} not found", tunnel_id, stream_id),
                    }
                }
                Frame::Close { stream_id } => {
                    debug!("Read CmdClose, connID {}:{}", tunnel_id, stream_id);
                    match streams.get(stream_id) {
                        Some(entry) => entry.signal_close(),
                        None => debug!("connID {}:{} not found", tunnel_id, stream_id),
                    }
                }
                other => {
                    break Err(ProtocolError::UnexpectedCommand {
                        expected: "Connect, Send or Close",
                        got: other.name(),
                    }
                    .into());
                }
            }
        };

        // Session over: wake every bridge, then drain the dial fabric.
        streams.close_all();
        let deadline = CancellationToken::new();
        let fire = deadline.clone();
        tokio::spawn(async move {
            tokio::time::sleep(TEARDOWN_GRACE).await;
            fire.cancel();
        });
        if let Err(e) = client.shutdown(deadline).await {
            warn!("origin client shutdown: {}", e);
        }

        info!("tun connection closed");
        result
    }
}

struct AgentConnHandler {
    tunnel_id: i64,
    writer: FrameWriter,
    streams: StreamMap,
}

#[async_trait]
impl ConnHandler<AgentCtx> for AgentConnHandler {
    async fn serve(&self, conn: Conn<AgentCtx>) {
        let (stream, ctx, control) = conn.into_parts();
        let AgentCtx { entry, rx } = ctx;
        let stream_id = entry.stream_id;
        let tunnel_id = self.tunnel_id;

        info!("new agent connection, connID {}:{}", tunnel_id, stream_id);

        // The peer may have closed the stream while the dial was in
        // flight; there is nobody left to report to.
        if entry.close_received() {
            self.streams.remove(stream_id);
            return;
        }

        // Success is announced exactly once, before any Send.
        let ok = Frame::ConnectResult {
            stream_id,
            error: None,
        };
        if let Err(e) = self.writer.send(&ok).await {
            debug!("write tun err: {}, connID {}:{}", e, tunnel_id, stream_id);
            self.streams.remove(stream_id);
            return;
        }
        debug!("Write CmdConnectResult, connID {}:{}", tunnel_id, stream_id);

        control.set_state(ConnState::Active);
        Bridge {
            tunnel_id,
            entry,
            inbound: rx.inbound,
            writer: self.writer.clone(),
            streams: self.streams.clone(),
            dump: None,
            conn_closing: control.closing(),
        }
        .run(stream)
        .await;

        info!("agent connection closed, connID {}:{}", tunnel_id, stream_id);
    }
}
