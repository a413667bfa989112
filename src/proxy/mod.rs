//! Proxy core
//!
//! The proxy exposes a local TCP listener to clients and owns stream-id
//! allocation. Per tunnel session it:
//!
//! 1. Exchanges `TunID` (the transport listener writes it first).
//! 2. Sends `Config` with the agent-side connect address.
//! 3. Accepts local connections, sending `Connect` for each and
//!    bridging once the agent reports success.
//! 4. Dispatches incoming `ConnectResult`/`Send`/`Close` frames to the
//!    matching stream; anything else kills the session.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::counter::{human_bytes, Counter, CountingReader, PeriodCounter};
use crate::obfuscation::XorReader;
use crate::protocol::{Frame, ProtocolError};
use crate::session::{sync_tunnel_id, Bridge, DumpFiles, FrameWriter, StreamEntry, StreamMap, StreamRx};
use crate::tcp::{Conn, ConnHandler, ConnState, KeepAlive, Server};
use crate::tunnel::{TunnelConn, TunnelHandler};

/// Keep-alive applied to accepted local connections.
const LOCAL_KEEPALIVE: KeepAlive = KeepAlive {
    period: Some(Duration::from_secs(15)),
    count: Some(3),
};

/// How long session teardown waits for local connections to finish.
const TEARDOWN_GRACE: Duration = Duration::from_secs(5);

/// Rate window for the upload/download counters.
const COUNTER_PERIOD: Duration = Duration::from_secs(1);

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Local address clients connect to.
    pub listen_addr: String,
    /// Address the agent dials on the far side.
    pub connect_addr: String,
    /// Shared obfuscation seed.
    pub crypt_key: i64,
    /// Capture per-stream traffic under this directory when set.
    pub dump_dir: Option<PathBuf>,
}

/// The proxy-side tunnel handler. One instance serves every session;
/// per-session state lives in `serve_tunnel`.
pub struct Proxy {
    opts: ProxyOptions,
    upload: Arc<dyn Counter>,
    download: Arc<dyn Counter>,
}

impl Proxy {
    pub fn new(opts: ProxyOptions) -> Self {
        Self {
            opts,
            upload: Arc::new(PeriodCounter::new(COUNTER_PERIOD)),
            download: Arc::new(PeriodCounter::new(COUNTER_PERIOD)),
        }
    }
}

/// Per-connection context preallocated in the accept loop.
struct ProxyCtx {
    entry: Arc<StreamEntry>,
    rx: StreamRx,
}

#[async_trait]
impl TunnelHandler for Proxy {
    async fn serve_tunnel(&self, conn: TunnelConn) -> crate::Result<()> {
        info!("new tun connection");
        let TunnelConn {
            tunnel_id,
            is_listener,
            reader,
            writer,
        } = conn;

        let writer = FrameWriter::new(writer, self.opts.crypt_key)
            .with_counter(Arc::clone(&self.upload));
        let mut reader = CountingReader::new(
            XorReader::new(reader, self.opts.crypt_key),
            Arc::clone(&self.download),
        );

        let tunnel_id = sync_tunnel_id(is_listener, tunnel_id, &mut reader, &writer).await?;
        writer
            .send(&Frame::Config {
                connect_addr: self.opts.connect_addr.clone(),
            })
            .await?;
        debug!("Write CmdConfig, connectAddr {}", self.opts.connect_addr);

        let streams = StreamMap::new();
        let handler = Arc::new(ProxyConnHandler {
            tunnel_id,
            writer: writer.clone(),
            streams: streams.clone(),
            dump_dir: self.opts.dump_dir.clone(),
        });

        // Stream ids are allocated here, in the single accept task.
        let mut next_stream_id: i64 = 0;
        let server = Arc::new(Server::new(
            self.opts.listen_addr.clone(),
            LOCAL_KEEPALIVE,
            handler,
            move |_| {
                next_stream_id += 1;
                let (entry, rx) = StreamEntry::new(next_stream_id, true);
                ProxyCtx { entry, rx }
            },
        ));
        let serving = Arc::clone(&server);
        let mut server_task = tokio::spawn(async move { serving.listen_and_serve().await });

        // Frame dispatcher: the only tunnel reader for this session.
        let result = loop {
            let frame = tokio::select! {
                res = &mut server_task => {
                    break match res {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(e),
                        Err(e) => Err(crate::Error::Io(std::io::Error::other(e))),
                    };
                }
                frame = Frame::read(&mut reader) => match frame {
                    Ok(frame) => frame,
                    Err(e) => break Err(e.into()),
                },
            };
            match frame {
                Frame::ConnectResult { stream_id, error } => {
                    debug!(
                        "Read CmdConnectResult, connID {}:{}, {:?}",
                        tunnel_id, stream_id, error
                    );
                    match streams.get(stream_id) {
                        Some(entry) => {
                            if let Err(e) = entry.deliver_connect_result(error) {
                                break Err(e);
                            }
                        }
                        None => debug!("connID {}:{} not found", tunnel_id, stream_id),
                    }
                }
                Frame::Send { stream_id, data } => {
                    debug!(
                        "Read CmdSend, connID {}:{}, {} bytes, download {}/s",
                        tunnel_id,
                        stream_id,
                        data.len(),
                        human_bytes(self.download.rate_per_sec().max(0) as u64)
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
                        expected: "ConnectResult, Send or Close",
                        got: other.name(),
                    }
                    .into());
                }
            }
        };

        // Session over: wake every bridge, then drain the fabric.
        streams.close_all();
        let deadline = CancellationToken::new();
        let fire = deadline.clone();
        tokio::spawn(async move {
            tokio::time::sleep(TEARDOWN_GRACE).await;
            fire.cancel();
        });
        if let Err(e) = server.shutdown(deadline).await {
            warn!("local server shutdown: {}", e);
        }
        server_task.abort();

        info!("tun connection closed");
        result
    }
}

struct ProxyConnHandler {
    tunnel_id: i64,
    writer: FrameWriter,
    streams: StreamMap,
    dump_dir: Option<PathBuf>,
}

#[async_trait]
impl ConnHandler<ProxyCtx> for ProxyConnHandler {
    async fn serve(&self, conn: Conn<ProxyCtx>) {
        let (stream, ctx, control) = conn.into_parts();
        let ProxyCtx { entry, mut rx } = ctx;
        let stream_id = entry.stream_id;
        let tunnel_id = self.tunnel_id;

        self.streams.insert(Arc::clone(&entry));
        info!("new proxy connection, connID {}:{}", tunnel_id, stream_id);

        let dump = match &self.dump_dir {
            Some(dir) => match DumpFiles::create(dir, tunnel_id, stream_id).await {
                Ok(files) => Some(files),
                Err(e) => {
                    warn!("create dump files err: {}, connID {}:{}", e, tunnel_id, stream_id);
                    self.streams.remove(stream_id);
                    return;
                }
            },
            None => None,
        };

        if let Err(e) = self.writer.send(&Frame::Connect { stream_id }).await {
            debug!("write tun err: {}, connID {}:{}", e, tunnel_id, stream_id);
            self.streams.remove(stream_id);
            return;
        }
        debug!("Write CmdConnect, connID {}:{}", tunnel_id, stream_id);

        let result_rx = match rx.connect_result.take() {
            Some(result_rx) => result_rx,
            None => {
                self.streams.remove(stream_id);
                return;
            }
        };
        match await_connect_result(result_rx, &control).await {
            Ok(()) => {}
            Err(reason) => {
                debug!(
                    "connect failed: {}, connID {}:{}",
                    reason, tunnel_id, stream_id
                );
                self.streams.remove(stream_id);
                return;
            }
        }

        control.set_state(ConnState::Active);
        Bridge {
            tunnel_id,
            entry,
            inbound: rx.inbound,
            writer: self.writer.clone(),
            streams: self.streams.clone(),
            dump,
            conn_closing: control.closing(),
        }
        .run(stream)
        .await;

        info!("proxy connection closed, connID {}:{}", tunnel_id, stream_id);
    }
}

async fn await_connect_result(
    result_rx: oneshot::Receiver<Option<String>>,
    control: &crate::tcp::ConnControl,
) -> Result<(), String> {
    let closing = control.closing();
    tokio::select! {
        res = result_rx => match res {
            Ok(None) => Ok(()),
            Ok(Some(err)) => Err(err),
            Err(_) => Err("session closed".to_string()),
        },
        _ = closing.cancelled() => Err("local server shutting down".to_string()),
    }
}
