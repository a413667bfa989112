//! Per-session stream state shared by the proxy and agent cores
//!
//! A session is one connected tunnel. Both cores keep a table of live
//! streams, write frames through one serialized writer, and bridge each
//! logical stream to a local TCP connection with the same pair of
//! tasks; everything common lives here.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::counter::{human_bytes, Counter};
use crate::obfuscation::XorWriter;
use crate::protocol::{Frame, ProtocolError};
use crate::tunnel::TunnelWriter;

/// Inbound queue capacity per stream. When a local consumer stalls for
/// this many buffers, the frame dispatcher stalls with it — that is the
/// session's backpressure lever.
pub const INBOUND_QUEUE: usize = 256;

/// Read chunk for the local-to-tunnel direction.
pub const COPY_CHUNK: usize = 40 * 1024;

/// Serialized tunnel writer.
///
/// Frames are written from many tasks at once; each `send` encodes the
/// whole frame into a scratch buffer and performs a single `write_all`
/// under the lock, so frame bytes never interleave on the wire. The
/// adapter does not buffer across frames.
#[derive(Clone)]
pub struct FrameWriter {
    inner: Arc<Mutex<XorWriter<TunnelWriter>>>,
    counter: Option<Arc<dyn Counter>>,
}

impl FrameWriter {
    pub fn new(writer: TunnelWriter, seed: i64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(XorWriter::new(writer, seed))),
            counter: None,
        }
    }

    /// Attach an upload counter; `send` feeds it and log lines can show
    /// the current rate.
    pub fn with_counter(mut self, counter: Arc<dyn Counter>) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Write one frame contiguously.
    pub async fn send(&self, frame: &Frame) -> io::Result<()> {
        let buf = frame.to_bytes();
        {
            let mut writer = self.inner.lock().await;
            writer.write_all(&buf).await?;
            writer.flush().await?;
        }
        if let Some(counter) = &self.counter {
            counter.add(buf.len() as i64);
        }
        Ok(())
    }

    /// Current upload rate, if a counter is attached.
    pub fn rate_per_sec(&self) -> Option<i64> {
        self.counter.as_ref().map(|c| c.rate_per_sec())
    }
}

/// Receiver ends handed to the connection handler when a stream is
/// allocated.
pub struct StreamRx {
    pub inbound: mpsc::Receiver<Bytes>,
    pub connect_result: Option<oneshot::Receiver<Option<String>>>,
}

/// One logical stream's shared state.
///
/// Stored in the session's [`StreamMap`] and shared between the frame
/// dispatcher and the stream's bridge tasks.
pub struct StreamEntry {
    pub stream_id: i64,
    inbound: mpsc::Sender<Bytes>,
    close: CancellationToken,
    connect_result: StdMutex<Option<oneshot::Sender<Option<String>>>>,
}

impl StreamEntry {
    /// Allocate a stream. `with_connect_slot` is set on the proxy side,
    /// which awaits the agent's `ConnectResult`.
    pub fn new(stream_id: i64, with_connect_slot: bool) -> (Arc<Self>, StreamRx) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (slot_tx, slot_rx) = if with_connect_slot {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let entry = Arc::new(Self {
            stream_id,
            inbound: inbound_tx,
            close: CancellationToken::new(),
            connect_result: StdMutex::new(slot_tx),
        });
        (
            entry,
            StreamRx {
                inbound: inbound_rx,
                connect_result: slot_rx,
            },
        )
    }

    /// Queue bytes for the local TCP endpoint. Suspends while the queue
    /// is full; returns false when the bridge is gone.
    pub async fn push_data(&self, data: Bytes) -> bool {
        self.inbound.send(data).await.is_ok()
    }

    /// Signal that the peer closed its end.
    pub fn signal_close(&self) {
        self.close.cancel();
    }

    /// Token fired by [`signal_close`](Self::signal_close).
    pub fn close_signal(&self) -> CancellationToken {
        self.close.clone()
    }

    pub fn close_received(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Fill the connect-result slot. Filling it twice means the peer
    /// sent two `ConnectResult` frames for one stream, which terminates
    /// the session.
    pub fn deliver_connect_result(&self, result: Option<String>) -> crate::Result<()> {
        let slot = {
            let mut guard = match self.connect_result.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };
        match slot {
            Some(tx) => {
                // A dropped receiver just means the local side already
                // gave up on the connection.
                let _ = tx.send(result);
                Ok(())
            }
            None => Err(crate::Error::Invariant(format!(
                "duplicate ConnectResult for stream {}",
                self.stream_id
            ))),
        }
    }
}

/// Concurrently accessed `stream_id -> StreamEntry` table.
#[derive(Clone, Default)]
pub struct StreamMap {
    inner: Arc<StdMutex<HashMap<i64, Arc<StreamEntry>>>>,
}

impl StreamMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Arc<StreamEntry>>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn insert(&self, entry: Arc<StreamEntry>) {
        self.lock().insert(entry.stream_id, entry);
    }

    pub fn get(&self, stream_id: i64) -> Option<Arc<StreamEntry>> {
        self.lock().get(&stream_id).cloned()
    }

    pub fn remove(&self, stream_id: i64) -> Option<Arc<StreamEntry>> {
        self.lock().remove(&stream_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Fire every stream's close signal and clear the table. Called at
    /// session teardown so bridges blocked on local reads wake up.
    pub fn close_all(&self) {
        let drained: Vec<_> = self.lock().drain().map(|(_, entry)| entry).collect();
        for entry in drained {
            entry.signal_close();
        }
    }
}

/// Raw capture of one stream's two directions.
pub struct DumpFiles {
    /// Bytes read from the local TCP endpoint (toward the tunnel).
    pub read: tokio::fs::File,
    /// Bytes written to the local TCP endpoint (from the tunnel).
    pub write: tokio::fs::File,
}

impl DumpFiles {
    /// Lazily create `{dump_dir}/{tunnel_id}/{stream_id}/{read,write}.dmp`.
    pub async fn create(dump_dir: &Path, tunnel_id: i64, stream_id: i64) -> io::Result<Self> {
        let dir: PathBuf = dump_dir.join(tunnel_id.to_string()).join(stream_id.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            read: tokio::fs::File::create(dir.join("read.dmp")).await?,
            write: tokio::fs::File::create(dir.join("write.dmp")).await?,
        })
    }
}

/// Exchange the `TunID` frame on a fresh tunnel: the transport listener
/// writes it as the tunnel's first frame, the dialer reads it.
pub async fn sync_tunnel_id<R: AsyncRead + Unpin>(
    is_listener: bool,
    tunnel_id: i64,
    reader: &mut R,
    writer: &FrameWriter,
) -> crate::Result<i64> {
    if is_listener {
        writer.send(&Frame::TunId { tunnel_id }).await?;
        debug!("Write CmdTunID, tunID {}", tunnel_id);
        return Ok(tunnel_id);
    }
    match Frame::read(reader).await? {
        Frame::TunId { tunnel_id } => {
            debug!("Read CmdTunID, tunID {}", tunnel_id);
            Ok(tunnel_id)
        }
        other => Err(ProtocolError::UnexpectedCommand {
            expected: "TunID",
            got: other.name(),
        }
        .into()),
    }
}

/// Everything a stream bridge needs besides the TCP connection itself.
pub struct Bridge {
    pub tunnel_id: i64,
    pub entry: Arc<StreamEntry>,
    pub inbound: mpsc::Receiver<Bytes>,
    pub writer: FrameWriter,
    pub streams: StreamMap,
    pub dump: Option<DumpFiles>,
    /// Fabric shutdown signal for this connection.
    pub conn_closing: CancellationToken,
}

impl Bridge {
    /// Pump bytes both ways between the tunnel and a local TCP
    /// connection until either side finishes.
    ///
    /// Teardown removes the stream from the session table, stops the
    /// tunnel-to-local task, and sends `Close` unless the peer closed
    /// first.
    pub async fn run(self, stream: TcpStream) {
        let Bridge {
            tunnel_id,
            entry,
            mut inbound,
            writer,
            streams,
            dump,
            conn_closing,
        } = self;
        let stream_id = entry.stream_id;
        let (mut read_half, mut write_half) = stream.into_split();
        let (mut read_dump, mut write_dump) = match dump {
            Some(files) => (Some(files.read), Some(files.write)),
            None => (None, None),
        };

        let done = CancellationToken::new();
        let tunnel_to_local = {
            let close = entry.close_signal();
            let done = done.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        data = inbound.recv() => {
                            let data = match data {
                                Some(data) => data,
                                None => return,
                            };
                            if let Err(e) = write_half.write_all(&data).await {
                                debug!(
                                    "write conn err: {}, connID {}:{}",
                                    e, tunnel_id, stream_id
                                );
                                return;
                            }
                            if let Some(f) = write_dump.as_mut() {
                                if let Err(e) = f.write_all(&data).await {
                                    warn!("write dump file err: {}", e);
                                }
                            }
                        }
                        _ = close.cancelled() => {
                            // Sends precede the Close on the ordered
                            // tunnel; flush whatever is still queued.
                            while let Ok(data) = inbound.try_recv() {
                                if write_half.write_all(&data).await.is_err() {
                                    break;
                                }
                                if let Some(f) = write_dump.as_mut() {
                                    if let Err(e) = f.write_all(&data).await {
                                        warn!("write dump file err: {}", e);
                                    }
                                }
                            }
                            let _ = write_half.shutdown().await;
                            return;
                        }
                        _ = done.cancelled() => return,
                    }
                }
            })
        };

        let close = entry.close_signal();
        let mut buf = vec![0u8; COPY_CHUNK];
        loop {
            let n = tokio::select! {
                res = read_half.read(&mut buf) => match res {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        if entry.close_received() {
                            debug!(
                                "read conn abort: peer closed, connID {}:{}",
                                tunnel_id, stream_id
                            );
                        } else {
                            debug!("read conn err: {}, connID {}:{}", e, tunnel_id, stream_id);
                        }
                        break;
                    }
                },
                // Peer closed: abort the pending local read.
                _ = close.cancelled() => break,
                _ = conn_closing.cancelled() => break,
            };

            if let Some(f) = read_dump.as_mut() {
                if let Err(e) = f.write_all(&buf[..n]).await {
                    warn!("write dump file err: {}", e);
                }
            }

            let frame = Frame::Send {
                stream_id,
                data: Bytes::copy_from_slice(&buf[..n]),
            };
            if let Err(e) = writer.send(&frame).await {
                debug!("write tun err: {}, connID {}:{}", e, tunnel_id, stream_id);
                break;
            }
            match writer.rate_per_sec() {
                Some(rate) => trace!(
                    "Write CmdSend, connID {}:{}, {} bytes, upload {}/s",
                    tunnel_id,
                    stream_id,
                    n,
                    human_bytes(rate.max(0) as u64)
                ),
                None => trace!(
                    "Write CmdSend, connID {}:{}, {} bytes",
                    tunnel_id,
                    stream_id,
                    n
                ),
            }
        }

        streams.remove(stream_id);
        done.cancel();
        let _ = tunnel_to_local.await;

        if !entry.close_received() {
            if let Err(e) = writer.send(&Frame::Close { stream_id }).await {
                debug!("write tun err: {}, connID {}:{}", e, tunnel_id, stream_id);
            } else {
                debug!("Write CmdClose, connID {}:{}", tunnel_id, stream_id);
            }
        }
    }
}
