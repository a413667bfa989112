//! Tunnel command frames
//!
//! Every message on the tunnel is one frame: a 1-byte command tag
//! followed by a command-specific body. All integers are big-endian;
//! strings and `Send` payloads carry a signed length prefix (16-bit for
//! strings, 64-bit for payloads). A negative prefix is malformed.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Ceiling for a single `Send` payload.
pub const MAX_SEND_LEN: usize = 16 * 1024 * 1024;
/// Ceiling for length-prefixed strings (addresses, error messages).
pub const MAX_STRING_LEN: usize = 4 * 1024;

/// Frame decode errors. Any of these terminates the session.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown command tag: {0}")]
    UnknownCommand(u8),

    #[error("negative length prefix: {0}")]
    NegativeLength(i64),

    #[error("length {len} exceeds limit {limit}")]
    LengthOverflow { len: i64, limit: usize },

    #[error("expected {expected}, got {got}")]
    UnexpectedCommand {
        expected: &'static str,
        got: &'static str,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Command tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Cmd {
    Config = 0,
    TunId = 1,
    Connect = 2,
    ConnectResult = 3,
    Send = 4,
    Close = 5,
}

impl TryFrom<u8> for Cmd {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Cmd::Config),
            1 => Ok(Cmd::TunId),
            2 => Ok(Cmd::Connect),
            3 => Ok(Cmd::ConnectResult),
            4 => Ok(Cmd::Send),
            5 => Ok(Cmd::Close),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Target "host:port" the agent should dial. Sent by the proxy
    /// right after the tunnel-id exchange.
    Config { connect_addr: String },
    /// Session id, written by the transport-listening side as the
    /// first frame on a new tunnel.
    TunId { tunnel_id: i64 },
    /// Open a logical stream. Only the proxy allocates stream ids.
    Connect { stream_id: i64 },
    /// Dial outcome for a stream; `error: None` means success.
    ConnectResult {
        stream_id: i64,
        error: Option<String>,
    },
    /// Payload bytes for a stream.
    Send { stream_id: i64, data: Bytes },
    /// The sender's end of the stream is done.
    Close { stream_id: i64 },
}

impl Frame {
    /// Command name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Config { .. } => "Config",
            Frame::TunId { .. } => "TunID",
            Frame::Connect { .. } => "Connect",
            Frame::ConnectResult { .. } => "ConnectResult",
            Frame::Send { .. } => "Send",
            Frame::Close { .. } => "Close",
        }
    }

    fn cmd(&self) -> Cmd {
        match self {
            Frame::Config { .. } => Cmd::Config,
            Frame::TunId { .. } => Cmd::TunId,
            Frame::Connect { .. } => Cmd::Connect,
            Frame::ConnectResult { .. } => Cmd::ConnectResult,
            Frame::Send { .. } => Cmd::Send,
            Frame::Close { .. } => Cmd::Close,
        }
    }

    /// Append the encoded frame to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.cmd() as u8);
        match self {
            Frame::Config { connect_addr } => put_string(buf, connect_addr),
            Frame::TunId { tunnel_id } => buf.put_i64(*tunnel_id),
            Frame::Connect { stream_id } => buf.put_i64(*stream_id),
            Frame::ConnectResult { stream_id, error } => {
                buf.put_i64(*stream_id);
                put_string(buf, error.as_deref().unwrap_or(""));
            }
            Frame::Send { stream_id, data } => {
                buf.put_i64(*stream_id);
                buf.put_i64(data.len() as i64);
                buf.put_slice(data);
            }
            Frame::Close { stream_id } => buf.put_i64(*stream_id),
        }
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf
    }

    /// Exact wire size of the encoded frame.
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Frame::Config { connect_addr } => 2 + connect_addr.len().min(MAX_STRING_LEN),
            Frame::TunId { .. } | Frame::Connect { .. } | Frame::Close { .. } => 8,
            Frame::ConnectResult { error, .. } => {
                8 + 2 + error.as_deref().map_or(0, |e| e.len().min(MAX_STRING_LEN))
            }
            Frame::Send { data, .. } => 8 + 8 + data.len(),
        }
    }

    /// Read one frame from the tunnel.
    ///
    /// EOF before the tag is an `Io` error the caller treats as the
    /// tunnel ending; EOF inside a body surfaces the same way and is a
    /// protocol violation either way.
    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame, ProtocolError> {
        let tag = r.read_u8().await?;
        match Cmd::try_from(tag)? {
            Cmd::Config => {
                let connect_addr = read_string(r).await?;
                Ok(Frame::Config { connect_addr })
            }
            Cmd::TunId => Ok(Frame::TunId {
                tunnel_id: r.read_i64().await?,
            }),
            Cmd::Connect => Ok(Frame::Connect {
                stream_id: r.read_i64().await?,
            }),
            Cmd::ConnectResult => {
                let stream_id = r.read_i64().await?;
                let msg = read_string(r).await?;
                let error = if msg.is_empty() { None } else { Some(msg) };
                Ok(Frame::ConnectResult { stream_id, error })
            }
            Cmd::Send => {
                let stream_id = r.read_i64().await?;
                let len = r.read_i64().await?;
                if len < 0 {
                    return Err(ProtocolError::NegativeLength(len));
                }
                if len as u64 > MAX_SEND_LEN as u64 {
                    return Err(ProtocolError::LengthOverflow {
                        len,
                        limit: MAX_SEND_LEN,
                    });
                }
                let mut data = vec![0u8; len as usize];
                r.read_exact(&mut data).await?;
                Ok(Frame::Send {
                    stream_id,
                    data: Bytes::from(data),
                })
            }
            Cmd::Close => Ok(Frame::Close {
                stream_id: r.read_i64().await?,
            }),
        }
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    let b = s.as_bytes();
    let b = &b[..b.len().min(MAX_STRING_LEN)];
    buf.put_i16(b.len() as i16);
    buf.put_slice(b);
}

async fn read_string<R: AsyncRead + Unpin>(r: &mut R) -> Result<String, ProtocolError> {
    let len = r.read_i16().await?;
    if len < 0 {
        return Err(ProtocolError::NegativeLength(len as i64));
    }
    if len as usize > MAX_STRING_LEN {
        return Err(ProtocolError::LengthOverflow {
            len: len as i64,
            limit: MAX_STRING_LEN,
        });
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn round_trip(frame: Frame) -> Frame {
        let encoded = frame.to_bytes();
        assert_eq!(encoded.len(), frame.encoded_len());
        let mut slice: &[u8] = &encoded;
        Frame::read(&mut slice).await.unwrap()
    }

    #[tokio::test]
    async fn frames_round_trip() {
        let frames = vec![
            Frame::Config {
                connect_addr: "127.0.0.1:9000".to_string(),
            },
            Frame::TunId { tunnel_id: 7 },
            Frame::Connect { stream_id: 1 },
            Frame::ConnectResult {
                stream_id: 1,
                error: None,
            },
            Frame::ConnectResult {
                stream_id: 2,
                error: Some("connection refused".to_string()),
            },
            Frame::Send {
                stream_id: 1,
                data: Bytes::from_static(b"hello\n"),
            },
            Frame::Send {
                stream_id: 3,
                data: Bytes::new(),
            },
            Frame::Close { stream_id: 1 },
        ];
        for frame in frames {
            assert_eq!(round_trip(frame.clone()).await, frame);
        }
    }

    #[tokio::test]
    async fn unknown_tag_is_rejected() {
        let mut slice: &[u8] = &[0x2a];
        match Frame::read(&mut slice).await {
            Err(ProtocolError::UnknownCommand(0x2a)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn oversized_send_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(Cmd::Send as u8);
        buf.put_i64(1);
        buf.put_i64(MAX_SEND_LEN as i64 + 1);
        let mut slice: &[u8] = &buf;
        assert!(matches!(
            Frame::read(&mut slice).await,
            Err(ProtocolError::LengthOverflow { .. })
        ));
    }

    #[tokio::test]
    async fn negative_length_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(Cmd::Send as u8);
        buf.put_i64(1);
        buf.put_i64(-4);
        let mut slice: &[u8] = &buf;
        assert!(matches!(
            Frame::read(&mut slice).await,
            Err(ProtocolError::NegativeLength(-4))
        ));

        let mut buf = BytesMut::new();
        buf.put_u8(Cmd::Config as u8);
        buf.put_i16(-1);
        let mut slice: &[u8] = &buf;
        assert!(matches!(
            Frame::read(&mut slice).await,
            Err(ProtocolError::NegativeLength(-1))
        ));
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let frame = Frame::Send {
            stream_id: 9,
            data: Bytes::from_static(b"truncate me"),
        };
        let encoded = frame.to_bytes();
        let mut slice: &[u8] = &encoded[..encoded.len() - 3];
        assert!(matches!(
            Frame::read(&mut slice).await,
            Err(ProtocolError::Io(_))
        ));
    }

    #[tokio::test]
    async fn corrupted_byte_never_round_trips_silently() {
        let frame = Frame::Send {
            stream_id: 5,
            data: Bytes::from_static(b"abcdefgh"),
        };
        let encoded = frame.to_bytes();
        for i in 0..encoded.len() {
            let mut corrupted = encoded.to_vec();
            corrupted[i] ^= 0x01;
            let mut slice: &[u8] = &corrupted;
            match Frame::read(&mut slice).await {
                Ok(decoded) => assert_ne!(decoded, frame, "flip at {} went unnoticed", i),
                Err(_) => {}
            }
        }
    }
}
