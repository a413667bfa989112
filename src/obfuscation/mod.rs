//! Tunnel obfuscation codec
//!
//! A reproducible keystream XOR'd byte-by-byte with the tunnel payload.
//! Both peers derive the keystream from a shared 64-bit seed; the reader
//! and writer each own an independent copy, so the streams stay aligned
//! exactly as long as neither side drops a byte.
//!
//! ## This is obfuscation, not encryption
//!
//! Anyone observing the stream who knows (or brute-forces) the 64-bit
//! seed can decode it, and nothing detects bit-flips. Deployments that
//! need confidentiality must layer TLS beneath the transport.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// LCG multiplier (Numerical Recipes 64-bit parameters).
const LCG_MULTIPLIER: u64 = 6364136223846793005;
/// LCG increment.
const LCG_INCREMENT: u64 = 1442695040888963407;

/// Deterministic keystream generator.
///
/// State update is `state = state * MULTIPLIER + INCREMENT`; each
/// keystream byte is the low 8 bits of the updated state. This exact
/// arithmetic is part of the wire protocol — two peers with the same
/// seed must produce identical byte sequences.
#[derive(Debug, Clone)]
pub struct LcgKeystream {
    state: u64,
}

impl LcgKeystream {
    /// Create a keystream seeded with the shared key.
    pub fn new(seed: i64) -> Self {
        Self { state: seed as u64 }
    }

    fn next_state(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(LCG_MULTIPLIER)
            .wrapping_add(LCG_INCREMENT);
        self.state
    }

    /// Next keystream byte.
    pub fn next_byte(&mut self) -> u8 {
        self.next_state() as u8
    }

    /// 63-bit output of the generator.
    ///
    /// Not used on the wire; kept so the generator stays a drop-in
    /// `Source64`-style primitive for tooling and tests.
    pub fn int63(&mut self) -> i64 {
        (self.next_state() >> 1) as i64
    }

    /// XOR `buf` in place with the next `buf.len()` keystream bytes.
    pub fn apply(&mut self, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            *b ^= self.next_byte();
        }
    }
}

/// Decrypting reader: XORs everything read from the inner stream.
pub struct XorReader<R> {
    inner: R,
    keystream: LcgKeystream,
}

impl<R> XorReader<R> {
    pub fn new(inner: R, seed: i64) -> Self {
        Self {
            inner,
            keystream: LcgKeystream::new(seed),
        }
    }

    /// Consume the codec, returning the inner stream.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for XorReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let filled_before = buf.filled().len();
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let me = &mut *self;
                let new = &mut buf.filled_mut()[filled_before..];
                me.keystream.apply(new);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Encrypting writer: XORs everything written to the inner stream.
///
/// Bytes handed to `poll_write` are encrypted exactly once and then
/// owed to the inner stream; a partial inner write keeps the encrypted
/// remainder pending so the keystream never double-advances.
pub struct XorWriter<W> {
    inner: W,
    keystream: LcgKeystream,
    pending: BytesMut,
}

impl<W> XorWriter<W> {
    pub fn new(inner: W, seed: i64) -> Self {
        Self {
            inner,
            keystream: LcgKeystream::new(seed),
            pending: BytesMut::new(),
        }
    }
}

impl<W: AsyncWrite + Unpin> XorWriter<W> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            let n = match Pin::new(&mut self.inner).poll_write(cx, &self.pending) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "tunnel writer closed",
                    )))
                }
                Poll::Ready(Ok(n)) => n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };
            self.pending.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for XorWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = &mut *self;

        // Earlier encrypted bytes must reach the wire first.
        match me.poll_drain(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }

        me.pending.extend_from_slice(buf);
        me.keystream.apply(&mut me.pending[..]);
        match me.poll_drain(cx) {
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            // Remainder stays pending; the caller's bytes are consumed.
            Poll::Ready(Ok(())) | Poll::Pending => {}
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = &mut *self;
        match me.poll_drain(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        Pin::new(&mut me.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = &mut *self;
        match me.poll_drain(cx) {
            Poll::Ready(Ok(())) => {}
            other => return other,
        }
        Pin::new(&mut me.inner).poll_shutdown(cx)
    }
}
