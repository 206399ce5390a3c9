//! Replay of bytes read past a handshake boundary.
//!
//! An HTTP upgrade response is read in chunks, so the last chunk can carry
//! the first bytes of the tunnelled stream. `PrefixedStream` hands those
//! leftover bytes back before touching the socket again.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Stream that yields `leftover` before reading from `inner`.
///
/// Writes always go straight to `inner`.
pub struct PrefixedStream<S> {
    leftover: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(leftover: Bytes, inner: S) -> Self {
        Self { leftover, inner }
    }

    /// Bytes still waiting to be replayed.
    pub fn leftover_len(&self) -> usize {
        self.leftover.len()
    }

    /// Queues `bytes` behind any leftover not yet read.
    pub fn replay(&mut self, bytes: Bytes) {
        if self.leftover.is_empty() {
            self.leftover = bytes;
        } else if !bytes.is_empty() {
            let mut joined = BytesMut::with_capacity(self.leftover.len() + bytes.len());
            joined.extend_from_slice(&self.leftover);
            joined.extend_from_slice(&bytes);
            self.leftover = joined.freeze();
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Returns the inner stream. Unread leftover bytes are discarded.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.leftover.has_remaining() {
            let n = self.leftover.len().min(buf.remaining());
            let chunk = self.leftover.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    #[tokio::test]
    async fn leftover_then_socket() {
        let (mut peer, local) = duplex(1024);
        let mut stream = PrefixedStream::new(Bytes::from_static(b"\x00\x01"), local);

        peer.write_all(b"tail").await.unwrap();
        drop(peer);

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"\x00\x01tail");
    }

    #[tokio::test]
    async fn leftover_respects_small_buffers() {
        let (_peer, local) = duplex(64);
        let mut stream = PrefixedStream::new(Bytes::from_static(b"abcdefg"), local);

        let mut buf = [0u8; 3];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf, b"abc");
        assert_eq!(stream.leftover_len(), 4);
        assert_eq!(stream.read(&mut buf).await.unwrap(), 3);
        assert_eq!(stream.read(&mut buf).await.unwrap(), 1);
        assert_eq!(&buf[..1], b"g");
        assert_eq!(stream.leftover_len(), 0);
    }

    #[tokio::test]
    async fn replay_appends_after_pending() {
        let (peer, local) = duplex(64);
        drop(peer);
        let mut stream = PrefixedStream::new(Bytes::new(), local);
        stream.replay(Bytes::from_static(b"ab"));
        stream.replay(Bytes::from_static(b"cd"));

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abcd");
    }

    #[tokio::test]
    async fn writes_bypass_leftover() {
        let (mut peer, local) = duplex(64);
        let mut stream = PrefixedStream::new(Bytes::from_static(b"ignored"), local);

        stream.write_all(b"header").await.unwrap();
        let mut buf = [0u8; 16];
        let n = peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"header");
    }
}
