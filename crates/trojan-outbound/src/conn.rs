//! Negotiated streams and the logical connections built on them.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, trace};
use trojan_proto::{Command, TargetAddress, write_request_header};

use crate::context::DialContext;
use crate::error::{OutboundError, Stage};

/// Any byte stream a transport can hand back.
pub trait TransportStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TransportStream for T {}

pub type BoxedStream = Box<dyn TransportStream>;

/// Lifecycle of a [`LogicalConnection`].
///
/// A connection exists only once its header is out. The dial steps before
/// that (connect, handshake, header write) are reported through [`Stage`]
/// on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    HeaderSent,
    Streaming,
    Closed,
}

/// A transport that finished its handshake but carries no header yet.
pub struct NegotiatedStream {
    stream: BoxedStream,
    peer: String,
}

impl NegotiatedStream {
    pub fn new(stream: BoxedStream, peer: impl Into<String>) -> Self {
        Self {
            stream,
            peer: peer.into(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Writes the request header and flushes it.
    ///
    /// Consumes the stream, so the header goes out exactly once and before
    /// any payload.
    pub async fn finalize(
        mut self,
        ctx: &DialContext,
        hash_hex: &str,
        command: Command,
        target: &TargetAddress,
    ) -> Result<LogicalConnection, OutboundError> {
        let mut header = BytesMut::new();
        write_request_header(&mut header, hash_hex.as_bytes(), command, &target.as_ref())
            .map_err(|e| OutboundError::Protocol(e.into()))?;

        let stream = &mut self.stream;
        ctx.run(Stage::Header, async move {
            stream.write_all(&header).await.map_err(OutboundError::Header)?;
            stream.flush().await.map_err(OutboundError::Header)
        })
        .await?;

        debug!(peer = %self.peer, %target, ?command, "request header sent");
        Ok(LogicalConnection {
            stream: self.stream,
            peer: self.peer,
            target: target.clone(),
            command,
            state: ConnState::HeaderSent,
        })
    }
}

impl fmt::Debug for NegotiatedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiatedStream")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Tunnel to one target, header already written.
pub struct LogicalConnection {
    stream: BoxedStream,
    peer: String,
    target: TargetAddress,
    command: Command,
    state: ConnState,
}

impl LogicalConnection {
    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn target(&self) -> &TargetAddress {
        &self.target
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    /// Shuts the stream down. Calling it again is a no-op.
    pub async fn close(&mut self) -> io::Result<()> {
        if self.state == ConnState::Closed {
            return Ok(());
        }
        self.state = ConnState::Closed;
        trace!(peer = %self.peer, target = %self.target, "closing connection");
        match self.stream.shutdown().await {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }

    fn mark_streaming(&mut self) {
        if self.state == ConnState::HeaderSent {
            self.state = ConnState::Streaming;
        }
    }
}

impl fmt::Debug for LogicalConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalConnection")
            .field("peer", &self.peer)
            .field("target", &self.target)
            .field("command", &self.command)
            .field("state", &self.state)
            .finish()
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed")
}

impl AsyncRead for LogicalConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.state == ConnState::Closed {
            return Poll::Ready(Ok(()));
        }
        this.mark_streaming();
        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for LogicalConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.state == ConnState::Closed {
            return Poll::Ready(Err(closed_error()));
        }
        this.mark_streaming();
        Pin::new(&mut this.stream).poll_write(cx, data)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.state == ConnState::Closed {
            return Poll::Ready(Err(closed_error()));
        }
        this.mark_streaming();
        Pin::new(&mut this.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.state == ConnState::Closed {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.state == ConnState::Closed {
            return Poll::Ready(Ok(()));
        }
        // write half only; reads continue until the peer finishes
        Pin::new(&mut this.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, duplex};
    use trojan_proto::{ParseResult, parse_request, sha224_hex};

    #[tokio::test]
    async fn header_precedes_payload() {
        let (client, mut server) = duplex(1024);
        let hash = sha224_hex("password");
        let target: TargetAddress = "example.com:443".parse().unwrap();

        let mut conn = NegotiatedStream::new(Box::new(client), "peer")
            .finalize(&DialContext::new(), &hash, Command::Connect, &target)
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnState::HeaderSent);

        conn.write_all(b"hello").await.unwrap();
        assert_eq!(conn.state(), ConnState::Streaming);
        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert!(conn.is_closed());

        let mut wire = Vec::new();
        server.read_to_end(&mut wire).await.unwrap();
        let ParseResult::Complete(req) = parse_request(&wire) else {
            panic!("header did not parse");
        };
        assert_eq!(req.hash, hash.as_bytes());
        assert_eq!(req.command, Command::Connect);
        assert_eq!(req.address.port, 443);
        assert_eq!(req.payload, b"hello");
    }

    #[tokio::test]
    async fn write_after_close_fails() {
        let (client, _server) = duplex(1024);
        let target: TargetAddress = "1.2.3.4:53".parse().unwrap();
        let mut conn = NegotiatedStream::new(Box::new(client), "peer")
            .finalize(&DialContext::new(), &sha224_hex("x"), Command::UdpAssociate, &target)
            .await
            .unwrap();
        conn.close().await.unwrap();
        let err = conn.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        let mut buf = [0u8; 4];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn bad_hash_is_rejected_before_writing() {
        let (client, mut server) = duplex(1024);
        let target: TargetAddress = "1.2.3.4:53".parse().unwrap();
        let err = NegotiatedStream::new(Box::new(client), "peer")
            .finalize(&DialContext::new(), "short", Command::Connect, &target)
            .await
            .unwrap_err();
        assert!(matches!(err, OutboundError::Protocol(_)));
        let mut wire = Vec::new();
        server.read_to_end(&mut wire).await.unwrap();
        assert!(wire.is_empty());
    }

    #[tokio::test]
    async fn header_write_failure_is_tagged() {
        let (client, server) = duplex(1024);
        drop(server);
        let target: TargetAddress = "1.2.3.4:53".parse().unwrap();
        let err = NegotiatedStream::new(Box::new(client), "peer")
            .finalize(&DialContext::new(), &sha224_hex("x"), Command::Connect, &target)
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Header));
    }

    #[tokio::test]
    async fn cancel_during_header_write_closes_stream() {
        // smaller than the header, so the write blocks until the peer reads
        let (client, mut server) = duplex(8);
        let token = tokio_util::sync::CancellationToken::new();
        let ctx = DialContext::with_cancel(token.clone());
        let target: TargetAddress = "example.com:443".parse().unwrap();

        let dial = tokio::spawn(async move {
            NegotiatedStream::new(Box::new(client), "peer")
                .finalize(&ctx, &sha224_hex("x"), Command::Connect, &target)
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!dial.is_finished());
        token.cancel();

        let err = dial.await.unwrap().unwrap_err();
        assert!(matches!(err, OutboundError::Cancelled { stage: Stage::Header }));

        // partial header, then EOF: the stream went down with the dial
        let mut wire = Vec::new();
        server.read_to_end(&mut wire).await.unwrap();
        assert_eq!(wire.len(), 8);
    }
}
