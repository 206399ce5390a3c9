//! Bare HTTP upgrade: after a `101` response the socket carries raw bytes.
//!
//! The request is written before anything else. Without fast open the caller
//! waits for the response via [`UpgradeStream::wait_response`]; with fast open
//! the response is checked on the first read instead, so the tunnel header
//! can follow the request without a round trip.

use std::fmt::Write as _;
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, Bytes, BytesMut};
use http::uri::PathAndQuery;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;
use trojan_core::defaults::DEFAULT_MAX_HTTP_HEADER_BYTES;
use trojan_core::io::PrefixedStream;

use crate::error::OutboundError;

use super::ws::{header_name, header_value, host_authority};

const HEADER_END: &[u8] = b"\r\n\r\n";

pub struct UpgradeStream<S> {
    io: PrefixedStream<S>,
    request: Bytes,
    head: Option<BytesMut>,
    peer: String,
}

impl<S> UpgradeStream<S> {
    /// Fails with a config error when the path or a header would not form a
    /// valid request.
    pub fn new(
        stream: S,
        host: &str,
        path: &str,
        extra: &[(String, String)],
        peer: &str,
    ) -> Result<Self, OutboundError> {
        Ok(Self {
            io: PrefixedStream::new(Bytes::new(), stream),
            request: build_request(host, path, extra)?,
            head: Some(BytesMut::with_capacity(512)),
            peer: peer.to_string(),
        })
    }

    pub fn is_upgraded(&self) -> bool {
        self.head.is_none()
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> UpgradeStream<S> {
    /// Sends the request and reads until the `101` response is complete.
    pub async fn wait_response(&mut self) -> Result<(), OutboundError> {
        poll_fn(|cx| self.poll_response(cx))
            .await
            .map_err(|e| OutboundError::handshake(self.peer.clone(), e))?;
        poll_fn(|cx| Pin::new(&mut self.io).poll_flush(cx))
            .await
            .map_err(|e| OutboundError::handshake(self.peer.clone(), e))
    }

    fn poll_send_request(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.request.has_remaining() {
            let n = ready!(Pin::new(&mut self.io).poll_write(cx, &self.request))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.request.advance(n);
        }
        Poll::Ready(Ok(()))
    }

    fn poll_response(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.poll_send_request(cx))?;
        if self.head.is_some() {
            ready!(Pin::new(&mut self.io).poll_flush(cx))?;
        }
        while let Some(head) = self.head.as_mut() {
            if let Some(end) = find_header_end(head) {
                let rest = head.split_off(end).freeze();
                check_status(head)?;
                trace!(peer = %self.peer, leftover = rest.len(), "upgrade response accepted");
                self.head = None;
                self.io.replay(rest);
                break;
            }
            if head.len() >= DEFAULT_MAX_HTTP_HEADER_BYTES {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "upgrade response head too large",
                )));
            }

            let mut chunk = [0u8; 1024];
            let mut buf = ReadBuf::new(&mut chunk);
            ready!(Pin::new(&mut self.io).poll_read(cx, &mut buf))?;
            if buf.filled().is_empty() {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before upgrade response",
                )));
            }
            head.extend_from_slice(buf.filled());
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for UpgradeStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_response(cx))?;
        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for UpgradeStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_send_request(cx))?;
        Pin::new(&mut this.io).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_send_request(cx))?;
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_send_request(cx))?;
        Pin::new(&mut this.io).poll_shutdown(cx)
    }
}

fn build_request(
    host: &str,
    path: &str,
    extra: &[(String, String)],
) -> Result<Bytes, OutboundError> {
    let path: PathAndQuery = path
        .parse()
        .map_err(|e| OutboundError::Config(format!("invalid upgrade path {path:?}: {e}")))?;
    let has_host = extra.iter().any(|(k, _)| k.eq_ignore_ascii_case("host"));
    let mut req = format!("GET {path} HTTP/1.1\r\n");
    if !has_host {
        let authority = host_authority(host);
        header_value(&authority)?;
        let _ = write!(req, "Host: {authority}\r\n");
    }
    req.push_str("Connection: Upgrade\r\nUpgrade: websocket\r\n");
    for (name, value) in extra {
        header_name(name)?;
        header_value(value)?;
        let _ = write!(req, "{name}: {value}\r\n");
    }
    req.push_str("\r\n");
    Ok(Bytes::from(req))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_END.len())
        .position(|w| w == HEADER_END)
        .map(|idx| idx + HEADER_END.len())
}

fn check_status(head: &[u8]) -> io::Result<()> {
    let status_line = head
        .split(|b| *b == b'\n')
        .next()
        .map(|l| String::from_utf8_lossy(l).trim_end().to_string())
        .unwrap_or_default();
    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or("");
    let code = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/1.") {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("not an HTTP response: {status_line:?}"),
        ));
    }
    if code != "101" {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("upgrade rejected: {status_line}"),
        ));
    }
    Ok(())
}
