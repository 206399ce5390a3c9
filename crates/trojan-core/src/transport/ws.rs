//! `AsyncRead + AsyncWrite` view of a WebSocket connection.
//!
//! Every write becomes one binary message. Reads concatenate the payloads of
//! binary and text messages; a close frame or end of stream reads as EOF.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Error as WsError, Message},
};

pub struct WsIo<S> {
    ws: WebSocketStream<S>,
    pending: Bytes,
    closed: bool,
}

impl<S> WsIo<S> {
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self {
            ws,
            pending: Bytes::new(),
            closed: false,
        }
    }

    pub fn get_ref(&self) -> &WebSocketStream<S> {
        &self.ws
    }

    pub fn into_inner(self) -> WebSocketStream<S> {
        self.ws
    }
}

impl<S> WsIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn drain_into(&mut self, buf: &mut ReadBuf<'_>) {
        let n = self.pending.remaining().min(buf.remaining());
        let chunk = self.pending.split_to(n);
        buf.put_slice(&chunk);
    }

    /// Queue a pong; tungstenite flushes it with the next write or flush.
    fn answer_ping(&mut self, cx: &mut Context<'_>, payload: Vec<u8>) -> Poll<io::Result<()>> {
        let mut ws = Pin::new(&mut self.ws);
        match ws.as_mut().poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                ws.start_send(Message::Pong(payload)).map_err(to_io)?;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(to_io(err))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S> AsyncRead for WsIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.pending.has_remaining() {
                this.drain_into(buf);
                return Poll::Ready(Ok(()));
            }
            if this.closed {
                return Poll::Ready(Ok(()));
            }
            let msg = match Pin::new(&mut this.ws).poll_next(cx) {
                Poll::Ready(Some(Ok(msg))) => msg,
                Poll::Ready(Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)))
                | Poll::Ready(None) => {
                    this.closed = true;
                    continue;
                }
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Err(to_io(err))),
                Poll::Pending => return Poll::Pending,
            };
            match msg {
                Message::Binary(data) => this.pending = Bytes::from(data),
                Message::Text(text) => this.pending = Bytes::from(text.into_bytes()),
                Message::Ping(payload) => {
                    if let Poll::Ready(Err(err)) = this.answer_ping(cx, payload) {
                        return Poll::Ready(Err(err));
                    }
                }
                Message::Close(_) => this.closed = true,
                Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }
}

impl<S> AsyncWrite for WsIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let mut ws = Pin::new(&mut self.ws);
        match ws.as_mut().poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                ws.start_send(Message::Binary(data.to_vec()))
                    .map_err(to_io)?;
                Poll::Ready(Ok(data.len()))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(to_io(err))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.ws).poll_flush(cx).map_err(to_io)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match Pin::new(&mut self.ws).poll_close(cx) {
            Poll::Ready(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                Poll::Ready(Ok(()))
            }
            other => other.map_err(to_io),
        }
    }
}

fn to_io(err: WsError) -> io::Error {
    match err {
        WsError::Io(e) => e,
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            io::Error::new(io::ErrorKind::BrokenPipe, err)
        }
        other => io::Error::other(other),
    }
}
