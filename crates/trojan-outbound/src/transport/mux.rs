//! gRPC "gun" streams over a shared HTTP/2 connection.
//!
//! Each virtual stream is one `POST /{service}/Tun` request. Payload travels
//! as length-prefixed gRPC messages wrapping a single protobuf `bytes` field:
//!
//! ```text
//! 0x00 | u32 BE message len | 0x0A | varint data len | data
//! ```

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker, ready};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use h2::client::{Connection, ResponseFuture, SendRequest};
use h2::{RecvStream, SendStream};
use http::{Method, Request, StatusCode, header};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};
use trojan_core::defaults::{GRPC_USER_AGENT, MAX_GRPC_MESSAGE_BYTES};

use crate::conn::BoxedStream;
use crate::context::DialContext;
use crate::error::{BoxError, OutboundError, Stage};

use super::ws::host_authority;

const GRPC_HEADER_LEN: usize = 5;
const PROTO_BYTES_TAG: u8 = 0x0A;
/// Largest payload packed into one gun message by a single write.
const MAX_WRITE_CHUNK: usize = 32 * 1024;

type H2Connection = Connection<BoxedStream, Bytes>;

/// Aborts the shared connection's driver task when the session goes away.
struct DriverGuard(JoinHandle<()>);

impl Drop for DriverGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// The shared HTTP/2 connection and its driver task.
struct Physical {
    send: SendRequest<Bytes>,
    _driver: DriverGuard,
}

impl Physical {
    async fn establish(
        ctx: &DialContext,
        io: BoxedStream,
        peer: &str,
    ) -> Result<Self, OutboundError> {
        let (send, connection) = h2_handshake(ctx, io, peer).await?;
        let peer_owned = peer.to_string();
        let driver = tokio::spawn(async move {
            match connection.await {
                Ok(()) => debug!(peer = %peer_owned, "HTTP/2 connection closed"),
                Err(e) => debug!(peer = %peer_owned, error = %e, "HTTP/2 connection error"),
            }
        });
        Ok(Self {
            send,
            _driver: DriverGuard(driver),
        })
    }

    async fn open(
        &self,
        ctx: &DialContext,
        request: Request<()>,
        peer: &str,
    ) -> Result<GunStream, OutboundError> {
        let send = self.send.clone();
        let (response, stream) = ctx
            .run(Stage::Handshake, async {
                let mut send = send
                    .ready()
                    .await
                    .map_err(|e| OutboundError::handshake(peer, e))?;
                send_request(&mut send, request, peer)
            })
            .await?;
        Ok(GunStream::new(response, stream, None))
    }
}

async fn h2_handshake(
    ctx: &DialContext,
    io: BoxedStream,
    peer: &str,
) -> Result<(SendRequest<Bytes>, H2Connection), OutboundError> {
    ctx.run(Stage::Handshake, async {
        h2::client::handshake(io)
            .await
            .map_err(|e| OutboundError::handshake(peer, e))
    })
    .await
}

fn send_request(
    send: &mut SendRequest<Bytes>,
    request: Request<()>,
    peer: &str,
) -> Result<(ResponseFuture, SendStream<Bytes>), OutboundError> {
    let opened = send
        .send_request(request, false)
        .map_err(|e| OutboundError::handshake(peer, e))?;
    trace!(peer, "gun stream opened");
    Ok(opened)
}

/// One lazily established HTTP/2 connection shared by every dial.
///
/// The first dial runs `setup` and the HTTP/2 handshake; concurrent dials
/// wait for it. A failed setup is not remembered, so the next dial tries
/// again. Once established the connection is never replaced.
pub struct MultiplexedSession {
    authority: String,
    path: String,
    physical: OnceCell<Physical>,
}

impl MultiplexedSession {
    pub fn new(service_name: &str, host: &str) -> Self {
        Self {
            authority: host_authority(host),
            path: gun_path(service_name),
            physical: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn is_established(&self) -> bool {
        self.physical.initialized()
    }

    /// Opens a virtual stream, establishing the connection first if needed.
    pub async fn open<F, Fut>(
        &self,
        ctx: &DialContext,
        peer: &str,
        setup: F,
    ) -> Result<GunStream, OutboundError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<BoxedStream, OutboundError>>,
    {
        let physical = self
            .physical
            .get_or_try_init(|| async {
                let io = setup().await?;
                let physical = Physical::establish(ctx, io, peer).await?;
                info!(peer, path = %self.path, "multiplexed session established");
                Ok::<_, OutboundError>(physical)
            })
            .await?;
        physical.open(ctx, self.request()?, peer).await
    }

    /// A single-stream session over `io`.
    ///
    /// The returned stream owns the HTTP/2 connection and polls it from its
    /// own read and write calls; no task is spawned.
    pub(crate) async fn open_private(
        &self,
        ctx: &DialContext,
        io: BoxedStream,
        peer: &str,
    ) -> Result<GunStream, OutboundError> {
        let (send, connection) = h2_handshake(ctx, io, peer).await?;
        let mut connection = Box::pin(connection);
        let request = self.request()?;
        let (response, stream) = ctx
            .run(Stage::Handshake, async {
                let mut ready = std::pin::pin!(send.ready());
                let mut send = std::future::poll_fn(|cx| {
                    if let Poll::Ready(res) = connection.as_mut().poll(cx) {
                        let err = match res {
                            Ok(()) => BoxError::from("HTTP/2 connection closed during setup"),
                            Err(e) => BoxError::from(e),
                        };
                        return Poll::Ready(Err(OutboundError::handshake(peer, err)));
                    }
                    ready
                        .as_mut()
                        .poll(cx)
                        .map_err(|e| OutboundError::handshake(peer, e))
                })
                .await?;
                // dropping the last handle lets the connection end with the stream
                send_request(&mut send, request, peer)
            })
            .await?;
        let conn = InlineConnection::new(connection, peer);
        Ok(GunStream::new(response, stream, Some(conn)))
    }

    fn request(&self) -> Result<Request<()>, OutboundError> {
        Request::builder()
            .method(Method::POST)
            .uri(format!("https://{}{}", self.authority, self.path))
            .header(header::CONTENT_TYPE, "application/grpc")
            .header(header::TE, "trailers")
            .header(header::USER_AGENT, GRPC_USER_AGENT)
            .body(())
            .map_err(|e| OutboundError::Config(format!("invalid gRPC request: {e}")))
    }
}

impl fmt::Debug for MultiplexedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiplexedSession")
            .field("authority", &self.authority)
            .field("path", &self.path)
            .field("established", &self.is_established())
            .finish()
    }
}

pub(crate) fn gun_path(service_name: &str) -> String {
    format!("/{}/Tun", service_name.trim_matches('/'))
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Read,
    Write,
}

/// Last waker seen on each side of a stream.
///
/// Split halves may be polled from different tasks, so the connection is
/// polled with a waker that wakes both.
#[derive(Default)]
struct SideWakers {
    read: Mutex<Option<Waker>>,
    write: Mutex<Option<Waker>>,
}

impl SideWakers {
    fn register(&self, side: Side, waker: &Waker) {
        let mut slot = match side {
            Side::Read => self.read.lock(),
            Side::Write => self.write.lock(),
        };
        if !slot.as_ref().is_some_and(|w| w.will_wake(waker)) {
            *slot = Some(waker.clone());
        }
    }
}

impl Wake for SideWakers {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        for slot in [&self.read, &self.write] {
            let waker = slot.lock().clone();
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }
}

/// HTTP/2 connection of a private session.
struct InlineConnection {
    conn: Pin<Box<H2Connection>>,
    wakers: Arc<SideWakers>,
    waker: Waker,
    peer: String,
}

impl InlineConnection {
    fn new(conn: Pin<Box<H2Connection>>, peer: &str) -> Self {
        let wakers = Arc::new(SideWakers::default());
        Self {
            conn,
            waker: Waker::from(wakers.clone()),
            wakers,
            peer: peer.to_string(),
        }
    }

    /// Makes whatever progress the socket allows. `Ok(true)` once the
    /// connection has finished.
    fn poll_progress(&mut self, cx: &mut Context<'_>, side: Side) -> io::Result<bool> {
        self.wakers.register(side, cx.waker());
        let mut conn_cx = Context::from_waker(&self.waker);
        match self.conn.as_mut().poll(&mut conn_cx) {
            Poll::Pending => Ok(false),
            Poll::Ready(Ok(())) => {
                debug!(peer = %self.peer, "private HTTP/2 connection closed");
                Ok(true)
            }
            Poll::Ready(Err(e)) => {
                debug!(peer = %self.peer, error = %e, "private HTTP/2 connection error");
                Err(h2_io(e))
            }
        }
    }
}

/// Byte stream over one gun request.
pub struct GunStream {
    response: Option<ResponseFuture>,
    recv: Option<RecvStream>,
    send: SendStream<Bytes>,
    /// Raw body bytes not yet decoded.
    inbound: BytesMut,
    /// Decoded payload not yet handed to the reader.
    payload: Bytes,
    recv_done: bool,
    outbound: BytesMut,
    end_sent: bool,
    /// Set for private sessions only; the shared connection has its own task.
    conn: Option<InlineConnection>,
}

impl GunStream {
    fn new(
        response: ResponseFuture,
        send: SendStream<Bytes>,
        conn: Option<InlineConnection>,
    ) -> Self {
        Self {
            response: Some(response),
            recv: None,
            send,
            inbound: BytesMut::new(),
            payload: Bytes::new(),
            recv_done: false,
            outbound: BytesMut::new(),
            end_sent: false,
            conn,
        }
    }

    /// Polls a private session's connection. Dropping it on completion or
    /// error fails the stream's pending h2 operations.
    fn drive(&mut self, cx: &mut Context<'_>, side: Side) -> io::Result<()> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(());
        };
        match conn.poll_progress(cx, side) {
            Ok(false) => Ok(()),
            Ok(true) => {
                self.conn = None;
                Ok(())
            }
            Err(e) => {
                self.conn = None;
                Err(e)
            }
        }
    }

    fn poll_body(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(response) = self.response.as_mut() {
            let response = ready!(Pin::new(response).poll(cx)).map_err(h2_io)?;
            self.response = None;
            if response.status() != StatusCode::OK {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("gun stream rejected with status {}", response.status()),
                )));
            }
            self.recv = Some(response.into_body());
        }
        let Some(recv) = self.recv.as_mut() else {
            self.recv_done = true;
            return Poll::Ready(Ok(()));
        };
        match ready!(recv.poll_data(cx)) {
            Some(Ok(data)) => {
                recv.flow_control()
                    .release_capacity(data.len())
                    .map_err(h2_io)?;
                self.inbound.extend_from_slice(&data);
            }
            Some(Err(e)) => return Poll::Ready(Err(h2_io(e))),
            None => self.recv_done = true,
        }
        Poll::Ready(Ok(()))
    }

    fn poll_push(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.outbound.is_empty() {
            self.send.reserve_capacity(self.outbound.len());
            let cap = match self.send.capacity() {
                0 => match ready!(self.send.poll_capacity(cx)) {
                    Some(Ok(n)) => n,
                    Some(Err(e)) => return Poll::Ready(Err(h2_io(e))),
                    None => return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
                },
                n => n,
            };
            if cap == 0 {
                continue;
            }
            let chunk = self.outbound.split_to(cap.min(self.outbound.len())).freeze();
            self.send.send_data(chunk, false).map_err(h2_io)?;
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for GunStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.drive(cx, Side::Read)?;
        loop {
            if !this.payload.is_empty() {
                let n = this.payload.len().min(buf.remaining());
                buf.put_slice(&this.payload.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if let Some(payload) = decode_message(&mut this.inbound)? {
                this.payload = payload;
                continue;
            }
            if this.recv_done {
                if this.inbound.is_empty() {
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "gun stream ended inside a message",
                )));
            }
            ready!(this.poll_body(cx))?;
        }
    }
}

impl AsyncWrite for GunStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.end_sent {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        this.drive(cx, Side::Write)?;
        ready!(this.poll_push(cx))?;
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let n = data.len().min(MAX_WRITE_CHUNK);
        encode_message(&mut this.outbound, &data[..n]);
        // queued; the rest goes out on flush or the next write
        if let Poll::Ready(Err(e)) = this.poll_push(cx) {
            return Poll::Ready(Err(e));
        }
        this.drive(cx, Side::Write)?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.drive(cx, Side::Write)?;
        ready!(this.poll_push(cx))?;
        this.drive(cx, Side::Write)?;
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.drive(cx, Side::Write)?;
        ready!(this.poll_push(cx))?;
        if !this.end_sent {
            this.end_sent = true;
            this.send.send_data(Bytes::new(), true).map_err(h2_io)?;
        }
        this.drive(cx, Side::Write)?;
        Poll::Ready(Ok(()))
    }
}

fn h2_io(e: h2::Error) -> io::Error {
    if e.is_io() {
        e.into_io()
            .unwrap_or_else(|| io::Error::other("HTTP/2 I/O error"))
    } else {
        io::Error::other(e)
    }
}

/// Appends one gun message carrying `data`.
pub(crate) fn encode_message(out: &mut BytesMut, data: &[u8]) {
    let varint = varint_len(data.len() as u64);
    let message_len = 1 + varint + data.len();
    out.reserve(GRPC_HEADER_LEN + message_len);
    out.put_u8(0);
    out.put_u32(message_len as u32);
    out.put_u8(PROTO_BYTES_TAG);
    put_varint(out, data.len() as u64);
    out.put_slice(data);
}

/// Takes one complete gun message off the front of `buf`.
///
/// `Ok(None)` means more bytes are needed.
pub(crate) fn decode_message(buf: &mut BytesMut) -> io::Result<Option<Bytes>> {
    if buf.len() < GRPC_HEADER_LEN {
        return Ok(None);
    }
    if buf[0] != 0 {
        return Err(invalid("compressed gRPC messages are not supported"));
    }
    let message_len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if message_len > MAX_GRPC_MESSAGE_BYTES {
        return Err(invalid("gRPC message too large"));
    }
    if buf.len() < GRPC_HEADER_LEN + message_len {
        return Ok(None);
    }
    buf.advance(GRPC_HEADER_LEN);
    let mut message = buf.split_to(message_len);
    if message.is_empty() {
        return Ok(Some(Bytes::new()));
    }
    if message[0] != PROTO_BYTES_TAG {
        return Err(invalid("unexpected protobuf field in gun message"));
    }
    message.advance(1);
    let data_len = get_varint(&mut message)?;
    if data_len != message.len() as u64 {
        return Err(invalid("gun payload length mismatch"));
    }
    Ok(Some(message.freeze()))
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn varint_len(mut v: u64) -> usize {
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

fn put_varint(out: &mut BytesMut, mut v: u64) {
    while v >= 0x80 {
        out.put_u8((v as u8 & 0x7f) | 0x80);
        v >>= 7;
    }
    out.put_u8(v as u8);
}

fn get_varint(buf: &mut BytesMut) -> io::Result<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        if buf.is_empty() {
            return Err(invalid("truncated varint"));
        }
        let b = buf.get_u8();
        value |= u64::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(invalid("varint overflow"))
}
