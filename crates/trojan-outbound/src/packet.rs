//! Datagrams framed over a logical connection.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, trace};
use trojan_core::defaults::DEFAULT_DATAGRAM_READ_BUFFER;
use trojan_proto::{FrameError, ParseResult, TargetAddress, parse_udp_packet, write_udp_packet};

use crate::conn::LogicalConnection;
use crate::error::OutboundError;

/// Datagram view of a connection opened with the UDP-associate command.
///
/// Senders and receivers may run concurrently; each side is serialized on
/// its own lock so a frame is never interleaved with another.
pub struct PacketConnection {
    reader: Mutex<FrameReader>,
    writer: Mutex<WriteHalf<LogicalConnection>>,
    closed: AtomicBool,
}

struct FrameReader {
    io: ReadHalf<LogicalConnection>,
    buf: BytesMut,
}

impl PacketConnection {
    pub fn new(conn: LogicalConnection) -> Self {
        let (read, write) = tokio::io::split(conn);
        Self {
            reader: Mutex::new(FrameReader {
                io: read,
                buf: BytesMut::with_capacity(DEFAULT_DATAGRAM_READ_BUFFER),
            }),
            writer: Mutex::new(write),
            closed: AtomicBool::new(false),
        }
    }

    /// Sends `payload` to `target` as one frame in one write.
    pub async fn send_to(
        &self,
        payload: &[u8],
        target: &TargetAddress,
    ) -> Result<usize, OutboundError> {
        if self.is_closed() {
            return Err(OutboundError::Closed);
        }
        let mut frame = BytesMut::new();
        write_udp_packet(&mut frame, &target.as_ref(), payload)
            .map_err(|e| OutboundError::Protocol(FrameError::Write(e)))?;

        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        trace!(%target, len = payload.len(), "datagram sent");
        Ok(payload.len())
    }

    /// Reads exactly one frame.
    ///
    /// A stream ending on a frame boundary yields [`OutboundError::Closed`];
    /// ending inside a frame is a protocol error. Any error tears the
    /// connection down: there is no resynchronization after a bad frame.
    pub async fn recv_from(&self) -> Result<(Bytes, TargetAddress), OutboundError> {
        if self.is_closed() {
            return Err(OutboundError::Closed);
        }
        let result = self.reader.lock().await.read_frame().await;
        if let Err(e) = &result {
            debug!(error = %e, error_type = e.error_type(), "datagram stream torn down");
            if let Err(e) = self.shutdown_writer().await {
                trace!(error = %e, "shutdown after read error failed");
            }
        }
        result
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Shuts the write side down. Safe to call more than once.
    pub async fn close(&self) -> Result<(), OutboundError> {
        self.shutdown_writer().await.map_err(Into::into)
    }

    async fn shutdown_writer(&self) -> std::io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        match writer.shutdown().await {
            Err(e) if e.kind() != std::io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

impl FrameReader {
    async fn read_frame(&mut self) -> Result<(Bytes, TargetAddress), OutboundError> {
        loop {
            let need = match parse_udp_packet(&self.buf) {
                ParseResult::Complete(packet) => {
                    let source = TargetAddress::from_ref(&packet.address)
                        .map_err(|e| OutboundError::Protocol(e.into()))?;
                    let offset = packet.packet_len - packet.length;
                    let consumed = packet.packet_len;
                    self.buf.advance(offset);
                    let payload = self.buf.split_to(consumed - offset).freeze();
                    trace!(source = %source, len = payload.len(), "datagram received");
                    return Ok((payload, source));
                }
                ParseResult::Incomplete(need) => need,
                ParseResult::Invalid(e) => return Err(OutboundError::Protocol(e.into())),
            };

            self.buf.reserve(need.saturating_sub(self.buf.len()).max(1024));
            if self.io.read_buf(&mut self.buf).await? == 0 {
                if self.buf.is_empty() {
                    return Err(OutboundError::Closed);
                }
                return Err(OutboundError::Protocol(FrameError::Truncated {
                    have: self.buf.len(),
                    need,
                }));
            }
        }
    }
}

impl std::fmt::Debug for PacketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketConnection")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::NegotiatedStream;
    use crate::context::DialContext;
    use tokio::io::{DuplexStream, duplex};
    use trojan_proto::{Command, parse_request, sha224_hex};

    async fn associate() -> (PacketConnection, DuplexStream, usize) {
        let (client, server) = duplex(1 << 20);
        let target: TargetAddress = "0.0.0.0:0".parse().unwrap();
        let conn = NegotiatedStream::new(Box::new(client), "peer")
            .finalize(&DialContext::new(), &sha224_hex("pw"), Command::UdpAssociate, &target)
            .await
            .unwrap();
        let header_len = 56 + 2 + 1 + 7 + 2;
        (PacketConnection::new(conn), server, header_len)
    }

    #[tokio::test]
    async fn send_writes_one_frame() {
        let (pc, mut server, header_len) = associate().await;
        let target: TargetAddress = "8.8.8.8:53".parse().unwrap();
        pc.send_to(b"query", &target).await.unwrap();
        pc.close().await.unwrap();

        let mut wire = Vec::new();
        server.read_to_end(&mut wire).await.unwrap();
        let ParseResult::Complete(req) = parse_request(&wire) else {
            panic!("no header");
        };
        assert_eq!(req.header_len, header_len);
        assert_eq!(
            req.payload,
            &[0x01, 8, 8, 8, 8, 0x00, 0x35, 0x00, 0x05, b'\r', b'\n', b'q', b'u', b'e', b'r', b'y'][..]
        );
    }

    #[tokio::test]
    async fn recv_reads_frames_in_order() {
        let (pc, mut server, _) = associate().await;
        let src: TargetAddress = "dns.example:53".parse().unwrap();
        let mut wire = BytesMut::new();
        write_udp_packet(&mut wire, &src.as_ref(), b"first").unwrap();
        write_udp_packet(&mut wire, &src.as_ref(), b"").unwrap();
        write_udp_packet(&mut wire, &src.as_ref(), &[7u8; 3000]).unwrap();
        // split across writes to exercise reassembly
        let (a, b) = wire.split_at(10);
        server.write_all(a).await.unwrap();
        server.write_all(b).await.unwrap();
        drop(server);

        let (p, s) = pc.recv_from().await.unwrap();
        assert_eq!((&p[..], &s), (&b"first"[..], &src));
        assert!(pc.recv_from().await.unwrap().0.is_empty());
        assert_eq!(pc.recv_from().await.unwrap().0.len(), 3000);
        assert!(matches!(pc.recv_from().await, Err(OutboundError::Closed)));
    }

    #[tokio::test]
    async fn eof_mid_frame_is_protocol_error() {
        let (pc, mut server, _) = associate().await;
        let src: TargetAddress = "1.1.1.1:53".parse().unwrap();
        let mut wire = BytesMut::new();
        write_udp_packet(&mut wire, &src.as_ref(), b"abcdef").unwrap();
        server.write_all(&wire[..wire.len() - 2]).await.unwrap();
        drop(server);

        let err = pc.recv_from().await.unwrap_err();
        assert!(matches!(
            err,
            OutboundError::Protocol(FrameError::Truncated { .. })
        ));
        assert!(pc.is_closed());
    }

    #[tokio::test]
    async fn invalid_frame_is_protocol_error() {
        let (pc, mut server, _) = associate().await;
        server.write_all(&[0x09, 0, 0, 0, 0, 0, 0]).await.unwrap();
        let err = pc.recv_from().await.unwrap_err();
        assert!(matches!(err, OutboundError::Protocol(FrameError::Invalid(_))));
    }

    #[tokio::test]
    async fn bad_frame_tears_connection_down() {
        let (pc, mut server, header_len) = associate().await;
        server.write_all(&[0x09, 0, 0, 0, 0, 0, 0]).await.unwrap();
        assert!(matches!(
            pc.recv_from().await,
            Err(OutboundError::Protocol(FrameError::Invalid(_)))
        ));
        assert!(pc.is_closed());

        let target: TargetAddress = "8.8.8.8:53".parse().unwrap();
        assert!(matches!(pc.send_to(b"late query", &target).await, Err(OutboundError::Closed)));
        assert!(matches!(pc.recv_from().await, Err(OutboundError::Closed)));
        // close after teardown stays a no-op
        pc.close().await.unwrap();

        // peer sees the header and then EOF, nothing after the bad frame
        let mut wire = Vec::new();
        server.read_to_end(&mut wire).await.unwrap();
        assert_eq!(wire.len(), header_len);
    }

    #[tokio::test]
    async fn oversized_payload_rejected() {
        let (pc, _server, _) = associate().await;
        let target: TargetAddress = "8.8.8.8:53".parse().unwrap();
        let err = pc.send_to(&vec![0u8; 65536], &target).await.unwrap_err();
        assert!(matches!(err, OutboundError::Protocol(FrameError::Write(_))));
        pc.send_to(&vec![0u8; 65535], &target).await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (pc, _server, _) = associate().await;
        pc.close().await.unwrap();
        pc.close().await.unwrap();
        let target: TargetAddress = "8.8.8.8:53".parse().unwrap();
        assert!(matches!(pc.send_to(b"x", &target).await, Err(OutboundError::Closed)));
    }
}
