#![allow(clippy::tests_outside_test_module)]

mod common;

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use trojan_outbound::{
    DialContext, DialOptions, Endpoint, OutboundAdapter, OutboundError, Stage, TransportMode,
    TrojanAdapter,
};
use trojan_proto::{
    Command, ParseResult, TargetAddress, parse_udp_packet, sha224_hex, udp_frame_len,
    write_udp_packet,
};

use common::{TestCert, init_tracing, occurrences, pinned_endpoint, read_request};

#[ctor::ctor]
fn init_crypto() {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install aws-lc-rs crypto provider");
}

/// TLS server that forwards everything each connection sends.
async fn recording_server(cert: &TestCert) -> (u16, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let acceptor = cert.acceptor(&[b"h2", b"http/1.1"]);
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(tcp).await else {
                    return;
                };
                let mut wire = Vec::new();
                let _ = tls.read_to_end(&mut wire).await;
                let _ = tx.send(wire);
            });
        }
    });
    (port, rx)
}

#[tokio::test(flavor = "multi_thread")]
async fn header_written_once_per_connection() {
    init_tracing();
    let cert = TestCert::generate();
    let (port, mut rx) = recording_server(&cert).await;
    let adapter = TrojanAdapter::new(pinned_endpoint(port, "s3cr3t", &cert, TransportMode::Plain)).unwrap();
    let hash = sha224_hex("s3cr3t");
    let target: TargetAddress = "example.com:80".parse().unwrap();

    const N: usize = 5;
    for i in 0..N {
        let mut conn = adapter
            .dial_stream(&DialContext::new(), &target, &DialOptions::default())
            .await
            .unwrap();
        assert_eq!(conn.command(), Command::Connect);
        conn.write_all(format!("payload-{i}").as_bytes()).await.unwrap();
        conn.write_all(b" more").await.unwrap();
        conn.close().await.unwrap();
    }

    let mut expected_header = hash.as_bytes().to_vec();
    expected_header.extend_from_slice(b"\r\n\x01\x03\x0bexample.com\x00\x50\r\n");

    for _ in 0..N {
        let wire = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(wire.starts_with(&expected_header));
        assert_eq!(occurrences(&wire, hash.as_bytes()), 1);
        let body = &wire[expected_header.len()..];
        assert!(body.starts_with(b"payload-"));
        assert!(body.ends_with(b" more"));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn untrusted_certificate_fails_before_header() {
    init_tracing();
    let cert = TestCert::generate();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let acceptor = cert.acceptor(&[]);
    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        match acceptor.accept(tcp).await {
            // the client aborts the handshake, so no application byte can follow
            Ok(mut tls) => {
                let mut wire = Vec::new();
                let _ = tls.read_to_end(&mut wire).await;
                wire.len()
            }
            Err(_) => 0,
        }
    });

    let mut ep = Endpoint::new("127.0.0.1", port, "s3cr3t");
    ep.sni = Some("localhost".into());
    let adapter = TrojanAdapter::new(ep).unwrap();
    assert!(!adapter.is_insecure());
    let target: TargetAddress = "example.com:80".parse().unwrap();
    let err = adapter
        .dial_stream(&DialContext::new(), &target, &DialOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, OutboundError::Handshake { .. }), "got {err:?}");
    assert_eq!(err.stage(), Some(Stage::Handshake));
    let header_bytes = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(header_bytes, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_pin_is_handshake_error() {
    let cert = TestCert::generate();
    let other = TestCert::generate();
    let (port, _rx) = recording_server(&cert).await;
    let adapter = TrojanAdapter::new(pinned_endpoint(port, "pw", &other, TransportMode::Plain)).unwrap();
    let target: TargetAddress = "example.com:80".parse().unwrap();
    let err = adapter
        .dial_stream(&DialContext::new(), &target, &DialOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OutboundError::Handshake { .. }), "got {err:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn custom_ca_is_trusted() {
    let cert = TestCert::generate();
    let (port, mut rx) = recording_server(&cert).await;
    let dir = tempfile::tempdir().unwrap();
    let ca_path = dir.path().join("ca.pem");
    std::fs::write(&ca_path, &cert.pem).unwrap();

    let mut ep = Endpoint::new("127.0.0.1", port, "pw");
    ep.sni = Some("localhost".into());
    ep.ca = Some(ca_path);
    let adapter = TrojanAdapter::new(ep).unwrap();
    let target: TargetAddress = "10.0.0.1:22".parse().unwrap();
    let mut conn = adapter
        .dial_stream(&DialContext::new(), &target, &DialOptions::default())
        .await
        .unwrap();
    conn.close().await.unwrap();

    let wire = rx.recv().await.unwrap();
    assert_eq!(&wire[56..], b"\r\n\x01\x01\x0a\x00\x00\x01\x00\x16\r\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_mid_handshake_closes_socket() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (accepted_tx, accepted_rx) = tokio::sync::oneshot::channel();
    let server = tokio::spawn(async move {
        let (mut tcp, _) = listener.accept().await.unwrap();
        let _ = accepted_tx.send(());
        // never answer the ClientHello; wait for the client to hang up
        let mut buf = [0u8; 4096];
        loop {
            match tcp.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    let cert = TestCert::generate();
    let adapter = TrojanAdapter::new(pinned_endpoint(port, "pw", &cert, TransportMode::Plain)).unwrap();
    let cancel = CancellationToken::new();
    let ctx = DialContext::with_cancel(cancel.clone());
    let target: TargetAddress = "example.com:443".parse().unwrap();

    let dial = tokio::spawn(async move {
        adapter
            .dial_stream(&ctx, &target, &DialOptions::default())
            .await
    });
    accepted_rx.await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let err = dial.await.unwrap().unwrap_err();
    assert!(
        matches!(err, OutboundError::Cancelled { stage: Stage::Handshake }),
        "got {err:?}"
    );
    tokio::time::timeout(Duration::from_secs(2), server)
        .await
        .expect("socket still open after cancellation")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn deadline_bounds_handshake() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(tcp);
    });
    let cert = TestCert::generate();
    let adapter = TrojanAdapter::new(pinned_endpoint(port, "pw", &cert, TransportMode::Plain)).unwrap();
    let ctx = DialContext::new().timeout(Duration::from_millis(200));
    let target: TargetAddress = "example.com:443".parse().unwrap();
    let err = adapter
        .dial_stream(&ctx, &target, &DialOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OutboundError::TimedOut { stage: Stage::Handshake }));
}

#[tokio::test(flavor = "multi_thread")]
async fn datagrams_round_trip_in_order() {
    init_tracing();
    let cert = TestCert::generate();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let acceptor = cert.acceptor(&[]);
    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut tls = acceptor.accept(tcp).await.unwrap();
        let (mut buf, header_len) = read_request(&mut tls).await;
        assert_eq!(buf[58], 0x03);
        buf.drain(..header_len);

        // echo two frames back untouched
        let mut frames = Vec::new();
        let mut consumed = 0;
        while frames.len() < 2 {
            match parse_udp_packet(&buf[consumed..]) {
                ParseResult::Complete(p) => {
                    frames.push(buf[consumed..consumed + p.packet_len].to_vec());
                    consumed += p.packet_len;
                }
                ParseResult::Incomplete(_) => {
                    let mut chunk = [0u8; 4096];
                    let n = tls.read(&mut chunk).await.unwrap();
                    assert!(n > 0);
                    buf.extend_from_slice(&chunk[..n]);
                }
                ParseResult::Invalid(e) => panic!("bad frame: {e}"),
            }
        }
        for f in &frames {
            tls.write_all(f).await.unwrap();
        }
        tls.flush().await.unwrap();

        let mut rest = Vec::new();
        let _ = tls.read_to_end(&mut rest).await;
        (consumed, buf.len() - consumed + rest.len())
    });

    let adapter = TrojanAdapter::new(pinned_endpoint(port, "pw", &cert, TransportMode::Plain)).unwrap();
    let dns: TargetAddress = "8.8.8.8:53".parse().unwrap();
    let ntp: TargetAddress = "time.example:123".parse().unwrap();
    let pc = adapter
        .dial_packet(&DialContext::new(), &dns, &DialOptions::default())
        .await
        .unwrap();

    let p1 = b"first datagram".to_vec();
    let p2 = vec![0x5a; 1500];
    pc.send_to(&p1, &dns).await.unwrap();
    pc.send_to(&p2, &ntp).await.unwrap();

    let (got1, from1) = pc.recv_from().await.unwrap();
    let (got2, from2) = pc.recv_from().await.unwrap();
    assert_eq!((&got1[..], &from1), (&p1[..], &dns));
    assert_eq!((&got2[..], &from2), (&p2[..], &ntp));
    pc.close().await.unwrap();
    pc.close().await.unwrap();

    let (frames_len, trailing) = server.await.unwrap();
    assert_eq!(
        frames_len,
        udp_frame_len(&dns.as_ref(), p1.len()) + udp_frame_len(&ntp.as_ref(), p2.len())
    );
    assert_eq!(trailing, 0);

    // the wire format of one frame
    let mut one = BytesMut::new();
    write_udp_packet(&mut one, &dns.as_ref(), b"ab").unwrap();
    assert_eq!(&one[..], b"\x01\x08\x08\x08\x08\x00\x35\x00\x02\r\nab");
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_conn_context_over_caller_socket() {
    let cert = TestCert::generate();
    let (port, mut rx) = recording_server(&cert).await;
    let adapter = TrojanAdapter::new(pinned_endpoint(port, "pw", &cert, TransportMode::Plain)).unwrap();
    let raw = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let target: TargetAddress = "[2001:db8::1]:8080".parse().unwrap();

    let router: &dyn OutboundAdapter = &adapter;
    assert!(router.supports_uot());
    let conn = router
        .stream_conn_context(&DialContext::new(), Box::new(raw), &target, Command::UdpAssociate)
        .await
        .unwrap();
    let pc = router.listen_packet_on_stream_conn(conn);
    pc.close().await.unwrap();

    let wire = rx.recv().await.unwrap();
    assert_eq!(wire[58], 0x03);
    assert_eq!(wire[59], 0x04);
    assert_eq!(&wire[76..78], &8080u16.to_be_bytes());
}
