#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_rustls::TlsAcceptor;
use trojan_outbound::{CertPin, Endpoint, TransportMode};
use trojan_proto::{ParseResult, parse_request};

pub struct TestCert {
    pub der: CertificateDer<'static>,
    pub key_der: Vec<u8>,
    pub pem: String,
}

impl TestCert {
    pub fn generate() -> Self {
        use rcgen::{CertificateParams, KeyPair, PKCS_ECDSA_P256_SHA256};

        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.subject_alt_names.push(rcgen::SanType::IpAddress(IpAddr::V4(
            Ipv4Addr::new(127, 0, 0, 1),
        )));
        let cert = params.self_signed(&key_pair).unwrap();
        Self {
            der: cert.der().clone(),
            key_der: key_pair.serialize_der(),
            pem: cert.pem(),
        }
    }

    pub fn pin(&self) -> CertPin {
        CertPin::from_der(self.der.as_ref())
    }

    pub fn acceptor(&self, alpn: &[&[u8]]) -> TlsAcceptor {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()));
        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![self.der.clone()], key)
            .unwrap();
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        TlsAcceptor::from(Arc::new(config))
    }
}

/// Endpoint on 127.0.0.1 trusting exactly `cert`.
pub fn pinned_endpoint(port: u16, password: &str, cert: &TestCert, transport: TransportMode) -> Endpoint {
    let mut ep = Endpoint::new("127.0.0.1", port, password);
    ep.sni = Some("localhost".into());
    ep.fingerprint = Some(cert.pin());
    ep.transport = transport;
    ep
}

/// Reads until a full request header is buffered. Returns the buffer and
/// the header length.
pub async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> (Vec<u8>, usize) {
    let mut buf = Vec::new();
    loop {
        match parse_request(&buf) {
            ParseResult::Complete(req) => {
                let header_len = req.header_len;
                return (buf, header_len);
            }
            ParseResult::Incomplete(_) => {}
            ParseResult::Invalid(e) => panic!("malformed request header: {e}"),
        }
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "stream ended before a full header ({} bytes)", buf.len());
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Counts non-overlapping occurrences of `needle` in `haystack`.
pub fn occurrences(haystack: &[u8], needle: &[u8]) -> usize {
    let mut count = 0;
    let mut i = 0;
    while i + needle.len() <= haystack.len() {
        if &haystack[i..i + needle.len()] == needle {
            count += 1;
            i += needle.len();
        } else {
            i += 1;
        }
    }
    count
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_test_writer()
        .try_init();
}
