//! TLS client configuration for the endpoint.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, warn};
use trojan_core::defaults::{ALPN_H2, DEFAULT_TLS_HANDSHAKE_TIMEOUT_SECS};

use crate::context::DialContext;
use crate::endpoint::Endpoint;
use crate::error::{OutboundError, Stage};
use crate::fingerprint::{ClientFingerprint, FingerprintDefaults};
use crate::reality::{self, RealitySettings};

static TLS13_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// SHA-256 of a DER certificate the server must present.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CertPin([u8; 32]);

impl CertPin {
    pub fn from_der(der: &[u8]) -> Self {
        Self(Sha256::digest(der).into())
    }

    pub fn matches(&self, der: &[u8]) -> bool {
        Sha256::digest(der).as_slice() == self.0
    }
}

impl FromStr for CertPin {
    type Err = OutboundError;

    /// Hex, optionally `:`-separated, case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s.chars().filter(|c| *c != ':' && !c.is_whitespace()).collect();
        let bytes = hex::decode(&cleaned)
            .map_err(|e| OutboundError::Config(format!("invalid fingerprint: {e}")))?;
        let pin: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            OutboundError::Config(format!(
                "fingerprint must be a SHA-256 (32 bytes), got {} bytes",
                bytes.len()
            ))
        })?;
        Ok(Self(pin))
    }
}

impl fmt::Debug for CertPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CertPin({})", hex::encode(self.0))
    }
}

/// Which ALPN list a handshake offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlpnMode {
    /// The endpoint's configured list.
    Endpoint,
    /// `http/1.1` only, for WebSocket and HTTP upgrade.
    Http11,
    /// `h2` only, for the multiplexed transport.
    H2,
}

enum Trust {
    Roots(Arc<RootCertStore>),
    Pinned(CertPin),
    Insecure,
    Reality(RealitySettings),
}

/// Builds and caches rustls client configs for one endpoint.
///
/// Everything except the client fingerprint is fixed at construction. When
/// the endpoint names no fingerprint, the shared [`FingerprintDefaults`] is
/// read on each dial and configs are cached per resulting profile.
pub struct TlsConfigurer {
    server_name: ServerName<'static>,
    alpn: Vec<Vec<u8>>,
    trust: Trust,
    fingerprint: Option<ClientFingerprint>,
    defaults: FingerprintDefaults,
    cache: Mutex<HashMap<(ClientFingerprint, AlpnMode), Arc<ClientConfig>>>,
}

impl fmt::Debug for TlsConfigurer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfigurer")
            .field("server_name", &self.server_name)
            .field("insecure", &self.is_insecure())
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl TlsConfigurer {
    pub fn new(endpoint: &Endpoint, defaults: FingerprintDefaults) -> Result<Self, OutboundError> {
        let server_name = ServerName::try_from(endpoint.server_name().to_string())
            .map_err(|e| OutboundError::Config(format!("invalid SNI hostname: {e}")))?;

        let trust = if let Some(reality) = &endpoint.reality {
            Trust::Reality(reality.clone())
        } else if let Some(pin) = endpoint.fingerprint {
            Trust::Pinned(pin)
        } else if endpoint.skip_cert_verify {
            warn!(
                endpoint = %endpoint.name,
                "TLS certificate verification disabled; connections are open to interception"
            );
            Trust::Insecure
        } else {
            Trust::Roots(Arc::new(load_roots(endpoint)?))
        };

        let configurer = Self {
            server_name,
            alpn: endpoint.alpn.iter().map(|s| s.as_bytes().to_vec()).collect(),
            trust,
            fingerprint: endpoint.client_fingerprint,
            defaults,
            cache: Mutex::new(HashMap::new()),
        };
        // surface provider/version problems at build time
        configurer.build(configurer.effective_fingerprint(), AlpnMode::Endpoint)?;
        Ok(configurer)
    }

    pub fn server_name(&self) -> &ServerName<'static> {
        &self.server_name
    }

    /// True when certificates are accepted without any verification.
    pub fn is_insecure(&self) -> bool {
        matches!(self.trust, Trust::Insecure)
    }

    pub fn is_reality(&self) -> bool {
        matches!(self.trust, Trust::Reality(_))
    }

    /// Endpoint fingerprint, else the current process default.
    pub fn effective_fingerprint(&self) -> ClientFingerprint {
        self.fingerprint
            .or_else(|| self.defaults.get())
            .unwrap_or(ClientFingerprint::None)
    }

    /// Config for a handshake right now.
    pub fn client_config(&self, alpn: AlpnMode) -> Result<Arc<ClientConfig>, OutboundError> {
        let fp = self.effective_fingerprint();
        if let Some(cfg) = self.cache.lock().get(&(fp, alpn)) {
            return Ok(cfg.clone());
        }
        let cfg = self.build(fp, alpn)?;
        Ok(self.cache.lock().entry((fp, alpn)).or_insert(cfg).clone())
    }

    fn build(&self, fp: ClientFingerprint, alpn: AlpnMode) -> Result<Arc<ClientConfig>, OutboundError> {
        let base = fp.provider();
        let algs = base.signature_verification_algorithms;

        let (provider, versions) = match &self.trust {
            Trust::Reality(settings) => (settings.provider(base), TLS13_ONLY),
            _ => (base, rustls::ALL_VERSIONS),
        };

        let builder = ClientConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(versions)
            .map_err(|e| OutboundError::Config(format!("TLS config error: {e}")))?;

        let mut config = match &self.trust {
            Trust::Roots(roots) => builder.with_root_certificates(roots.clone()).with_no_client_auth(),
            Trust::Pinned(pin) => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(PinnedVerifier { pin: *pin, algs }))
                .with_no_client_auth(),
            Trust::Insecure => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(InsecureVerifier { algs }))
                .with_no_client_auth(),
            Trust::Reality(settings) => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(settings.verifier(algs)))
                .with_no_client_auth(),
        };

        config.alpn_protocols = match alpn {
            AlpnMode::Endpoint => self.alpn.clone(),
            AlpnMode::Http11 => vec![b"http/1.1".to_vec()],
            AlpnMode::H2 => vec![ALPN_H2.as_bytes().to_vec()],
        };
        debug!(fingerprint = %fp, ?alpn, "built TLS client config");
        Ok(Arc::new(config))
    }

    /// TLS handshake over `stream`, bounded by the dial context and the
    /// default handshake timeout.
    pub async fn connect<S>(
        &self,
        ctx: &DialContext,
        stream: S,
        alpn: AlpnMode,
        peer: &str,
    ) -> Result<TlsStream<S>, OutboundError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let connector = TlsConnector::from(self.client_config(alpn)?);
        let handshake = async {
            let fut = connector.connect(self.server_name.clone(), stream);
            let res = if self.is_reality() {
                tokio::time::timeout(handshake_timeout(), reality::scoped(fut)).await
            } else {
                tokio::time::timeout(handshake_timeout(), fut).await
            };
            match res {
                Ok(Ok(tls)) => Ok(tls),
                Ok(Err(e)) => Err(OutboundError::handshake(peer, e)),
                Err(_) => Err(OutboundError::TimedOut {
                    stage: Stage::Handshake,
                }),
            }
        };
        let tls = ctx.run(Stage::Handshake, handshake).await?;
        debug!(
            peer,
            alpn = ?tls.get_ref().1.alpn_protocol().map(String::from_utf8_lossy),
            "TLS established"
        );
        Ok(tls)
    }
}

fn handshake_timeout() -> Duration {
    Duration::from_secs(DEFAULT_TLS_HANDSHAKE_TIMEOUT_SECS)
}

fn load_roots(endpoint: &Endpoint) -> Result<RootCertStore, OutboundError> {
    let mut roots = RootCertStore::empty();
    let Some(ca_path) = &endpoint.ca else {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        return Ok(roots);
    };

    let ca_data = std::fs::read(ca_path)
        .map_err(|e| OutboundError::Config(format!("failed to read CA cert: {e}")))?;
    let certs = rustls_pemfile::certs(&mut std::io::Cursor::new(&ca_data))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| OutboundError::Config(format!("failed to parse CA cert: {e}")))?;
    if certs.is_empty() {
        return Err(OutboundError::Config(format!(
            "no certificates in {}",
            ca_path.display()
        )));
    }
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| OutboundError::Config(format!("failed to add CA cert: {e}")))?;
    }
    Ok(roots)
}

/// Accepts any certificate (skip-cert-verify).
#[derive(Debug)]
struct InsecureVerifier {
    algs: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algs.supported_schemes()
    }
}

/// Trusts exactly the pinned certificate; signatures are still checked.
#[derive(Debug)]
struct PinnedVerifier {
    pin: CertPin,
    algs: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let presented = std::iter::once(end_entity).chain(intermediates);
        for cert in presented {
            if self.pin.matches(cert.as_ref()) {
                return Ok(ServerCertVerified::assertion());
            }
        }
        Err(rustls::Error::General(
            "no presented certificate matches the pinned fingerprint".into(),
        ))
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algs)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algs.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIN_HEX: &str = "2f8ae2cd9b6bf6a3a8b9d1f0c4e5a6b7c8d9e0f1a2b3c4d5e6f708192a3b4c5d";

    fn endpoint() -> Endpoint {
        Endpoint::new("proxy.example", 443, "pw")
    }

    #[test]
    fn pin_accepts_colons_and_case() {
        let plain: CertPin = PIN_HEX.parse().unwrap();
        let colons: String = PIN_HEX
            .as_bytes()
            .chunks(2)
            .map(|c| std::str::from_utf8(c).unwrap().to_uppercase())
            .collect::<Vec<_>>()
            .join(":");
        assert_eq!(colons.parse::<CertPin>().unwrap(), plain);
        assert!("abcd".parse::<CertPin>().is_err());
        assert!("zz".repeat(32).parse::<CertPin>().is_err());
    }

    #[test]
    fn pin_matches_sha256_of_der() {
        let der = b"not really a certificate";
        let pin = CertPin::from_der(der);
        assert!(pin.matches(der));
        assert!(!pin.matches(b"other"));
    }

    #[test]
    fn skip_verify_is_reported() {
        let mut ep = endpoint();
        assert!(!TlsConfigurer::new(&ep, FingerprintDefaults::new()).unwrap().is_insecure());
        ep.skip_cert_verify = true;
        assert!(TlsConfigurer::new(&ep, FingerprintDefaults::new()).unwrap().is_insecure());
        // a pin takes precedence over skipping verification
        ep.fingerprint = Some(PIN_HEX.parse().unwrap());
        assert!(!TlsConfigurer::new(&ep, FingerprintDefaults::new()).unwrap().is_insecure());
    }

    #[test]
    fn alpn_modes() {
        let tls = TlsConfigurer::new(&endpoint(), FingerprintDefaults::new()).unwrap();
        assert_eq!(
            tls.client_config(AlpnMode::Endpoint).unwrap().alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
        assert_eq!(
            tls.client_config(AlpnMode::H2).unwrap().alpn_protocols,
            vec![b"h2".to_vec()]
        );
        assert_eq!(
            tls.client_config(AlpnMode::Http11).unwrap().alpn_protocols,
            vec![b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn default_fingerprint_is_read_late() {
        let defaults = FingerprintDefaults::new();
        let tls = TlsConfigurer::new(&endpoint(), defaults.clone()).unwrap();
        assert_eq!(tls.effective_fingerprint(), ClientFingerprint::None);
        let before = tls.client_config(AlpnMode::Endpoint).unwrap();

        defaults.set(Some(ClientFingerprint::Firefox));
        assert_eq!(tls.effective_fingerprint(), ClientFingerprint::Firefox);
        let after = tls.client_config(AlpnMode::Endpoint).unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(Arc::ptr_eq(&after, &tls.client_config(AlpnMode::Endpoint).unwrap()));

        let mut pinned = endpoint();
        pinned.client_fingerprint = Some(ClientFingerprint::Safari);
        let tls = TlsConfigurer::new(&pinned, defaults).unwrap();
        assert_eq!(tls.effective_fingerprint(), ClientFingerprint::Safari);
    }

    #[test]
    fn invalid_sni_is_config_error() {
        let mut ep = endpoint();
        ep.sni = Some("bad name with spaces".into());
        assert!(matches!(
            TlsConfigurer::new(&ep, FingerprintDefaults::new()),
            Err(OutboundError::Config(_))
        ));
    }

    #[test]
    fn missing_ca_file_is_config_error() {
        let mut ep = endpoint();
        ep.ca = Some("/nonexistent/ca.pem".into());
        assert!(matches!(
            TlsConfigurer::new(&ep, FingerprintDefaults::new()),
            Err(OutboundError::Config(_))
        ));
    }
}
