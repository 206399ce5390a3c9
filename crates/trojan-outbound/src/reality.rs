//! Anti-detection handshake mode.
//!
//! The client offers only X25519 and remembers its ephemeral secret for the
//! duration of one handshake. The server proves knowledge of the matching
//! private key by presenting an ed25519 certificate whose signature field is
//! `HMAC-SHA512(auth_key, cert_public_key)`, where
//! `auth_key = HKDF-SHA256(X25519(ephemeral, server_public), salt = short_id, info = "REALITY")`.
//! Chain validation is skipped; that HMAC is the trust anchor.
//!
//! rustls cannot place the short id in the ClientHello session id, so the
//! short id is bound through the HKDF salt instead.

use std::cell::RefCell;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{
    ActiveKeyExchange, CryptoProvider, SharedSecret, SupportedKxGroup, WebPkiSupportedAlgorithms,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, Error as TlsError, NamedGroup, SignatureScheme};
use sha2::{Sha256, Sha512};
use x25519_dalek::{PublicKey, StaticSecret};
use x509_parser::oid_registry::OID_SIG_ED25519;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::error::OutboundError;

const AUTH_INFO: &[u8] = b"REALITY";
pub const SHORT_ID_LEN: usize = 8;

tokio::task_local! {
    /// Ephemeral secret of the handshake running in the current dial.
    static EPHEMERAL: RefCell<Option<StaticSecret>>;
}

static RECORDING_X25519: RecordingX25519 = RecordingX25519;

/// Server public key plus the short id, zero-padded to 8 bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct RealitySettings {
    pub public_key: [u8; 32],
    pub short_id: [u8; SHORT_ID_LEN],
}

impl std::fmt::Debug for RealitySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealitySettings")
            .field("public_key", &URL_SAFE_NO_PAD.encode(self.public_key))
            .field("short_id", &hex::encode(self.short_id))
            .finish()
    }
}

impl RealitySettings {
    /// `public_key`: base64url (no padding) of 32 bytes. `short_id`: up to
    /// 16 hex characters.
    pub fn parse(public_key: &str, short_id: &str) -> Result<Self, OutboundError> {
        let key = URL_SAFE_NO_PAD
            .decode(public_key.trim())
            .map_err(|e| OutboundError::Config(format!("invalid reality public-key: {e}")))?;
        let public_key: [u8; 32] = key.as_slice().try_into().map_err(|_| {
            OutboundError::Config(format!(
                "reality public-key must be 32 bytes, got {}",
                key.len()
            ))
        })?;

        let sid = hex::decode(short_id.trim())
            .map_err(|e| OutboundError::Config(format!("invalid reality short-id: {e}")))?;
        if sid.len() > SHORT_ID_LEN {
            return Err(OutboundError::Config(format!(
                "reality short-id must be at most {SHORT_ID_LEN} bytes, got {}",
                sid.len()
            )));
        }
        let mut padded = [0u8; SHORT_ID_LEN];
        padded[..sid.len()].copy_from_slice(&sid);

        Ok(Self {
            public_key,
            short_id: padded,
        })
    }

    fn auth_key(&self, ephemeral: &StaticSecret) -> [u8; 32] {
        let shared = ephemeral.diffie_hellman(&PublicKey::from(self.public_key));
        derive_auth_key(shared.as_bytes(), &self.short_id)
    }

    /// Provider restricted to the recording X25519 group and TLS 1.3 suites.
    pub(crate) fn provider(&self, base: CryptoProvider) -> CryptoProvider {
        let cipher_suites = base
            .cipher_suites
            .iter()
            .copied()
            .filter(|s| s.version().version == rustls::ProtocolVersion::TLSv1_3)
            .collect();
        CryptoProvider {
            cipher_suites,
            kx_groups: vec![&RECORDING_X25519],
            ..base
        }
    }

    pub(crate) fn verifier(&self, algs: WebPkiSupportedAlgorithms) -> RealityVerifier {
        RealityVerifier {
            settings: self.clone(),
            algs,
        }
    }
}

/// Runs a handshake future with a fresh ephemeral-secret slot.
pub(crate) async fn scoped<F: std::future::Future>(fut: F) -> F::Output {
    EPHEMERAL.scope(RefCell::new(None), fut).await
}

fn derive_auth_key(shared: &[u8; 32], short_id: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(short_id), shared);
    let mut okm = [0u8; 32];
    // 32 bytes is far below the HKDF-SHA256 output limit
    let _ = hk.expand(AUTH_INFO, &mut okm);
    okm
}

/// Checks that the certificate signature is the HMAC of its ed25519 key.
fn verify_cert_hmac(auth_key: &[u8; 32], der: &[u8]) -> Result<(), TlsError> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|_| TlsError::General("reality: unparsable certificate".into()))?;
    let spki = cert.public_key();
    if spki.algorithm.algorithm != OID_SIG_ED25519 {
        return Err(TlsError::General("reality: certificate key is not ed25519".into()));
    }
    let mut mac = Hmac::<Sha512>::new_from_slice(auth_key)
        .map_err(|_| TlsError::General("reality: bad auth key".into()))?;
    mac.update(spki.subject_public_key.data.as_ref());
    mac.verify_slice(cert.signature_value.data.as_ref())
        .map_err(|_| TlsError::General("reality: certificate not signed by auth key".into()))
}

/// X25519 group that leaves a copy of its secret in the dial's slot.
#[derive(Debug)]
struct RecordingX25519;

impl SupportedKxGroup for RecordingX25519 {
    fn start(&self) -> Result<Box<dyn ActiveKeyExchange>, TlsError> {
        let secret = StaticSecret::random_from_rng(OsRng);
        EPHEMERAL
            .try_with(|slot| *slot.borrow_mut() = Some(secret.clone()))
            .map_err(|_| TlsError::General("reality: handshake outside dial scope".into()))?;
        let public = PublicKey::from(&secret);
        Ok(Box::new(X25519Exchange {
            secret,
            public: *public.as_bytes(),
        }))
    }

    fn name(&self) -> NamedGroup {
        NamedGroup::X25519
    }
}

struct X25519Exchange {
    secret: StaticSecret,
    public: [u8; 32],
}

impl ActiveKeyExchange for X25519Exchange {
    fn complete(self: Box<Self>, peer_pub_key: &[u8]) -> Result<SharedSecret, TlsError> {
        let peer: [u8; 32] = peer_pub_key
            .try_into()
            .map_err(|_| TlsError::from(rustls::PeerMisbehaved::InvalidKeyShare))?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer));
        if !shared.was_contributory() {
            return Err(rustls::PeerMisbehaved::InvalidKeyShare.into());
        }
        Ok(SharedSecret::from(&shared.as_bytes()[..]))
    }

    fn pub_key(&self) -> &[u8] {
        &self.public
    }

    fn group(&self) -> NamedGroup {
        NamedGroup::X25519
    }
}

#[derive(Debug)]
pub(crate) struct RealityVerifier {
    settings: RealitySettings,
    algs: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for RealityVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        let ephemeral = EPHEMERAL
            .try_with(|slot| slot.borrow_mut().take())
            .ok()
            .flatten()
            .ok_or_else(|| TlsError::General("reality: no ephemeral key for handshake".into()))?;
        verify_cert_hmac(&self.settings.auth_key(&ephemeral), end_entity.as_ref())?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        Err(TlsError::General("reality requires TLS 1.3".into()))
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algs)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algs.supported_schemes()
    }
}
