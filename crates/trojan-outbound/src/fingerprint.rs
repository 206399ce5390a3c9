//! Client-fingerprint profiles.
//!
//! A profile fixes the order of cipher suites and key-exchange groups the
//! client offers, approximating the ClientHello of a given browser. rustls
//! does not expose extension order or GREASE, so profiles only shape what
//! the provider controls.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use rustls::SupportedCipherSuite;
use rustls::crypto::CryptoProvider;
use rustls::crypto::aws_lc_rs::{self, cipher_suite as cs, kx_group};

use crate::error::OutboundError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientFingerprint {
    Chrome,
    Firefox,
    Safari,
    Ios,
    Android,
    Edge,
    Browser360,
    QqBrowser,
    /// One browser profile picked at random when first used.
    Random,
    /// Shuffled suite and group order.
    Randomized,
    /// Provider defaults, no shaping.
    None,
}

impl ClientFingerprint {
    pub const ALL: [ClientFingerprint; 11] = [
        Self::Chrome,
        Self::Firefox,
        Self::Safari,
        Self::Ios,
        Self::Android,
        Self::Edge,
        Self::Browser360,
        Self::QqBrowser,
        Self::Random,
        Self::Randomized,
        Self::None,
    ];

    const BROWSERS: [ClientFingerprint; 8] = [
        Self::Chrome,
        Self::Firefox,
        Self::Safari,
        Self::Ios,
        Self::Android,
        Self::Edge,
        Self::Browser360,
        Self::QqBrowser,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Chrome => "chrome",
            Self::Firefox => "firefox",
            Self::Safari => "safari",
            Self::Ios => "ios",
            Self::Android => "android",
            Self::Edge => "edge",
            Self::Browser360 => "360",
            Self::QqBrowser => "qq",
            Self::Random => "random",
            Self::Randomized => "randomized",
            Self::None => "none",
        }
    }

    /// Crypto provider with this profile's suite and group order.
    pub fn provider(self) -> CryptoProvider {
        let base = aws_lc_rs::default_provider();
        let (suites, groups): (Vec<SupportedCipherSuite>, Vec<_>) = match self {
            Self::None => return base,
            Self::Random => {
                let pick = Self::BROWSERS
                    .choose(&mut rand::thread_rng())
                    .copied()
                    .unwrap_or(Self::Chrome);
                return pick.provider();
            }
            Self::Randomized => {
                let mut rng = rand::thread_rng();
                let mut suites = base.cipher_suites.clone();
                let mut groups = base.kx_groups.clone();
                suites.shuffle(&mut rng);
                groups.shuffle(&mut rng);
                (suites, groups)
            }
            Self::Chrome | Self::Android | Self::Edge | Self::Browser360 | Self::QqBrowser => (
                vec![
                    cs::TLS13_AES_128_GCM_SHA256,
                    cs::TLS13_AES_256_GCM_SHA384,
                    cs::TLS13_CHACHA20_POLY1305_SHA256,
                    cs::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
                    cs::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
                    cs::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
                    cs::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
                    cs::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
                    cs::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
                ],
                vec![kx_group::X25519, kx_group::SECP256R1, kx_group::SECP384R1],
            ),
            Self::Firefox => (
                vec![
                    cs::TLS13_AES_128_GCM_SHA256,
                    cs::TLS13_CHACHA20_POLY1305_SHA256,
                    cs::TLS13_AES_256_GCM_SHA384,
                    cs::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
                    cs::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
                    cs::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
                    cs::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
                    cs::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
                    cs::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
                ],
                vec![kx_group::X25519, kx_group::SECP256R1, kx_group::SECP384R1],
            ),
            Self::Safari | Self::Ios => (
                vec![
                    cs::TLS13_AES_128_GCM_SHA256,
                    cs::TLS13_AES_256_GCM_SHA384,
                    cs::TLS13_CHACHA20_POLY1305_SHA256,
                    cs::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
                    cs::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
                    cs::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
                    cs::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
                    cs::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
                    cs::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
                ],
                vec![kx_group::X25519, kx_group::SECP256R1, kx_group::SECP384R1],
            ),
        };
        CryptoProvider {
            cipher_suites: suites,
            kx_groups: groups,
            ..base
        }
    }
}

impl FromStr for ClientFingerprint {
    type Err = OutboundError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chrome" => Ok(Self::Chrome),
            "firefox" => Ok(Self::Firefox),
            "safari" => Ok(Self::Safari),
            "ios" => Ok(Self::Ios),
            "android" => Ok(Self::Android),
            "edge" => Ok(Self::Edge),
            "360" => Ok(Self::Browser360),
            "qq" => Ok(Self::QqBrowser),
            "random" => Ok(Self::Random),
            "randomized" => Ok(Self::Randomized),
            "none" => Ok(Self::None),
            other => Err(OutboundError::Config(format!(
                "unknown client-fingerprint: {other}"
            ))),
        }
    }
}

impl fmt::Display for ClientFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide default client fingerprint.
///
/// Adapters keep a clone and read it on every dial when their endpoint names
/// no fingerprint, so a change applies to adapters built earlier.
#[derive(Debug, Clone, Default)]
pub struct FingerprintDefaults {
    inner: Arc<RwLock<Option<ClientFingerprint>>>,
}

impl FingerprintDefaults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, fingerprint: Option<ClientFingerprint>) {
        *self.inner.write() = fingerprint;
    }

    pub fn get(&self) -> Option<ClientFingerprint> {
        *self.inner.read()
    }
}
