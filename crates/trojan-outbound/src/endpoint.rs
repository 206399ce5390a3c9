//! Validated, immutable description of the remote endpoint.

use std::path::PathBuf;

use crate::config::TcpConfig;
use crate::dialer::DialOptions;
use crate::fingerprint::ClientFingerprint;
use crate::reality::RealitySettings;
use crate::tls::CertPin;

/// Everything the adapter needs to reach one remote server.
///
/// Built by [`EndpointConfig::build`](crate::config::EndpointConfig::build);
/// the adapter takes it by value and never mutates it.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub(crate) password: String,
    pub sni: Option<String>,
    pub alpn: Vec<String>,
    pub skip_cert_verify: bool,
    pub fingerprint: Option<CertPin>,
    pub client_fingerprint: Option<ClientFingerprint>,
    pub reality: Option<RealitySettings>,
    /// Extra trust anchors (PEM) used instead of the bundled web roots.
    pub ca: Option<PathBuf>,
    pub transport: TransportMode,
    pub udp: bool,
    /// Dial settings applied to every fresh connection.
    pub dial: DialOptions,
    pub tcp: TcpConfig,
}

/// How bytes travel to the endpoint once TCP is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMode {
    /// TLS straight over TCP.
    Plain,
    WebSocket(WsOptions),
    /// gRPC "gun" streams over one shared HTTP/2 connection.
    Multiplexed(MuxOptions),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsOptions {
    pub path: String,
    pub headers: Vec<(String, String)>,
    /// Bare HTTP upgrade: raw bytes after `101`, no WebSocket framing.
    pub http_upgrade: bool,
    /// With `http_upgrade`, do not wait for the `101` before writing.
    pub fast_open: bool,
}

impl Default for WsOptions {
    fn default() -> Self {
        Self {
            path: trojan_core::DEFAULT_WS_PATH.to_string(),
            headers: Vec::new(),
            http_upgrade: false,
            fast_open: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxOptions {
    pub service_name: String,
}

impl Default for MuxOptions {
    fn default() -> Self {
        Self {
            service_name: trojan_core::DEFAULT_GRPC_SERVICE_NAME.to_string(),
        }
    }
}

impl Endpoint {
    /// Minimal endpoint: plain TLS with default options.
    pub fn new(server: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        let server = server.into();
        Self {
            name: server.clone(),
            server,
            port,
            password: password.into(),
            sni: None,
            alpn: trojan_core::DEFAULT_ALPN.iter().map(|s| s.to_string()).collect(),
            skip_cert_verify: false,
            fingerprint: None,
            client_fingerprint: None,
            reality: None,
            ca: None,
            transport: TransportMode::Plain,
            udp: false,
            dial: DialOptions::default(),
            tcp: TcpConfig::default(),
        }
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn server_addr(&self) -> String {
        if self.server.contains(':') {
            format!("[{}]:{}", self.server, self.port)
        } else {
            format!("{}:{}", self.server, self.port)
        }
    }

    /// SNI override, falling back to the server host.
    pub fn server_name(&self) -> &str {
        self.sni.as_deref().unwrap_or(&self.server)
    }

    pub fn is_multiplexed(&self) -> bool {
        matches!(self.transport, TransportMode::Multiplexed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_addr_brackets_ipv6() {
        assert_eq!(Endpoint::new("proxy.example", 443, "x").server_addr(), "proxy.example:443");
        assert_eq!(Endpoint::new("2001:db8::1", 8443, "x").server_addr(), "[2001:db8::1]:8443");
    }

    #[test]
    fn sni_overrides_server_name() {
        let mut ep = Endpoint::new("1.2.3.4", 443, "x");
        assert_eq!(ep.server_name(), "1.2.3.4");
        ep.sni = Some("cdn.example".into());
        assert_eq!(ep.server_name(), "cdn.example");
    }
}
