//! Endpoint and probe configuration.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use trojan_core::defaults;

use crate::dialer::{DialOptions, DnsPreference};
use crate::endpoint::{Endpoint, MuxOptions, TransportMode, WsOptions};
use crate::error::OutboundError;
use crate::fingerprint::ClientFingerprint;
use crate::reality::RealitySettings;
use crate::tls::CertPin;

/// Proxy entry as it appears in a config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EndpointConfig {
    #[serde(default)]
    pub name: String,
    pub server: String,
    pub port: u16,
    pub password: String,
    #[serde(default = "default_alpn")]
    pub alpn: Vec<String>,
    #[serde(default)]
    pub sni: Option<String>,
    #[serde(default)]
    pub skip_cert_verify: bool,
    /// SHA-256 of the server certificate, hex with optional `:` separators.
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub client_fingerprint: Option<String>,
    #[serde(default)]
    pub udp: bool,
    /// `tcp` (default), `ws`, or `grpc` / `multiplex`.
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub reality_opts: Option<RealityOpts>,
    #[serde(default)]
    pub ws_opts: WsOptsConfig,
    #[serde(default)]
    pub grpc_opts: GrpcOptsConfig,
    /// PEM bundle trusted instead of the bundled web roots.
    #[serde(default)]
    pub ca: Option<PathBuf>,
    #[serde(default)]
    pub interface_name: Option<String>,
    #[serde(default)]
    pub routing_mark: Option<u32>,
    #[serde(default)]
    pub tfo: bool,
    #[serde(default)]
    pub mptcp: bool,
    /// `dual`, `ipv4`, `ipv6`, `ipv4-prefer` or `ipv6-prefer`.
    #[serde(default)]
    pub ip_version: Option<String>,
    #[serde(default)]
    pub tcp: TcpConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RealityOpts {
    /// Server X25519 public key, base64url without padding.
    pub public_key: String,
    #[serde(default)]
    pub short_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WsOptsConfig {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub v2ray_http_upgrade: bool,
    #[serde(default)]
    pub v2ray_http_upgrade_fast_open: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GrpcOptsConfig {
    #[serde(default)]
    pub grpc_service_name: Option<String>,
}

/// TCP socket options for connections to the endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TcpConfig {
    #[serde(default = "default_tcp_no_delay")]
    pub no_delay: bool,
    /// Keep-alive interval in seconds (0 = disabled).
    #[serde(default = "default_tcp_keepalive_secs")]
    pub keepalive_secs: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            no_delay: default_tcp_no_delay(),
            keepalive_secs: default_tcp_keepalive_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: Option<String>,
    /// json, pretty or compact. Default: pretty.
    pub format: Option<String>,
    /// stdout or stderr. Default: stderr.
    pub output: Option<String>,
    /// Per-module filters, e.g. {"rustls": "warn"}.
    #[serde(default)]
    pub filters: HashMap<String, String>,
}

/// Config file read by the `probe` command.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    pub proxy: EndpointConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_alpn() -> Vec<String> {
    defaults::DEFAULT_ALPN.iter().map(|s| s.to_string()).collect()
}

fn default_tcp_no_delay() -> bool {
    defaults::DEFAULT_TCP_NO_DELAY
}

fn default_tcp_keepalive_secs() -> u64 {
    defaults::DEFAULT_TCP_KEEPALIVE_SECS
}

impl EndpointConfig {
    /// Validates every option and produces the immutable [`Endpoint`].
    pub fn build(&self) -> Result<Endpoint, OutboundError> {
        if self.server.is_empty() {
            return Err(OutboundError::Config("server must not be empty".into()));
        }
        if self.port == 0 {
            return Err(OutboundError::Config("port must not be 0".into()));
        }

        let transport = match self.network.as_deref().unwrap_or("tcp") {
            "" | "tcp" => TransportMode::Plain,
            "ws" => TransportMode::WebSocket(self.ws_options()?),
            "grpc" | "multiplex" => TransportMode::Multiplexed(MuxOptions {
                service_name: self
                    .grpc_opts
                    .grpc_service_name
                    .clone()
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| defaults::DEFAULT_GRPC_SERVICE_NAME.to_string()),
            }),
            other => {
                return Err(OutboundError::Config(format!("unsupported network: {other}")));
            }
        };

        let fingerprint = self
            .fingerprint
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(str::parse::<CertPin>)
            .transpose()?;
        let client_fingerprint = self
            .client_fingerprint
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(str::parse::<ClientFingerprint>)
            .transpose()?;
        let reality = self
            .reality_opts
            .as_ref()
            .filter(|r| !r.public_key.is_empty())
            .map(|r| RealitySettings::parse(&r.public_key, &r.short_id))
            .transpose()?;
        let dns = self
            .ip_version
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(str::parse::<DnsPreference>)
            .transpose()?;

        Ok(Endpoint {
            name: if self.name.is_empty() {
                self.server.clone()
            } else {
                self.name.clone()
            },
            server: self.server.clone(),
            port: self.port,
            password: self.password.clone(),
            sni: self.sni.clone().filter(|s| !s.is_empty()),
            alpn: self.alpn.clone(),
            skip_cert_verify: self.skip_cert_verify,
            fingerprint,
            client_fingerprint,
            reality,
            ca: self.ca.clone(),
            transport,
            udp: self.udp,
            dial: DialOptions {
                interface: self.interface_name.clone().filter(|s| !s.is_empty()),
                routing_mark: self.routing_mark,
                tfo: self.tfo.then_some(true),
                mptcp: self.mptcp.then_some(true),
                dns,
            },
            tcp: self.tcp.clone(),
        })
    }

    fn ws_options(&self) -> Result<WsOptions, OutboundError> {
        let ws = &self.ws_opts;
        let path = match ws.path.as_deref() {
            None | Some("") => defaults::DEFAULT_WS_PATH.to_string(),
            Some(p) if p.starts_with('/') => p.to_string(),
            Some(p) => {
                return Err(OutboundError::Config(format!("ws path must start with '/': {p}")));
            }
        };
        if ws.v2ray_http_upgrade_fast_open && !ws.v2ray_http_upgrade {
            return Err(OutboundError::Config(
                "v2ray-http-upgrade-fast-open requires v2ray-http-upgrade".into(),
            ));
        }
        Ok(WsOptions {
            path,
            headers: ws
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            http_upgrade: ws.v2ray_http_upgrade,
            fast_open: ws.v2ray_http_upgrade_fast_open,
        })
    }
}

/// Load a probe configuration from a file path.
///
/// Supports TOML, JSON, and JSONC formats (detected by extension).
pub fn load_probe_config(path: &Path) -> Result<ProbeConfig, OutboundError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| OutboundError::Config(format!("failed to read config: {e}")))?;

    match path.extension().and_then(|e| e.to_str()).unwrap_or("toml") {
        "json" | "jsonc" => serde_json::from_str(&strip_line_comments(&content))
            .map_err(|e| OutboundError::Config(format!("JSON parse error: {e}"))),
        _ => toml::from_str(&content)
            .map_err(|e| OutboundError::Config(format!("TOML parse error: {e}"))),
    }
}

/// Drops `//` comments that are not inside a string literal.
fn strip_line_comments(content: &str) -> String {
    content
        .lines()
        .map(|line| {
            let bytes = line.as_bytes();
            let mut in_string = false;
            let mut escaped = false;
            for (i, &b) in bytes.iter().enumerate() {
                if in_string {
                    if escaped {
                        escaped = false;
                    } else if b == b'\\' {
                        escaped = true;
                    } else if b == b'"' {
                        in_string = false;
                    }
                } else if b == b'"' {
                    in_string = true;
                } else if b == b'/' && bytes.get(i + 1) == Some(&b'/') {
                    return &line[..i];
                }
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}
