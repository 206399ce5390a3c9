//! Trojan outbound adapter.
//!
//! Given a target requested by a router, [`TrojanAdapter`] opens an
//! authenticated tunnel to a Trojan endpoint over TLS, WebSocket or gRPC
//! streams multiplexed on one HTTP/2 connection, writes the request header
//! and hands back a byte stream or a datagram connection.

pub mod adapter;
pub mod cli;
pub mod config;
pub mod conn;
pub mod context;
pub mod dialer;
pub mod endpoint;
mod error;
pub mod fingerprint;
pub mod packet;
pub mod reality;
pub mod tls;
pub mod transport;

pub use adapter::{OutboundAdapter, TrojanAdapter, TrojanAdapterBuilder};
pub use cli::{HashArgs, ProbeArgs};
pub use config::{EndpointConfig, ProbeConfig, load_probe_config};
pub use conn::{BoxedStream, ConnState, LogicalConnection, NegotiatedStream};
pub use context::DialContext;
pub use dialer::{DialOptions, DnsPreference};
pub use endpoint::{Endpoint, MuxOptions, TransportMode, WsOptions};
pub use error::{BoxError, OutboundError, Stage};
pub use fingerprint::{ClientFingerprint, FingerprintDefaults};
pub use packet::PacketConnection;
pub use tls::{AlpnMode, CertPin, TlsConfigurer};
pub use trojan_proto::{Command, TargetAddress, TargetHost};
