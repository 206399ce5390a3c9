//! # trojan-adapter
//!
//! Outbound side of the Trojan protocol: dial a target through a remote
//! endpoint over TLS, WebSocket or multiplexed HTTP/2 streams.
//!
//! ## Crates
//!
//! - [`trojan_core`] - Defaults, error kinds and stream adapters
//! - [`trojan_proto`] - Header and datagram framing, target addresses
//! - [`trojan_outbound`] - The adapter, its transports and the probe CLI

pub use trojan_core as core;
pub use trojan_outbound as outbound;
pub use trojan_proto as proto;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use trojan_outbound::{
        DialContext, DialOptions, Endpoint, EndpointConfig, LogicalConnection, OutboundAdapter,
        OutboundError, PacketConnection, TrojanAdapter,
    };
    pub use trojan_proto::{Command, TargetAddress};
}
