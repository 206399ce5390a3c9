//! Core types and constants shared across the trojan outbound crates.
//!
//! This crate provides:
//! - Default dial, handshake and framing values
//! - Error kind constants for logging
//! - Stream adapters used by the transports (`PrefixedStream`, `WsIo`)

pub mod defaults;
pub mod errors;
pub mod io;
pub mod transport;

// Re-export commonly used items at crate root
pub use defaults::*;
pub use errors::*;

