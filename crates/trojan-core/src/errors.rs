//! Error kind constants for logging.
//!
//! These constants give every failure a stable, stage-oriented label.

/// TCP connect to the remote endpoint failed.
pub const ERROR_CONNECT: &str = "connect";
/// TLS, WebSocket-upgrade or HTTP/2 negotiation failed.
pub const ERROR_HANDSHAKE: &str = "handshake";
/// Writing the request header failed.
pub const ERROR_HEADER: &str = "header";
/// Protocol parsing/validation error.
pub const ERROR_PROTOCOL: &str = "protocol";
/// I/O error after the connection was established.
pub const ERROR_IO: &str = "io";
/// Timeout error.
pub const ERROR_TIMEOUT: &str = "timeout";
/// Caller cancelled the operation.
pub const ERROR_CANCELLED: &str = "cancelled";
/// Configuration error.
pub const ERROR_CONFIG: &str = "config";
/// Deprecated entrypoint was invoked.
pub const ERROR_DEPRECATED: &str = "deprecated";
