//! Default configuration values.
//!
//! Centralized default constants for use across all crates.

// ============================================================================
// Dial Defaults
// ============================================================================

/// Default TCP connect timeout in seconds, applied when the caller sets no deadline.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
/// Default TLS handshake timeout in seconds.
pub const DEFAULT_TLS_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

// ============================================================================
// TCP Socket Defaults
// ============================================================================

/// Default TCP_NODELAY (disable Nagle's algorithm for lower latency).
pub const DEFAULT_TCP_NO_DELAY: bool = true;
/// Default TCP Keep-Alive interval in seconds (0 = disabled).
pub const DEFAULT_TCP_KEEPALIVE_SECS: u64 = 30;

// ============================================================================
// TLS Defaults
// ============================================================================

/// Default ALPN list offered to the remote endpoint.
pub const DEFAULT_ALPN: &[&str] = &["h2", "http/1.1"];
/// ALPN protocol required by the multiplexed transport.
pub const ALPN_H2: &str = "h2";

// ============================================================================
// WebSocket / HTTP Upgrade Defaults
// ============================================================================

/// Default WebSocket path.
pub const DEFAULT_WS_PATH: &str = "/";
/// Default max WebSocket frame size.
pub const DEFAULT_WS_MAX_FRAME_BYTES: usize = 1 << 20;
/// Maximum size of an HTTP upgrade response head.
pub const DEFAULT_MAX_HTTP_HEADER_BYTES: usize = 8192;

// ============================================================================
// Multiplex (gRPC over HTTP/2) Defaults
// ============================================================================

/// Default gRPC service name when none is configured.
pub const DEFAULT_GRPC_SERVICE_NAME: &str = "GunService";
/// User agent sent on multiplexed virtual streams.
pub const GRPC_USER_AGENT: &str = "grpc-go/1.36.0";
/// Largest gun message accepted from the peer.
pub const MAX_GRPC_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

// ============================================================================
// Datagram Defaults
// ============================================================================

/// Initial read buffer for the datagram reader.
pub const DEFAULT_DATAGRAM_READ_BUFFER: usize = 16 * 1024;
