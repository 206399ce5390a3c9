//! Message-oriented transports exposed as byte streams.

#[cfg(feature = "ws")]
mod ws;

#[cfg(feature = "ws")]
pub use ws::WsIo;
