//! Stream adapters shared by the outbound transports.

mod prefixed;

pub use prefixed::PrefixedStream;
