//! Transport negotiation on top of a connected socket.

mod mux;
mod upgrade;
mod ws;

pub use mux::{GunStream, MultiplexedSession};
pub use upgrade::UpgradeStream;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::conn::{BoxedStream, NegotiatedStream};
use crate::context::DialContext;
use crate::endpoint::{Endpoint, TransportMode};
use crate::error::OutboundError;
use crate::tls::{AlpnMode, TlsConfigurer};

/// Runs TLS plus the endpoint's transport over `io`.
///
/// A multiplexed endpoint gets a private single-stream session here; the
/// shared session is only used by dials without per-call options.
pub(crate) async fn negotiate<S>(
    ctx: &DialContext,
    endpoint: &Endpoint,
    tls: &TlsConfigurer,
    private_mux: Option<&MultiplexedSession>,
    io: S,
) -> Result<NegotiatedStream, OutboundError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let peer = endpoint.server_addr();
    let stream: BoxedStream = match &endpoint.transport {
        TransportMode::Plain => Box::new(tls.connect(ctx, io, AlpnMode::Endpoint, &peer).await?),
        TransportMode::WebSocket(opts) => {
            let tls_stream = tls.connect(ctx, io, AlpnMode::Http11, &peer).await?;
            ws::connect(ctx, tls_stream, endpoint.server_name(), opts, &peer).await?
        }
        TransportMode::Multiplexed(opts) => {
            let tls_stream = tls.connect(ctx, io, AlpnMode::H2, &peer).await?;
            let fallback;
            let session = match private_mux {
                Some(s) => s,
                None => {
                    fallback = MultiplexedSession::new(&opts.service_name, endpoint.server_name());
                    &fallback
                }
            };
            debug!(peer = %peer, "opening private multiplexed session");
            Box::new(session.open_private(ctx, Box::new(tls_stream), &peer).await?)
        }
    };
    Ok(NegotiatedStream::new(stream, peer))
}

/// TLS plus HTTP/2-ready stream for the shared multiplexed session.
pub(crate) async fn mux_physical<S>(
    ctx: &DialContext,
    endpoint: &Endpoint,
    tls: &TlsConfigurer,
    io: S,
) -> Result<BoxedStream, OutboundError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let peer = endpoint.server_addr();
    Ok(Box::new(tls.connect(ctx, io, AlpnMode::H2, &peer).await?))
}
