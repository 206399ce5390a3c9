//! The Trojan outbound adapter.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, trace};
use trojan_core::defaults::DEFAULT_CONNECT_TIMEOUT_SECS;
use trojan_proto::{Command, TargetAddress, sha224_hex};

use crate::conn::{BoxedStream, LogicalConnection, NegotiatedStream};
use crate::context::DialContext;
use crate::dialer::{DialOptions, connect_tcp};
use crate::endpoint::{Endpoint, TransportMode};
use crate::error::{OutboundError, Stage};
use crate::fingerprint::FingerprintDefaults;
use crate::packet::PacketConnection;
use crate::tls::TlsConfigurer;
use crate::transport::{self, MultiplexedSession};

/// Router-facing contract of an outbound proxy.
#[async_trait]
pub trait OutboundAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn supports_udp(&self) -> bool;

    /// Whether datagrams can ride on a stream connection.
    fn supports_uot(&self) -> bool;

    async fn dial_context(
        &self,
        ctx: &DialContext,
        target: &TargetAddress,
        opts: &DialOptions,
    ) -> Result<LogicalConnection, OutboundError>;

    async fn stream_conn_context(
        &self,
        ctx: &DialContext,
        raw: BoxedStream,
        target: &TargetAddress,
        command: Command,
    ) -> Result<LogicalConnection, OutboundError>;

    async fn listen_packet_context(
        &self,
        ctx: &DialContext,
        target: &TargetAddress,
        opts: &DialOptions,
    ) -> Result<PacketConnection, OutboundError>;

    fn listen_packet_on_stream_conn(&self, conn: LogicalConnection) -> PacketConnection;
}

/// Builder for [`TrojanAdapter`].
#[derive(Debug)]
pub struct TrojanAdapterBuilder {
    endpoint: Endpoint,
    defaults: FingerprintDefaults,
}

impl TrojanAdapterBuilder {
    /// Shared process default used when the endpoint names no client
    /// fingerprint.
    pub fn fingerprint_defaults(mut self, defaults: FingerprintDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn build(self) -> Result<TrojanAdapter, OutboundError> {
        let endpoint = self.endpoint;
        let tls = TlsConfigurer::new(&endpoint, self.defaults)?;
        let mux = match &endpoint.transport {
            TransportMode::Multiplexed(opts) => Some(MultiplexedSession::new(
                &opts.service_name,
                endpoint.server_name(),
            )),
            _ => None,
        };
        debug!(
            name = %endpoint.name,
            server = %endpoint.server_addr(),
            transport = ?endpoint.transport,
            insecure = tls.is_insecure(),
            "trojan adapter ready"
        );
        Ok(TrojanAdapter {
            hash_hex: sha224_hex(&endpoint.password),
            endpoint,
            tls,
            mux,
        })
    }
}

/// Dials tunnels to one Trojan endpoint.
#[derive(Debug)]
pub struct TrojanAdapter {
    endpoint: Endpoint,
    hash_hex: String,
    tls: TlsConfigurer,
    mux: Option<MultiplexedSession>,
}

impl TrojanAdapter {
    pub fn builder(endpoint: Endpoint) -> TrojanAdapterBuilder {
        TrojanAdapterBuilder {
            endpoint,
            defaults: FingerprintDefaults::new(),
        }
    }

    pub fn new(endpoint: Endpoint) -> Result<Self, OutboundError> {
        Self::builder(endpoint).build()
    }

    pub fn name(&self) -> &str {
        &self.endpoint.name
    }

    pub fn server_addr(&self) -> String {
        self.endpoint.server_addr()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn supports_udp(&self) -> bool {
        self.endpoint.udp
    }

    pub fn supports_uot(&self) -> bool {
        true
    }

    pub fn is_insecure(&self) -> bool {
        self.tls.is_insecure()
    }

    pub fn multiplexed_session(&self) -> Option<&MultiplexedSession> {
        self.mux.as_ref()
    }

    /// Opens a stream tunnel to `target`.
    ///
    /// A multiplexed endpoint reuses its shared session unless `opts`
    /// carries overrides; every other dial owns a fresh TCP connection.
    pub async fn dial_stream(
        &self,
        ctx: &DialContext,
        target: &TargetAddress,
        opts: &DialOptions,
    ) -> Result<LogicalConnection, OutboundError> {
        self.dial(ctx, target, opts, Command::Connect).await
    }

    /// Opens a datagram tunnel; frames carry their own target.
    pub async fn dial_packet(
        &self,
        ctx: &DialContext,
        target: &TargetAddress,
        opts: &DialOptions,
    ) -> Result<PacketConnection, OutboundError> {
        if !self.endpoint.udp {
            debug!(name = %self.endpoint.name, "datagram dial on an endpoint without udp enabled");
        }
        let conn = self.dial(ctx, target, opts, Command::UdpAssociate).await?;
        Ok(PacketConnection::new(conn))
    }

    /// Negotiates over a socket the caller already connected.
    pub async fn stream_conn_context<S>(
        &self,
        ctx: &DialContext,
        raw: S,
        target: &TargetAddress,
        command: Command,
    ) -> Result<LogicalConnection, OutboundError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let result = async {
            let negotiated =
                transport::negotiate(ctx, &self.endpoint, &self.tls, self.mux.as_ref(), raw).await?;
            negotiated.finalize(ctx, &self.hash_hex, command, target).await
        }
        .await;
        self.log_outcome(target, result)
    }

    /// Wraps a connection opened with [`Command::UdpAssociate`].
    pub fn packet_from_stream(&self, conn: LogicalConnection) -> PacketConnection {
        PacketConnection::new(conn)
    }

    /// Context-free entrypoint kept for older routers. Always fails.
    #[deprecated(note = "use stream_conn_context")]
    pub fn stream_conn<S>(
        &self,
        _raw: S,
        _target: &TargetAddress,
    ) -> Result<LogicalConnection, OutboundError> {
        Err(OutboundError::DeprecatedApi)
    }

    async fn dial(
        &self,
        ctx: &DialContext,
        target: &TargetAddress,
        opts: &DialOptions,
        command: Command,
    ) -> Result<LogicalConnection, OutboundError> {
        let result = async {
            let negotiated = match &self.mux {
                Some(session) if opts.is_empty() => {
                    let peer = self.endpoint.server_addr();
                    let gun = session
                        .open(ctx, &peer, || async {
                            let tcp = self.connect(ctx, &self.endpoint.dial).await?;
                            transport::mux_physical(ctx, &self.endpoint, &self.tls, tcp).await
                        })
                        .await?;
                    NegotiatedStream::new(Box::new(gun), peer)
                }
                _ => {
                    let tcp = self.connect(ctx, &opts.merged_over(&self.endpoint.dial)).await?;
                    trace!(stage = %Stage::Handshake, %target, "negotiating transport");
                    transport::negotiate(ctx, &self.endpoint, &self.tls, self.mux.as_ref(), tcp)
                        .await?
                }
            };
            negotiated.finalize(ctx, &self.hash_hex, command, target).await
        }
        .await;
        self.log_outcome(target, result)
    }

    async fn connect(
        &self,
        ctx: &DialContext,
        opts: &DialOptions,
    ) -> Result<TcpStream, OutboundError> {
        let addr = self.endpoint.server_addr();
        trace!(stage = %Stage::Connect, server = %addr, "connecting");
        let connect = async {
            let fut = connect_tcp(
                &self.endpoint.server,
                self.endpoint.port,
                opts,
                &self.endpoint.tcp,
            );
            let res = if ctx.deadline().is_some() {
                fut.await
            } else {
                tokio::time::timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS), fut)
                    .await
                    .map_err(|_| OutboundError::TimedOut {
                        stage: Stage::Connect,
                    })?
            };
            res.map_err(|source| OutboundError::Connect {
                addr: addr.clone(),
                source,
            })
        };
        ctx.run(Stage::Connect, connect).await
    }

    fn log_outcome(
        &self,
        target: &TargetAddress,
        result: Result<LogicalConnection, OutboundError>,
    ) -> Result<LogicalConnection, OutboundError> {
        match &result {
            Ok(conn) => debug!(
                name = %self.endpoint.name,
                %target,
                command = ?conn.command(),
                "tunnel established"
            ),
            Err(e) => debug!(
                name = %self.endpoint.name,
                %target,
                error = %e,
                error_type = e.error_type(),
                stage = ?e.stage(),
                "dial failed"
            ),
        }
        result
    }
}

#[async_trait]
impl OutboundAdapter for TrojanAdapter {
    fn name(&self) -> &str {
        TrojanAdapter::name(self)
    }

    fn supports_udp(&self) -> bool {
        TrojanAdapter::supports_udp(self)
    }

    fn supports_uot(&self) -> bool {
        TrojanAdapter::supports_uot(self)
    }

    async fn dial_context(
        &self,
        ctx: &DialContext,
        target: &TargetAddress,
        opts: &DialOptions,
    ) -> Result<LogicalConnection, OutboundError> {
        self.dial_stream(ctx, target, opts).await
    }

    async fn stream_conn_context(
        &self,
        ctx: &DialContext,
        raw: BoxedStream,
        target: &TargetAddress,
        command: Command,
    ) -> Result<LogicalConnection, OutboundError> {
        TrojanAdapter::stream_conn_context(self, ctx, raw, target, command).await
    }

    async fn listen_packet_context(
        &self,
        ctx: &DialContext,
        target: &TargetAddress,
        opts: &DialOptions,
    ) -> Result<PacketConnection, OutboundError> {
        self.dial_packet(ctx, target, opts).await
    }

    fn listen_packet_on_stream_conn(&self, conn: LogicalConnection) -> PacketConnection {
        self.packet_from_stream(conn)
    }
}
