//! TCP dialing with per-call socket options.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, trace};

use crate::config::TcpConfig;
use crate::error::OutboundError;

/// Per-call dial overrides.
///
/// Any field set here means the call cannot reuse the shared multiplexed
/// connection, which was dialed with the endpoint's own settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DialOptions {
    /// Bind the socket to this network interface (SO_BINDTODEVICE).
    pub interface: Option<String>,
    /// Firewall mark (SO_MARK).
    pub routing_mark: Option<u32>,
    /// TCP fast open.
    pub tfo: Option<bool>,
    /// Multipath TCP.
    pub mptcp: Option<bool>,
    pub dns: Option<DnsPreference>,
}

impl DialOptions {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Fields set on `self` win over `base`.
    pub fn merged_over(&self, base: &DialOptions) -> DialOptions {
        DialOptions {
            interface: self.interface.clone().or_else(|| base.interface.clone()),
            routing_mark: self.routing_mark.or(base.routing_mark),
            tfo: self.tfo.or(base.tfo),
            mptcp: self.mptcp.or(base.mptcp),
            dns: self.dns.or(base.dns),
        }
    }
}

/// Address family policy for resolving the endpoint host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DnsPreference {
    /// Resolver order, both families.
    #[default]
    Dual,
    Ipv4Only,
    Ipv6Only,
    PreferIpv4,
    PreferIpv6,
}

impl FromStr for DnsPreference {
    type Err = OutboundError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dual" => Ok(Self::Dual),
            "ipv4" => Ok(Self::Ipv4Only),
            "ipv6" => Ok(Self::Ipv6Only),
            "ipv4-prefer" => Ok(Self::PreferIpv4),
            "ipv6-prefer" => Ok(Self::PreferIpv6),
            other => Err(OutboundError::Config(format!("unknown ip-version: {other}"))),
        }
    }
}

impl DnsPreference {
    /// Filters and orders resolved addresses.
    pub fn arrange(self, addrs: impl IntoIterator<Item = SocketAddr>) -> Vec<SocketAddr> {
        let mut addrs: Vec<SocketAddr> = addrs.into_iter().collect();
        match self {
            Self::Dual => {}
            Self::Ipv4Only => addrs.retain(SocketAddr::is_ipv4),
            Self::Ipv6Only => addrs.retain(SocketAddr::is_ipv6),
            // stable sort keeps resolver order within a family
            Self::PreferIpv4 => addrs.sort_by_key(|a| !a.is_ipv4()),
            Self::PreferIpv6 => addrs.sort_by_key(|a| !a.is_ipv6()),
        }
        addrs
    }
}

/// Resolves `host` and connects to the first address that accepts.
///
/// Errors are returned as raw I/O errors; the caller tags them with the
/// connect stage.
pub async fn connect_tcp(
    host: &str,
    port: u16,
    opts: &DialOptions,
    tcp: &TcpConfig,
) -> io::Result<TcpStream> {
    let pref = opts.dns.unwrap_or_default();
    let addrs = match host.parse::<IpAddr>() {
        Ok(ip) => pref.arrange([SocketAddr::new(ip, port)]),
        Err(_) => pref.arrange(tokio::net::lookup_host((host, port)).await?),
    };
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no usable address for {host}"),
        ));
    }

    let mut last_err = None;
    for addr in addrs {
        trace!(remote = %addr, "tcp connect attempt");
        match connect_addr(addr, opts).await {
            Ok(stream) => {
                apply_tcp_options(&stream, tcp)?;
                debug!(remote = %addr, "tcp connected");
                return Ok(stream);
            }
            Err(e) => {
                debug!(remote = %addr, error = %e, "tcp connect failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::NotFound)))
}

async fn connect_addr(addr: SocketAddr, opts: &DialOptions) -> io::Result<TcpStream> {
    let socket = new_socket(addr, opts.mptcp.unwrap_or(false))?;
    let sock = SockRef::from(&socket);

    if let Some(iface) = opts.interface.as_deref() {
        bind_interface(&sock, iface)?;
    }
    if let Some(mark) = opts.routing_mark {
        set_routing_mark(&sock, mark)?;
    }
    if opts.tfo.unwrap_or(false) {
        enable_fast_open(&sock)?;
    }

    socket.connect(addr).await
}

fn new_socket(addr: SocketAddr, mptcp: bool) -> io::Result<TcpSocket> {
    let domain = Domain::for_address(addr);
    let socket = if mptcp {
        match mptcp_socket(domain) {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, "multipath TCP unavailable, using plain TCP");
                Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?
            }
        }
    } else {
        Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?
    };
    socket.set_nonblocking(true)?;
    Ok(TcpSocket::from_std_stream(socket.into()))
}

#[cfg(target_os = "linux")]
fn mptcp_socket(domain: Domain) -> io::Result<Socket> {
    Socket::new(domain, Type::STREAM, Some(Protocol::MPTCP))
}

#[cfg(not(target_os = "linux"))]
fn mptcp_socket(_domain: Domain) -> io::Result<Socket> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "multipath TCP requires Linux"))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_interface(sock: &SockRef<'_>, iface: &str) -> io::Result<()> {
    sock.bind_device(Some(iface.as_bytes()))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_interface(_sock: &SockRef<'_>, iface: &str) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("binding to interface {iface} is not supported on this platform"),
    ))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_routing_mark(sock: &SockRef<'_>, mark: u32) -> io::Result<()> {
    sock.set_mark(mark)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_routing_mark(_sock: &SockRef<'_>, _mark: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "routing mark is not supported on this platform",
    ))
}

/// Client-side fast open: data from the first write rides on the SYN.
#[cfg(target_os = "linux")]
fn enable_fast_open(sock: &SockRef<'_>) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let enable: libc::c_int = 1;
    // SAFETY: valid socket fd and a correctly sized c_int option value.
    let ret = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_FASTOPEN_CONNECT,
            (&enable as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
fn enable_fast_open(_sock: &SockRef<'_>) -> io::Result<()> {
    debug!("TCP fast open not supported on this platform, ignoring");
    Ok(())
}

/// Apply TCP socket options.
pub(crate) fn apply_tcp_options(stream: &TcpStream, config: &TcpConfig) -> io::Result<()> {
    stream.set_nodelay(config.no_delay)?;

    if config.keepalive_secs > 0 {
        let sock = SockRef::from(stream);
        let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(config.keepalive_secs));
        sock.set_tcp_keepalive(&keepalive)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn v4(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn merge_prefers_call_options() {
        let base = DialOptions {
            interface: Some("eth0".into()),
            routing_mark: Some(1),
            ..Default::default()
        };
        let call = DialOptions {
            routing_mark: Some(2),
            tfo: Some(true),
            ..Default::default()
        };
        let merged = call.merged_over(&base);
        assert_eq!(merged.interface.as_deref(), Some("eth0"));
        assert_eq!(merged.routing_mark, Some(2));
        assert_eq!(merged.tfo, Some(true));
        assert!(!call.is_empty());
        assert!(DialOptions::default().is_empty());
    }

    #[test]
    fn dns_preference_orders_families() {
        let addrs = [v4("[::1]:1"), v4("10.0.0.1:1"), v4("[::2]:1"), v4("10.0.0.2:1")];
        assert_eq!(
            DnsPreference::PreferIpv4.arrange(addrs),
            vec![v4("10.0.0.1:1"), v4("10.0.0.2:1"), v4("[::1]:1"), v4("[::2]:1")]
        );
        assert_eq!(DnsPreference::Ipv6Only.arrange(addrs), vec![v4("[::1]:1"), v4("[::2]:1")]);
        assert_eq!(DnsPreference::Dual.arrange(addrs).len(), 4);
        assert!("ipv5".parse::<DnsPreference>().is_err());
    }

    #[tokio::test]
    async fn connects_to_ip_literal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        let stream = connect_tcp("127.0.0.1", port, &DialOptions::default(), &TcpConfig::default())
            .await
            .unwrap();
        assert!(stream.nodelay().unwrap());
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn family_filter_can_leave_nothing() {
        let opts = DialOptions {
            dns: Some(DnsPreference::Ipv6Only),
            ..Default::default()
        };
        let err = connect_tcp("127.0.0.1", 9, &opts, &TcpConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
