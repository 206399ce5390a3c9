//! Owned target addresses.
//!
//! A [`TargetAddress`] is what the router asks the adapter to reach. It owns
//! its host so it can outlive the buffer it was parsed from, and borrows back
//! into an [`AddressRef`] for serialization.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use crate::{AddressRef, HostRef, MAX_DOMAIN_LEN, ParseError, atyp_len};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetHost {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetAddress {
    pub host: TargetHost,
    pub port: u16,
}

/// Errors from building or parsing a [`TargetAddress`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("empty host")]
    EmptyHost,
    #[error("domain is {0} bytes, limit is 255")]
    DomainTooLong(usize),
    #[error("missing port in {0:?}")]
    MissingPort(String),
    #[error("invalid port in {0:?}")]
    InvalidPort(String),
}

impl TargetAddress {
    /// Builds an address from a host string. IP literals become IP hosts.
    pub fn new(host: &str, port: u16) -> Result<Self, AddressError> {
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(AddressError::EmptyHost);
        }
        let host = match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => TargetHost::Ipv4(v4),
            Ok(IpAddr::V6(v6)) => TargetHost::Ipv6(v6),
            Err(_) => {
                if host.len() > MAX_DOMAIN_LEN {
                    return Err(AddressError::DomainTooLong(host.len()));
                }
                TargetHost::Domain(host.to_owned())
            }
        };
        Ok(Self { host, port })
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let host = match addr.ip() {
            IpAddr::V4(v4) => TargetHost::Ipv4(v4),
            IpAddr::V6(v6) => TargetHost::Ipv6(v6),
        };
        Self {
            host,
            port: addr.port(),
        }
    }

    /// Borrowed view used by the framer.
    pub fn as_ref(&self) -> AddressRef<'_> {
        let host = match &self.host {
            TargetHost::Ipv4(v4) => HostRef::Ipv4(v4.octets()),
            TargetHost::Ipv6(v6) => HostRef::Ipv6(v6.octets()),
            TargetHost::Domain(d) => HostRef::Domain(d.as_bytes()),
        };
        AddressRef {
            host,
            port: self.port,
        }
    }

    pub fn from_ref(addr: &AddressRef<'_>) -> Result<Self, ParseError> {
        let host = match addr.host {
            HostRef::Ipv4(octets) => TargetHost::Ipv4(Ipv4Addr::from(octets)),
            HostRef::Ipv6(octets) => TargetHost::Ipv6(Ipv6Addr::from(octets)),
            HostRef::Domain(bytes) => {
                let domain = std::str::from_utf8(bytes).map_err(|_| ParseError::InvalidUtf8)?;
                TargetHost::Domain(domain.to_owned())
            }
        };
        Ok(Self {
            host,
            port: addr.port,
        })
    }

    /// Serialized length: type tag, host bytes and port.
    pub fn encoded_len(&self) -> usize {
        1 + atyp_len(&self.as_ref().host) + 2
    }

    /// Host without the port, IPv6 unbracketed.
    pub fn host_string(&self) -> String {
        match &self.host {
            TargetHost::Ipv4(v4) => v4.to_string(),
            TargetHost::Ipv6(v6) => v6.to_string(),
            TargetHost::Domain(d) => d.clone(),
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match &self.host {
            TargetHost::Ipv4(v4) => Some(SocketAddr::new(IpAddr::V4(*v4), self.port)),
            TargetHost::Ipv6(v6) => Some(SocketAddr::new(IpAddr::V6(*v6), self.port)),
            TargetHost::Domain(_) => None,
        }
    }
}

impl From<SocketAddr> for TargetAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::from_socket_addr(addr)
    }
}

impl FromStr for TargetAddress {
    type Err = AddressError;

    /// Accepts `host:port` and `[v6]:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressError::MissingPort(s.to_owned()))?;
        if host.contains(':') && !host.starts_with('[') {
            // bare IPv6 without brackets
            return Err(AddressError::MissingPort(s.to_owned()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| AddressError::InvalidPort(s.to_owned()))?;
        Self::new(host, port)
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            TargetHost::Ipv4(v4) => write!(f, "{v4}:{}", self.port),
            TargetHost::Ipv6(v6) => write!(f, "[{v6}]:{}", self.port),
            TargetHost::Domain(d) => write!(f, "{d}:{}", self.port),
        }
    }
}
