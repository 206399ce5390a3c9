//! Trojan wire format.
//!
//! Writers for the request header and datagram frames, plus incremental
//! parsers for both. The parsers borrow from the input buffer and report how
//! many bytes they still need, so a reader can grow its buffer and retry.
//!
//! ```text
//! header   = hex(sha224(password)) CRLF cmd address CRLF
//! address  = atyp host port
//! datagram = address length CRLF payload
//! ```

mod address;
mod hash;

use bytes::{BufMut, BytesMut};

pub use address::{AddressError, TargetAddress, TargetHost};
pub use hash::sha224_hex;

pub const HASH_LEN: usize = 56;
pub const CRLF: &[u8; 2] = b"\r\n";

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// Largest payload a datagram frame's 16-bit length can carry.
pub const MAX_UDP_PAYLOAD: usize = u16::MAX as usize;
pub const MAX_DOMAIN_LEN: usize = 255;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Request command carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// TCP stream to the target.
    Connect,
    /// Datagrams framed over the stream.
    UdpAssociate,
}

impl Command {
    pub const fn as_byte(self) -> u8 {
        match self {
            Command::Connect => CMD_CONNECT,
            Command::UdpAssociate => CMD_UDP_ASSOCIATE,
        }
    }

    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            CMD_CONNECT => Some(Command::Connect),
            CMD_UDP_ASSOCIATE => Some(Command::UdpAssociate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("expected CRLF")]
    InvalidCrlf,
    #[error("unknown command byte")]
    InvalidCommand,
    #[error("unknown address type")]
    InvalidAtyp,
    #[error("zero-length domain")]
    InvalidDomainLen,
    #[error("domain is not valid UTF-8")]
    InvalidUtf8,
    #[error("hash is not 56 hex characters")]
    InvalidHashFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    #[error("payload of {0} bytes exceeds the 65535-byte frame limit")]
    PayloadTooLarge(usize),
    #[error("domain exceeds 255 bytes")]
    DomainTooLong,
    #[error("hash must be exactly 56 bytes")]
    InvalidHashLen,
}

/// Failure while reading datagram frames off a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Invalid(#[from] ParseError),
    /// The stream ended inside a frame.
    #[error("stream ended mid-frame: have {have} bytes, frame needs {need}")]
    Truncated { have: usize, need: usize },
    #[error(transparent)]
    Write(#[from] WriteError),
}

/// Result of an incremental parse.
///
/// `Incomplete(n)` carries the minimum total buffer length needed, not the
/// number of additional bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult<T> {
    Complete(T),
    Incomplete(usize),
    Invalid(ParseError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostRef<'a> {
    Ipv4([u8; 4]),
    Ipv6([u8; 16]),
    Domain(&'a [u8]),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRef<'a> {
    pub host: HostRef<'a>,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrojanRequest<'a> {
    pub hash: &'a [u8],
    pub command: Command,
    pub address: AddressRef<'a>,
    pub header_len: usize,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket<'a> {
    pub address: AddressRef<'a>,
    pub length: usize,
    /// Total bytes consumed by this frame.
    pub packet_len: usize,
    pub payload: &'a [u8],
}

#[inline]
pub fn is_valid_hash(hash: &[u8]) -> bool {
    hash.len() == HASH_LEN && hash.iter().all(|&b| b.is_ascii_hexdigit())
}

pub fn parse_request(buf: &[u8]) -> ParseResult<TrojanRequest<'_>> {
    if buf.len() < HASH_LEN {
        return ParseResult::Incomplete(HASH_LEN);
    }
    let hash = &buf[..HASH_LEN];
    if !is_valid_hash(hash) {
        return ParseResult::Invalid(ParseError::InvalidHashFormat);
    }
    let mut offset = HASH_LEN;
    if let Some(res) = expect_crlf(buf, offset) {
        return res;
    }
    offset += 2;

    if buf.len() < offset + 2 {
        return ParseResult::Incomplete(offset + 2);
    }
    let Some(command) = Command::from_byte(buf[offset]) else {
        return ParseResult::Invalid(ParseError::InvalidCommand);
    };
    let atyp = buf[offset + 1];
    offset += 2;

    let (address, addr_len) = match parse_address(atyp, &buf[offset..]) {
        ParseResult::Complete(v) => v,
        ParseResult::Incomplete(n) => return ParseResult::Incomplete(offset + n),
        ParseResult::Invalid(e) => return ParseResult::Invalid(e),
    };
    offset += addr_len;

    if let Some(res) = expect_crlf(buf, offset) {
        return res;
    }
    offset += 2;

    ParseResult::Complete(TrojanRequest {
        hash,
        command,
        address,
        header_len: offset,
        payload: &buf[offset..],
    })
}

pub fn parse_udp_packet(buf: &[u8]) -> ParseResult<UdpPacket<'_>> {
    let Some(&atyp) = buf.first() else {
        return ParseResult::Incomplete(1);
    };
    let (address, addr_len) = match parse_address(atyp, &buf[1..]) {
        ParseResult::Complete(v) => v,
        ParseResult::Incomplete(n) => return ParseResult::Incomplete(1 + n),
        ParseResult::Invalid(e) => return ParseResult::Invalid(e),
    };

    let mut offset = 1 + addr_len;
    if buf.len() < offset + 2 {
        return ParseResult::Incomplete(offset + 2);
    }
    let length = read_u16(&buf[offset..offset + 2]) as usize;
    offset += 2;
    if let Some(res) = expect_crlf(buf, offset) {
        return res;
    }
    offset += 2;
    if buf.len() < offset + length {
        return ParseResult::Incomplete(offset + length);
    }

    ParseResult::Complete(UdpPacket {
        address,
        length,
        packet_len: offset + length,
        payload: &buf[offset..offset + length],
    })
}

/// Appends a request header to `buf`. Nothing is written on error.
pub fn write_request_header(
    buf: &mut BytesMut,
    hash_hex: &[u8],
    command: Command,
    address: &AddressRef<'_>,
) -> Result<(), WriteError> {
    if hash_hex.len() != HASH_LEN {
        return Err(WriteError::InvalidHashLen);
    }
    check_domain(address)?;
    buf.reserve(HASH_LEN + 2 + 1 + address_len(address) + 2);
    buf.put_slice(hash_hex);
    buf.put_slice(CRLF);
    buf.put_u8(command.as_byte());
    write_address_unchecked(buf, address);
    buf.put_slice(CRLF);
    Ok(())
}

/// Appends one datagram frame to `buf`. Nothing is written on error.
#[allow(clippy::cast_possible_truncation)]
pub fn write_udp_packet(
    buf: &mut BytesMut,
    address: &AddressRef<'_>,
    payload: &[u8],
) -> Result<(), WriteError> {
    if payload.len() > MAX_UDP_PAYLOAD {
        return Err(WriteError::PayloadTooLarge(payload.len()));
    }
    check_domain(address)?;
    buf.reserve(udp_frame_len(address, payload.len()));
    write_address_unchecked(buf, address);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(CRLF);
    buf.put_slice(payload);
    Ok(())
}

/// Bytes occupied by a datagram frame on the wire.
pub fn udp_frame_len(address: &AddressRef<'_>, payload_len: usize) -> usize {
    address_len(address) + 2 + 2 + payload_len
}

/// Serialized address length, type tag and port included.
pub fn address_len(address: &AddressRef<'_>) -> usize {
    1 + atyp_len(&address.host) + 2
}

pub(crate) fn atyp_len(host: &HostRef<'_>) -> usize {
    match host {
        HostRef::Ipv4(_) => 4,
        HostRef::Ipv6(_) => 16,
        HostRef::Domain(d) => 1 + d.len(),
    }
}

fn check_domain(address: &AddressRef<'_>) -> Result<(), WriteError> {
    match address.host {
        HostRef::Domain(d) if d.len() > MAX_DOMAIN_LEN => Err(WriteError::DomainTooLong),
        _ => Ok(()),
    }
}

#[inline]
fn expect_crlf<T>(buf: &[u8], offset: usize) -> Option<ParseResult<T>> {
    if buf.len() < offset + 2 {
        return Some(ParseResult::Incomplete(offset + 2));
    }
    if &buf[offset..offset + 2] != CRLF {
        return Some(ParseResult::Invalid(ParseError::InvalidCrlf));
    }
    None
}

fn parse_address(atyp: u8, buf: &[u8]) -> ParseResult<(AddressRef<'_>, usize)> {
    match atyp {
        ATYP_IPV4 => {
            if buf.len() < 6 {
                return ParseResult::Incomplete(6);
            }
            let host = HostRef::Ipv4([buf[0], buf[1], buf[2], buf[3]]);
            let port = read_u16(&buf[4..6]);
            ParseResult::Complete((AddressRef { host, port }, 6))
        }
        ATYP_DOMAIN => {
            let Some(&len) = buf.first() else {
                return ParseResult::Incomplete(1);
            };
            let len = len as usize;
            if len == 0 {
                return ParseResult::Invalid(ParseError::InvalidDomainLen);
            }
            let need = 1 + len + 2;
            if buf.len() < need {
                return ParseResult::Incomplete(need);
            }
            let domain = &buf[1..1 + len];
            if std::str::from_utf8(domain).is_err() {
                return ParseResult::Invalid(ParseError::InvalidUtf8);
            }
            let port = read_u16(&buf[1 + len..need]);
            let host = HostRef::Domain(domain);
            ParseResult::Complete((AddressRef { host, port }, need))
        }
        ATYP_IPV6 => {
            if buf.len() < 18 {
                return ParseResult::Incomplete(18);
            }
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&buf[..16]);
            let port = read_u16(&buf[16..18]);
            ParseResult::Complete((AddressRef { host: HostRef::Ipv6(ip), port }, 18))
        }
        _ => ParseResult::Invalid(ParseError::InvalidAtyp),
    }
}

/// Caller has already checked the domain length.
#[allow(clippy::cast_possible_truncation)]
fn write_address_unchecked(buf: &mut BytesMut, address: &AddressRef<'_>) {
    match address.host {
        HostRef::Ipv4(ip) => {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&ip);
        }
        HostRef::Ipv6(ip) => {
            buf.put_u8(ATYP_IPV6);
            buf.put_slice(&ip);
        }
        HostRef::Domain(domain) => {
            buf.put_u8(ATYP_DOMAIN);
            buf.put_u8(domain.len() as u8);
            buf.put_slice(domain);
        }
    }
    buf.put_u16(address.port);
}

#[inline]
fn read_u16(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}
