//! Wire-level constants and the destination address model shared by the
//! client encoder and the server decoder.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/* ========================= Request options ========================= */

/// Raw bytes after the header, no framing.
pub const OPT_BASIC_FORMAT: u8 = 0x00;
/// Length-prefixed chunks, each sealed with the negotiated security method.
pub const OPT_CHUNK_STREAM: u8 = 0x01;
/// Chunk lengths XOR-masked with a SHAKE-128 keystream.
pub const OPT_CHUNK_MASKING: u8 = 0x04;
/// Random padding appended to each chunk, length drawn from the same keystream.
pub const OPT_GLOBAL_PADDING: u8 = 0x08;

/* ========================= Commands ========================= */

pub const CMD_TCP: u8 = 0x01;
/// Parsed but rejected; UDP tunneling is not supported.
pub const CMD_UDP: u8 = 0x02;

/* ========================= Address types ========================= */

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x02;
pub const ATYP_IPV6: u8 = 0x03;

/* ========================= Security ========================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    Aes128Gcm,
    Chacha20Poly1305,
    None,
}

impl Security {
    /// Decode the low nibble of the P/Sec byte. `0x06` (Zero) is reserved
    /// and rejected along with the legacy stream ciphers.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x03 => Some(Security::Aes128Gcm),
            0x04 => Some(Security::Chacha20Poly1305),
            0x05 => Some(Security::None),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Security::Aes128Gcm => 0x03,
            Security::Chacha20Poly1305 => 0x04,
            Security::None => 0x05,
        }
    }
}

/* ========================= Destination address ========================= */

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Domain(String),
    Ipv6(Ipv6Addr),
}

impl Address {
    pub fn from_ip(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Address::Ipv4(v4),
            IpAddr::V6(v6) => Address::Ipv6(v6),
        }
    }

    /// Append the atyp byte and the address body in wire order.
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        match self {
            Address::Ipv4(ip) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&ip.octets());
            }
            Address::Domain(name) => {
                buf.push(ATYP_DOMAIN);
                buf.push(name.len() as u8);
                buf.extend_from_slice(name.as_bytes());
            }
            Address::Ipv6(ip) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&ip.octets());
            }
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip) => write!(f, "{}", ip),
            Address::Domain(name) => write!(f, "{}", name),
            Address::Ipv6(ip) => write!(f, "[{}]", ip),
        }
    }
}

/// Destination carried in the request header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub address: Address,
    pub port: u16,
}

impl Metadata {
    pub fn new(address: Address, port: u16) -> Self {
        Metadata { address, port }
    }

    pub fn domain(name: &str, port: u16) -> Self {
        Metadata {
            address: Address::Domain(name.to_string()),
            port,
        }
    }

    /// "host:port" form usable with `TcpStream::connect`.
    pub fn target(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}
