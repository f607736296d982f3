//! PROXY protocol v2 header.
//!
//! The raw transport can prepend this header to every backend connection it
//! opens, so the backend sees the original client address even after the
//! client was transferred between servers.
//!
//! Wire format (HAProxy PROXY protocol v2):
//! - 12 bytes signature
//! - 1 byte version and command
//! - 1 byte address family and transport protocol
//! - 2 bytes address block length
//! - address block: source ip, destination ip, source port, destination port

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};

const SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Version 2, PROXY command.
const VERSION_COMMAND_PROXY: u8 = 0x21;

/// AF_INET + STREAM.
const TCP_OVER_IPV4: u8 = 0x11;

/// AF_INET6 + STREAM.
const TCP_OVER_IPV6: u8 = 0x21;

const FIXED_LEN: usize = 16;
const IPV4_BLOCK_LEN: usize = 12;
const IPV6_BLOCK_LEN: usize = 36;

/// PROXY v2 header for one proxied connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyProtocolV2 {
    /// Original client address.
    pub src_addr: SocketAddr,
    /// Address the client connected to.
    pub dst_addr: SocketAddr,
}

impl ProxyProtocolV2 {
    pub fn new(src_addr: SocketAddr, dst_addr: SocketAddr) -> Self {
        Self { src_addr, dst_addr }
    }

    /// Encode the header.
    ///
    /// Mixed families are folded to IPv4 when the IPv6 side is a mapped
    /// IPv4 address, and to IPv6 otherwise.
    pub fn encode(&self) -> Bytes {
        let (src_port, dst_port) = (self.src_addr.port(), self.dst_addr.port());

        match (self.src_addr.ip(), self.dst_addr.ip()) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => encode_v4(src, dst, src_port, dst_port),
            (IpAddr::V6(src), IpAddr::V6(dst)) => encode_v6(src, dst, src_port, dst_port),
            (IpAddr::V4(src), IpAddr::V6(dst)) => match dst.to_ipv4_mapped() {
                Some(dst) => encode_v4(src, dst, src_port, dst_port),
                None => encode_v6(src.to_ipv6_mapped(), dst, src_port, dst_port),
            },
            (IpAddr::V6(src), IpAddr::V4(dst)) => match src.to_ipv4_mapped() {
                Some(src) => encode_v4(src, dst, src_port, dst_port),
                None => encode_v6(src, dst.to_ipv6_mapped(), src_port, dst_port),
            },
        }
    }

    /// Decode a header from the front of `data`.
    ///
    /// Returns the header and the number of bytes it occupied.
    pub fn decode(data: &[u8]) -> Option<(Self, usize)> {
        if data.len() < FIXED_LEN || data[..12] != SIGNATURE {
            return None;
        }
        if data[12] != VERSION_COMMAND_PROXY {
            return None;
        }

        let block_len = u16::from_be_bytes([data[14], data[15]]) as usize;
        let block = data.get(FIXED_LEN..FIXED_LEN + block_len)?;

        let (src_ip, dst_ip, ports): (IpAddr, IpAddr, &[u8]) = match data[13] {
            TCP_OVER_IPV4 if block_len >= IPV4_BLOCK_LEN => {
                let src: [u8; 4] = block[0..4].try_into().ok()?;
                let dst: [u8; 4] = block[4..8].try_into().ok()?;
                (Ipv4Addr::from(src).into(), Ipv4Addr::from(dst).into(), &block[8..12])
            }
            TCP_OVER_IPV6 if block_len >= IPV6_BLOCK_LEN => {
                let src: [u8; 16] = block[0..16].try_into().ok()?;
                let dst: [u8; 16] = block[16..32].try_into().ok()?;
                (Ipv6Addr::from(src).into(), Ipv6Addr::from(dst).into(), &block[32..36])
            }
            _ => return None,
        };

        let src_port = u16::from_be_bytes([ports[0], ports[1]]);
        let dst_port = u16::from_be_bytes([ports[2], ports[3]]);

        Some((
            Self::new(
                SocketAddr::new(src_ip, src_port),
                SocketAddr::new(dst_ip, dst_port),
            ),
            FIXED_LEN + block_len,
        ))
    }
}

fn encode_v4(src: Ipv4Addr, dst: Ipv4Addr, src_port: u16, dst_port: u16) -> Bytes {
    let mut buf = header_prefix(TCP_OVER_IPV4, IPV4_BLOCK_LEN);
    buf.put_slice(&src.octets());
    buf.put_slice(&dst.octets());
    buf.put_u16(src_port);
    buf.put_u16(dst_port);
    buf.freeze()
}

fn encode_v6(src: Ipv6Addr, dst: Ipv6Addr, src_port: u16, dst_port: u16) -> Bytes {
    let mut buf = header_prefix(TCP_OVER_IPV6, IPV6_BLOCK_LEN);
    buf.put_slice(&src.octets());
    buf.put_slice(&dst.octets());
    buf.put_u16(src_port);
    buf.put_u16(dst_port);
    buf.freeze()
}

fn header_prefix(family: u8, block_len: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(FIXED_LEN + block_len);
    buf.put_slice(&SIGNATURE);
    buf.put_u8(VERSION_COMMAND_PROXY);
    buf.put_u8(family);
    buf.put_u16(block_len as u16);
    buf
}
