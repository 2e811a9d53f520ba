//! Raw IPv4 emission with a caller-chosen source address
//!
//! The datagram is written as a complete IPv4 + UDP packet on an
//! `IPPROTO_RAW` socket, which implies the header is supplied by us.
//! Opening the socket needs `CAP_NET_RAW` (or root).

use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::{DispatchError, Result};

pub const IPV4_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

const IPPROTO_RAW: i32 = 255;
const IPPROTO_UDP: u8 = 17;
const DEFAULT_TTL: u8 = 64;
const PACKET_ID: u16 = 0x1234;

/// Largest payload that fits a single IPv4 packet
pub const MAX_RAW_PAYLOAD: usize = u16::MAX as usize - IPV4_HEADER_LEN - UDP_HEADER_LEN;

/// Build an IPv4 packet carrying one UDP datagram, checksums included
pub fn build_ipv4_udp_packet(
    source: SocketAddrV4,
    destination: SocketAddrV4,
    payload: &[u8],
) -> Result<Vec<u8>> {
    if payload.len() > MAX_RAW_PAYLOAD {
        return Err(DispatchError::PayloadTooLarge(payload.len()));
    }

    let udp_len = (UDP_HEADER_LEN + payload.len()) as u16;
    let total_len = IPV4_HEADER_LEN as u16 + udp_len;
    let src = source.ip().octets();
    let dst = destination.ip().octets();

    let mut packet = Vec::with_capacity(total_len as usize);

    // IPv4 header
    packet.push(0x45); // version 4, IHL 5
    packet.push(0x00);
    packet.extend_from_slice(&total_len.to_be_bytes());
    packet.extend_from_slice(&PACKET_ID.to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x00]); // flags, fragment offset
    packet.push(DEFAULT_TTL);
    packet.push(IPPROTO_UDP);
    packet.extend_from_slice(&[0x00, 0x00]);
    packet.extend_from_slice(&src);
    packet.extend_from_slice(&dst);
    let ip_checksum = checksum(&[&packet[..IPV4_HEADER_LEN]]);
    packet[10..12].copy_from_slice(&ip_checksum.to_be_bytes());

    // UDP header
    packet.extend_from_slice(&source.port().to_be_bytes());
    packet.extend_from_slice(&destination.port().to_be_bytes());
    packet.extend_from_slice(&udp_len.to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x00]);
    packet.extend_from_slice(payload);

    let len = udp_len.to_be_bytes();
    let pseudo = [
        src[0], src[1], src[2], src[3], dst[0], dst[1], dst[2], dst[3], 0, IPPROTO_UDP, len[0], len[1],
    ];
    let mut udp_checksum = checksum(&[&pseudo, &packet[IPV4_HEADER_LEN..]]);
    if udp_checksum == 0 {
        udp_checksum = 0xFFFF;
    }
    packet[IPV4_HEADER_LEN + 6..IPV4_HEADER_LEN + 8].copy_from_slice(&udp_checksum.to_be_bytes());

    Ok(packet)
}

/// Internet checksum (RFC 1071) over the concatenation of `parts`
pub fn checksum(parts: &[&[u8]]) -> u16 {
    let mut sum: u32 = 0;
    let mut odd: Option<u8> = None;

    for part in parts {
        for &byte in part.iter() {
            match odd.take() {
                Some(high) => sum += u32::from(u16::from_be_bytes([high, byte])),
                None => odd = Some(byte),
            }
        }
    }
    if let Some(high) = odd {
        sum += u32::from(u16::from_be_bytes([high, 0]));
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Raw IPv4 socket for header-included sends
#[derive(Clone)]
pub struct RawSocket {
    socket: Arc<Socket>,
}

impl RawSocket {
    pub fn open() -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::from(IPPROTO_RAW)))?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// Send one UDP datagram from `source` to `destination`
    pub async fn send(
        &self,
        source: SocketAddrV4,
        destination: SocketAddrV4,
        payload: &[u8],
    ) -> Result<()> {
        let packet = build_ipv4_udp_packet(source, destination, payload)?;
        let socket = self.socket.clone();
        let target = SockAddr::from(SocketAddr::V4(SocketAddrV4::new(*destination.ip(), 0)));

        let sent = tokio::task::spawn_blocking(move || socket.send_to(&packet, &target))
            .await
            .map_err(|e| DispatchError::Io(io::Error::new(io::ErrorKind::Other, e)))??;
        if sent != IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len() {
            return Err(DispatchError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short raw send of {} bytes", sent),
            )));
        }
        Ok(())
    }
}
