//! Local frame: what applications send to the relay's ingress port
//!
//! `[4 bytes destination IPv4][2 bytes destination port, BE][payload]`

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{BufMut, Bytes, BytesMut};

use crate::{is_reserved_port, FrameError};

/// Address + port prefix length
pub const LOCAL_HEADER_LEN: usize = 6;

/// A parsed local frame borrowing its payload from the datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalFrame<'a> {
    pub destination: SocketAddrV4,
    pub payload: &'a [u8],
}

impl<'a> LocalFrame<'a> {
    pub fn parse(datagram: &'a [u8]) -> Result<Self, FrameError> {
        if datagram.len() < LOCAL_HEADER_LEN {
            return Err(FrameError::MalformedLocalFrame { len: datagram.len() });
        }
        let ip = Ipv4Addr::new(datagram[0], datagram[1], datagram[2], datagram[3]);
        let port = u16::from_be_bytes([datagram[4], datagram[5]]);
        Ok(Self {
            destination: SocketAddrV4::new(ip, port),
            payload: &datagram[LOCAL_HEADER_LEN..],
        })
    }

    pub fn encode_into(destination: SocketAddrV4, payload: &[u8], buf: &mut BytesMut) {
        buf.reserve(LOCAL_HEADER_LEN + payload.len());
        buf.put_slice(&destination.ip().octets());
        buf.put_u16(destination.port());
        buf.put_slice(payload);
    }

    pub fn encode(destination: SocketAddrV4, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(LOCAL_HEADER_LEN + payload.len());
        Self::encode_into(destination, payload, &mut buf);
        buf.freeze()
    }
}

/// Reject destinations on reserved ports
pub fn check_destination_port(port: u16) -> Result<(), FrameError> {
    if is_reserved_port(port) {
        return Err(FrameError::ReservedPort(port));
    }
    Ok(())
}
