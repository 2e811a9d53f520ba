//! Tunnel envelope codec
//!
//! One envelope carries one relayed datagram between two relay instances:
//!
//! ```text
//! 0x75 | version (3) | port (2, BE) | 0x04 | dest ip (4) | [0x76 | sender ip (4)] | 0x80 | payload
//! ```
//!
//! The envelope has no length field of its own. Message boundaries come from
//! the transport framing that wraps each encoded envelope on the stream.

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    EnvelopeError, ProtocolVersion, ADDRESS_V4_TAG, ENVELOPE_TAG, SENDER_TAG, TERMINATOR,
};

/// Header length without the optional sender block
pub const BASE_HEADER_LEN: usize = 1 + 3 + 2 + 1 + 4 + 1;

/// Length of the optional sender block (marker + IPv4 address)
pub const SENDER_BLOCK_LEN: usize = 1 + 4;

/// A decoded envelope borrowing its payload from the input buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope<'a> {
    pub version: ProtocolVersion,
    pub destination: SocketAddrV4,
    /// Original sender to impersonate at the far end, if requested
    pub sender: Option<Ipv4Addr>,
    pub payload: &'a [u8],
}

impl<'a> Envelope<'a> {
    /// Build an envelope at the current protocol version
    pub fn new(destination: SocketAddrV4, sender: Option<Ipv4Addr>, payload: &'a [u8]) -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            destination,
            sender,
            payload,
        }
    }

    pub fn header_len(&self) -> usize {
        match self.sender {
            Some(_) => BASE_HEADER_LEN + SENDER_BLOCK_LEN,
            None => BASE_HEADER_LEN,
        }
    }

    pub fn encoded_len(&self) -> usize {
        self.header_len() + self.payload.len()
    }

    /// Append the wire form of this envelope to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u8(ENVELOPE_TAG);
        buf.put_slice(&self.version.to_bytes());
        buf.put_u16(self.destination.port());
        buf.put_u8(ADDRESS_V4_TAG);
        buf.put_slice(&self.destination.ip().octets());
        if let Some(sender) = self.sender {
            buf.put_u8(SENDER_TAG);
            buf.put_slice(&sender.octets());
        }
        buf.put_u8(TERMINATOR);
        buf.put_slice(self.payload);
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Parse an envelope, validating every fixed marker in position.
    ///
    /// Never panics on hostile input: truncation, bad markers and unknown
    /// versions all surface as [`EnvelopeError`].
    pub fn decode(bytes: &'a [u8]) -> Result<Self, EnvelopeError> {
        let mut reader = Reader::new(bytes);

        let tag = reader.byte()?;
        if tag != ENVELOPE_TAG {
            return Err(EnvelopeError::InvalidTag(tag));
        }

        let version = ProtocolVersion::from_bytes(reader.array()?);
        if !version.is_supported() {
            return Err(EnvelopeError::UnsupportedVersion(version));
        }

        let port = u16::from_be_bytes(reader.array()?);

        let address_tag = reader.byte()?;
        if address_tag != ADDRESS_V4_TAG {
            return Err(EnvelopeError::InvalidAddressTag(address_tag));
        }
        let destination = SocketAddrV4::new(Ipv4Addr::from(reader.array::<4>()?), port);

        let sender = match reader.byte()? {
            TERMINATOR => None,
            SENDER_TAG => {
                let octets = reader
                    .array::<4>()
                    .map_err(|_| EnvelopeError::TruncatedSender)?;
                match reader.byte()? {
                    TERMINATOR => Some(Ipv4Addr::from(octets)),
                    other => return Err(EnvelopeError::InvalidMarker(other)),
                }
            }
            other => return Err(EnvelopeError::InvalidMarker(other)),
        };

        Ok(Self {
            version,
            destination,
            sender,
            payload: reader.rest(),
        })
    }
}

/// Encode an envelope at the current protocol version
pub fn encode(destination: SocketAddrV4, sender: Option<Ipv4Addr>, payload: &[u8]) -> Bytes {
    Envelope::new(destination, sender, payload).encode()
}

/// Decode an envelope from its wire form
pub fn decode(bytes: &[u8]) -> Result<Envelope<'_>, EnvelopeError> {
    Envelope::decode(bytes)
}

/// Positional reader over the header bytes
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], EnvelopeError> {
        let end = self.pos + len;
        let slice = self.buf.get(self.pos..end).ok_or(EnvelopeError::Truncated {
            needed: end,
            available: self.buf.len(),
        })?;
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8, EnvelopeError> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], EnvelopeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn rest(self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}
