use thiserror::Error;

use crate::ProtocolVersion;

/// Reasons an envelope fails to decode
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Envelope truncated: need {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Invalid envelope tag: 0x{0:02x}")]
    InvalidTag(u8),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(ProtocolVersion),

    #[error("Unsupported address field tag: 0x{0:02x}")]
    InvalidAddressTag(u8),

    #[error("Invalid header marker: 0x{0:02x}")]
    InvalidMarker(u8),

    #[error("Truncated sender block")]
    TruncatedSender,
}

/// Reasons a local frame is rejected before encoding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Malformed local frame: {len} bytes, need at least 6")]
    MalformedLocalFrame { len: usize },

    #[error("Reserved destination port: {0}")]
    ReservedPort(u16),
}
