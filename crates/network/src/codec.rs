//! Length-prefixed envelope framing
//!
//! Wire format: `[len: u16 BE][envelope: len bytes]`. A zero length is
//! never written and is treated as a framing error when read.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::NetworkError;

/// Largest envelope the 2-byte length prefix can describe
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Length prefix size
pub const LENGTH_PREFIX_LEN: usize = 2;

/// Codec for envelopes on a tunnel byte stream
#[derive(Debug, Clone, Copy, Default)]
pub struct TunnelCodec;

impl Decoder for TunnelCodec {
    type Item = BytesMut;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, NetworkError> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let len = u16::from_be_bytes([src[0], src[1]]) as usize;
        if len == 0 {
            return Err(NetworkError::EmptyFrame);
        }

        let total = LENGTH_PREFIX_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        Ok(Some(src.split_to(len)))
    }
}

impl Encoder<Bytes> for TunnelCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), NetworkError> {
        if item.is_empty() {
            return Err(NetworkError::EmptyFrame);
        }
        if item.len() > MAX_FRAME_LEN {
            return Err(NetworkError::FrameTooLarge(item.len()));
        }

        dst.reserve(LENGTH_PREFIX_LEN + item.len());
        dst.put_u16(item.len() as u16);
        dst.extend_from_slice(&item);
        Ok(())
    }
}
