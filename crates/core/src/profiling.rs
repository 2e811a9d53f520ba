//! Network profiling timestamps
//!
//! With profiling enabled each relay stage appends an 8-byte big-endian
//! Unix-epoch nanosecond timestamp to the payload it forwards. A profiling
//! receiver at the far end reads them back off the tail of the datagram.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, BytesMut};

/// Width of one appended timestamp
pub const TIMESTAMP_LEN: usize = 8;

/// Nanoseconds since the Unix epoch, saturating at the i64 range
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

pub fn timestamp_bytes(nanos: i64) -> [u8; TIMESTAMP_LEN] {
    nanos.to_be_bytes()
}

/// Append the current time to `buf`
pub fn append_timestamp(buf: &mut BytesMut) {
    buf.put_slice(&timestamp_bytes(now_nanos()));
}

/// Read the last `count` timestamps off the tail of `payload`, oldest first
pub fn read_timestamps(payload: &[u8], count: usize) -> Option<Vec<i64>> {
    let tail_len = count.checked_mul(TIMESTAMP_LEN)?;
    let start = payload.len().checked_sub(tail_len)?;
    Some(
        payload[start..]
            .chunks_exact(TIMESTAMP_LEN)
            .map(|chunk| {
                let mut raw = [0u8; TIMESTAMP_LEN];
                raw.copy_from_slice(chunk);
                i64::from_be_bytes(raw)
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_bytes_known_value() {
        assert_eq!(
            timestamp_bytes(1_257_894_000_000_000_000),
            [17, 116, 239, 237, 171, 24, 96, 0]
        );
    }

    #[test]
    fn test_append_and_read_back() {
        let mut buf = BytesMut::from(&b"data"[..]);
        buf.put_slice(&timestamp_bytes(100));
        buf.put_slice(&timestamp_bytes(250));
        assert_eq!(read_timestamps(&buf, 2), Some(vec![100, 250]));
        assert_eq!(read_timestamps(&buf, 1), Some(vec![250]));
    }

    #[test]
    fn test_append_uses_current_time() {
        let before = now_nanos();
        let mut buf = BytesMut::new();
        append_timestamp(&mut buf);
        assert_eq!(buf.len(), TIMESTAMP_LEN);
        let stamped = read_timestamps(&buf, 1).unwrap()[0];
        assert!(stamped >= before);
    }

    #[test]
    fn test_read_timestamps_short_payload() {
        assert_eq!(read_timestamps(&[1, 2, 3], 1), None);
        assert_eq!(read_timestamps(&[], 0), Some(vec![]));
    }
}
