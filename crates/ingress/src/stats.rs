//! Per-destination forward counters

use std::collections::HashMap;
use std::net::SocketAddrV4;

use parking_lot::Mutex;
use tracing::debug;

/// Log the first datagram to each destination and every this many after
pub const LOG_EVERY: u64 = 100;

#[derive(Default)]
pub struct ForwardStats {
    counts: Mutex<HashMap<SocketAddrV4, u64>>,
}

impl ForwardStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one datagram to `destination`, returning the new total
    pub fn record(&self, destination: SocketAddrV4) -> u64 {
        let count = {
            let mut counts = self.counts.lock();
            let count = counts.entry(destination).or_insert(0);
            *count += 1;
            *count
        };
        if count == 1 || count % LOG_EVERY == 0 {
            debug!("Forwarded {} datagrams to {}", count, destination);
        }
        count
    }

    pub fn count(&self, destination: SocketAddrV4) -> u64 {
        self.counts.lock().get(&destination).copied().unwrap_or(0)
    }

    pub fn destinations(&self) -> usize {
        self.counts.lock().len()
    }
}
