//! Remote dispatcher: envelope in, datagram out

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use udptunnel_core::{is_reserved_port, profiling, Envelope, EnvelopeError};
use udptunnel_gate::AdmissionGate;
use udptunnel_network::EnvelopeHandler;

use crate::sender::DatagramSender;
use crate::DispatchError;

/// Result of handling one envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Sent; `spoofed` tells whether the original sender was reproduced
    Delivered { destination: SocketAddrV4, spoofed: bool },
    Malformed(EnvelopeError),
    ReservedPort(u16),
    SendFailed { destination: SocketAddrV4 },
}

/// Counters since start
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: u64,
    pub spoofed: u64,
    pub malformed: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    spoofed: AtomicU64,
    malformed: AtomicU64,
    dropped: AtomicU64,
}

pub struct Dispatcher {
    gate: Arc<dyn AdmissionGate>,
    sender: Arc<dyn DatagramSender>,
    profiling: bool,
    counters: Counters,
}

impl Dispatcher {
    pub fn new(gate: Arc<dyn AdmissionGate>, sender: Arc<dyn DatagramSender>, profiling: bool) -> Self {
        Self {
            gate,
            sender,
            profiling,
            counters: Counters::default(),
        }
    }

    /// Decode one envelope received from `peer` and deliver it.
    ///
    /// A malformed envelope is logged and skipped; it never affects the
    /// connection it arrived on.
    pub async fn handle_frame(&self, peer: SocketAddr, frame: &[u8]) -> DispatchOutcome {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!("Malformed envelope from {} ({} bytes): {}", peer, frame.len(), e);
                return DispatchOutcome::Malformed(e);
            }
        };

        let port = envelope.destination.port();
        if is_reserved_port(port) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("Dropping envelope from {} for reserved port {}", peer, port);
            return DispatchOutcome::ReservedPort(port);
        }

        self.deliver(envelope.destination, envelope.sender, envelope.payload)
            .await
    }

    /// Emit one datagram, reproducing `sender` as its source when policy
    /// permits and falling back to our own address otherwise.
    pub async fn deliver(
        &self,
        destination: SocketAddrV4,
        sender: Option<Ipv4Addr>,
        payload: &[u8],
    ) -> DispatchOutcome {
        let stamped;
        let payload = if self.profiling {
            let mut buf = BytesMut::with_capacity(payload.len() + profiling::TIMESTAMP_LEN);
            buf.extend_from_slice(payload);
            profiling::append_timestamp(&mut buf);
            stamped = buf;
            &stamped[..]
        } else {
            payload
        };

        let spoof_as = sender.filter(|s| {
            let permitted = self.gate.is_spoofing_permitted(*s, destination);
            if !permitted {
                debug!("Spoofing {} towards {} not permitted; sending as self", s, destination);
            }
            permitted
        });

        if let Some(source) = spoof_as {
            match self.sender.send_spoofed(source, destination, payload).await {
                Ok(()) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    self.counters.spoofed.fetch_add(1, Ordering::Relaxed);
                    return DispatchOutcome::Delivered {
                        destination,
                        spoofed: true,
                    };
                }
                Err(DispatchError::RawSocketUnavailable) => {
                    debug!("No raw socket; sending to {} as self", destination);
                }
                Err(e) => {
                    warn!("Spoofed send to {} as {} failed: {}; sending as self", destination, source, e);
                }
            }
        }

        match self.sender.send_from_self(destination, payload).await {
            Ok(()) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                DispatchOutcome::Delivered {
                    destination,
                    spoofed: false,
                }
            }
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Send to {} failed: {}", destination, e);
                DispatchOutcome::SendFailed { destination }
            }
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            spoofed: self.counters.spoofed.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl EnvelopeHandler for Dispatcher {
    async fn handle_envelope(&self, peer: SocketAddr, envelope: Bytes) {
        self.handle_frame(peer, &envelope).await;
    }
}
