//! Local ingress: local frames in, envelopes out

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use udptunnel_core::{check_destination_port, profiling, Envelope, LocalFrame};
use udptunnel_dispatch::Dispatcher;
use udptunnel_gate::AdmissionGate;
use udptunnel_network::{NetworkError, TunnelClient, MAX_FRAME_LEN};
use udptunnel_settings::Settings;

use crate::routes::PeerTable;
use crate::stats::ForwardStats;

/// Where encoded envelopes go
pub trait EnvelopeSink: Send + Sync {
    fn submit(&self, peer: SocketAddr, envelope: Bytes) -> Result<(), NetworkError>;
}

impl EnvelopeSink for TunnelClient {
    fn submit(&self, peer: SocketAddr, envelope: Bytes) -> Result<(), NetworkError> {
        TunnelClient::submit(self, peer, envelope)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    SourceDenied,
    Malformed,
    ReservedPort(u16),
    TooLarge,
    PeerUnavailable,
    QueueFull,
}

/// What happened to one local datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressOutcome {
    Forwarded { peer: SocketAddr },
    DeliveredLocally,
    Dropped(DropReason),
}

#[derive(Debug, Clone)]
pub struct IngressConfig {
    pub listen_addr: SocketAddr,
    pub sender_identity: Option<Ipv4Addr>,
    pub local_addresses: Vec<IpAddr>,
    pub profiling: bool,
}

impl IngressConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            listen_addr: settings.ingress.listen_addr,
            sender_identity: settings.ingress.sender_identity,
            local_addresses: settings.ingress.local_addresses.clone(),
            profiling: settings.profiling.enabled,
        }
    }
}

pub struct LocalIngress {
    config: IngressConfig,
    gate: Arc<dyn AdmissionGate>,
    routes: PeerTable,
    sink: Arc<dyn EnvelopeSink>,
    local: Arc<Dispatcher>,
    stats: ForwardStats,
}

impl LocalIngress {
    pub fn new(
        config: IngressConfig,
        gate: Arc<dyn AdmissionGate>,
        routes: PeerTable,
        sink: Arc<dyn EnvelopeSink>,
        local: Arc<Dispatcher>,
    ) -> Self {
        Self {
            config,
            gate,
            routes,
            sink,
            local,
            stats: ForwardStats::new(),
        }
    }

    pub fn config(&self) -> &IngressConfig {
        &self.config
    }

    pub fn stats(&self) -> &ForwardStats {
        &self.stats
    }

    /// Handle one datagram received on the ingress socket from `source`
    pub async fn process_datagram(&self, source: SocketAddr, datagram: &[u8]) -> IngressOutcome {
        if !self.gate.is_source_allowed(source.ip()) {
            debug!("Dropping datagram from {}: source not admitted", source);
            return IngressOutcome::Dropped(DropReason::SourceDenied);
        }

        let frame = match LocalFrame::parse(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping datagram from {}: {}", source, e);
                return IngressOutcome::Dropped(DropReason::Malformed);
            }
        };
        let destination = frame.destination;

        if let Err(e) = check_destination_port(destination.port()) {
            debug!("Dropping datagram from {}: {}", source, e);
            return IngressOutcome::Dropped(DropReason::ReservedPort(destination.port()));
        }

        let payload = self.stamp(frame.payload);
        let sender = self
            .config
            .sender_identity
            .filter(|identity| self.gate.is_spoofing_permitted(*identity, destination));

        if self.is_local(destination) {
            self.local.deliver(destination, sender, &payload).await;
            self.stats.record(destination);
            return IngressOutcome::DeliveredLocally;
        }

        let envelope = Envelope::new(destination, sender, &payload);
        if envelope.encoded_len() > MAX_FRAME_LEN {
            warn!(
                "Dropping datagram to {}: envelope of {} bytes is too large",
                destination,
                envelope.encoded_len()
            );
            return IngressOutcome::Dropped(DropReason::TooLarge);
        }

        let peer = self.routes.select(*destination.ip());
        match self.sink.submit(peer, envelope.encode()) {
            Ok(()) => {
                self.stats.record(destination);
                IngressOutcome::Forwarded { peer }
            }
            Err(NetworkError::QueueFull(_)) => {
                debug!("Dropping datagram to {}: queue for {} is full", destination, peer);
                IngressOutcome::Dropped(DropReason::QueueFull)
            }
            Err(NetworkError::FrameTooLarge(_)) => IngressOutcome::Dropped(DropReason::TooLarge),
            Err(e) => {
                debug!("Dropping datagram to {}: {}", destination, e);
                IngressOutcome::Dropped(DropReason::PeerUnavailable)
            }
        }
    }

    fn stamp(&self, payload: &[u8]) -> Bytes {
        if !self.config.profiling {
            return Bytes::copy_from_slice(payload);
        }
        let mut buf = BytesMut::with_capacity(payload.len() + profiling::TIMESTAMP_LEN);
        buf.extend_from_slice(payload);
        profiling::append_timestamp(&mut buf);
        buf.freeze()
    }

    fn is_local(&self, destination: SocketAddrV4) -> bool {
        let ip = IpAddr::V4(*destination.ip());
        ip.is_loopback() || self.config.local_addresses.contains(&ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use udptunnel_core::envelope;
    use udptunnel_dispatch::DatagramSender;
    use udptunnel_gate::{AllowAll, DenyAll, StaticPolicy};
    use udptunnel_settings::{PolicySettings, SpoofRule};

    #[derive(Default)]
    struct Sink {
        submitted: Mutex<Vec<(SocketAddr, Bytes)>>,
        refuse: Option<fn(SocketAddr) -> NetworkError>,
    }

    impl EnvelopeSink for Sink {
        fn submit(&self, peer: SocketAddr, envelope: Bytes) -> Result<(), NetworkError> {
            if let Some(refuse) = self.refuse {
                return Err(refuse(peer));
            }
            self.submitted.lock().push((peer, envelope));
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(SocketAddrV4, Vec<u8>)>>,
    }

    #[async_trait]
    impl DatagramSender for Recorder {
        async fn send_from_self(&self, destination: SocketAddrV4, payload: &[u8]) -> udptunnel_dispatch::Result<()> {
            self.sent.lock().push((destination, payload.to_vec()));
            Ok(())
        }

        async fn send_spoofed(
            &self,
            _source: Ipv4Addr,
            destination: SocketAddrV4,
            payload: &[u8],
        ) -> udptunnel_dispatch::Result<()> {
            self.sent.lock().push((destination, payload.to_vec()));
            Ok(())
        }
    }

    struct Fixture {
        ingress: LocalIngress,
        sink: Arc<Sink>,
        local: Arc<Recorder>,
    }

    fn fixture(gate: Arc<dyn AdmissionGate>, sender_identity: Option<Ipv4Addr>, sink: Sink) -> Fixture {
        let sink = Arc::new(sink);
        let local = Arc::new(Recorder::default());
        let dispatcher = Arc::new(Dispatcher::new(gate.clone(), local.clone(), false));
        let config = IngressConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            sender_identity,
            local_addresses: vec!["10.9.9.9".parse().unwrap()],
            profiling: false,
        };
        let ingress = LocalIngress::new(config, gate, PeerTable::new(Vec::new(), 55554), sink.clone(), dispatcher);
        Fixture { ingress, sink, local }
    }

    fn src() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_forwards_scenario_frame() {
        let f = fixture(Arc::new(AllowAll), None, Sink::default());
        let datagram = [192, 168, 56, 101, 0xC4, 0x7C, 5, 4, 3, 2, 1];

        let outcome = f.ingress.process_datagram(src(), &datagram).await;
        let peer: SocketAddr = "192.168.56.101:55554".parse().unwrap();
        assert_eq!(outcome, IngressOutcome::Forwarded { peer });

        let submitted = f.sink.submitted.lock();
        assert_eq!(submitted.len(), 1);
        let decoded = envelope::decode(&submitted[0].1).unwrap();
        assert_eq!(decoded.destination, "192.168.56.101:50300".parse().unwrap());
        assert_eq!(decoded.sender, None);
        assert_eq!(decoded.payload, &[5, 4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn test_short_datagram_is_malformed() {
        let f = fixture(Arc::new(AllowAll), None, Sink::default());
        let outcome = f.ingress.process_datagram(src(), &[192, 168, 56, 101, 0xC4]).await;
        assert_eq!(outcome, IngressOutcome::Dropped(DropReason::Malformed));
        assert!(f.sink.submitted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_header_only_frame_is_forwarded() {
        let f = fixture(Arc::new(AllowAll), None, Sink::default());
        let outcome = f.ingress.process_datagram(src(), &[10, 0, 0, 1, 0x13, 0x88]).await;
        assert!(matches!(outcome, IngressOutcome::Forwarded { .. }));
    }

    #[tokio::test]
    async fn test_reserved_port_dropped() {
        let f = fixture(Arc::new(AllowAll), None, Sink::default());
        let outcome = f.ingress.process_datagram(src(), &[10, 0, 0, 1, 0x03, 0xFF, 1]).await;
        assert_eq!(outcome, IngressOutcome::Dropped(DropReason::ReservedPort(1023)));
    }

    #[tokio::test]
    async fn test_denied_source_dropped() {
        let f = fixture(Arc::new(DenyAll), None, Sink::default());
        let outcome = f.ingress.process_datagram(src(), &[10, 0, 0, 1, 0x13, 0x88, 1]).await;
        assert_eq!(outcome, IngressOutcome::Dropped(DropReason::SourceDenied));
    }

    #[tokio::test]
    async fn test_sender_attached_only_when_permitted() {
        let policy = StaticPolicy::from_settings(&PolicySettings {
            spoofing: vec![SpoofRule {
                senders: "10.0.0.0/24".parse().unwrap(),
                destinations: vec!["192.168.56.0/24".parse().unwrap()],
            }],
            ..Default::default()
        });
        let identity = Some(Ipv4Addr::new(10, 0, 0, 5));
        let f = fixture(Arc::new(policy), identity, Sink::default());

        f.ingress.process_datagram(src(), &[192, 168, 56, 101, 0x13, 0x88, 1]).await;
        f.ingress.process_datagram(src(), &[192, 168, 57, 1, 0x13, 0x88, 1]).await;

        let submitted = f.sink.submitted.lock();
        assert_eq!(envelope::decode(&submitted[0].1).unwrap().sender, identity);
        assert_eq!(envelope::decode(&submitted[1].1).unwrap().sender, None);
    }

    #[tokio::test]
    async fn test_local_destination_skips_tunnel() {
        let f = fixture(Arc::new(AllowAll), None, Sink::default());

        let outcome = f.ingress.process_datagram(src(), &[127, 0, 0, 1, 0x13, 0x88, 7]).await;
        assert_eq!(outcome, IngressOutcome::DeliveredLocally);
        let outcome = f.ingress.process_datagram(src(), &[10, 9, 9, 9, 0x13, 0x88, 8]).await;
        assert_eq!(outcome, IngressOutcome::DeliveredLocally);

        assert!(f.sink.submitted.lock().is_empty());
        let sent = f.local.sent.lock();
        assert_eq!(sent[0], ("127.0.0.1:5000".parse().unwrap(), vec![7]));
        assert_eq!(sent[1], ("10.9.9.9:5000".parse().unwrap(), vec![8]));
    }

    #[tokio::test]
    async fn test_unavailable_peer_reported() {
        let sink = Sink {
            refuse: Some(NetworkError::PeerUnavailable),
            ..Default::default()
        };
        let f = fixture(Arc::new(AllowAll), None, sink);
        let outcome = f.ingress.process_datagram(src(), &[10, 0, 0, 1, 0x13, 0x88, 1]).await;
        assert_eq!(outcome, IngressOutcome::Dropped(DropReason::PeerUnavailable));
    }

    #[tokio::test]
    async fn test_full_queue_reported() {
        let sink = Sink {
            refuse: Some(NetworkError::QueueFull),
            ..Default::default()
        };
        let f = fixture(Arc::new(AllowAll), None, sink);
        let outcome = f.ingress.process_datagram(src(), &[10, 0, 0, 1, 0x13, 0x88, 1]).await;
        assert_eq!(outcome, IngressOutcome::Dropped(DropReason::QueueFull));
    }

    #[tokio::test]
    async fn test_profiling_stamps_payload() {
        let sink = Arc::new(Sink::default());
        let local = Arc::new(Recorder::default());
        let gate: Arc<dyn AdmissionGate> = Arc::new(AllowAll);
        let config = IngressConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            sender_identity: None,
            local_addresses: Vec::new(),
            profiling: true,
        };
        let dispatcher = Arc::new(Dispatcher::new(gate.clone(), local, false));
        let ingress = LocalIngress::new(config, gate, PeerTable::new(Vec::new(), 55554), sink.clone(), dispatcher);

        ingress.process_datagram(src(), &[10, 0, 0, 1, 0x13, 0x88, 1, 2]).await;
        let submitted = sink.submitted.lock();
        let decoded = envelope::decode(&submitted[0].1).unwrap();
        assert_eq!(decoded.payload.len(), 2 + profiling::TIMESTAMP_LEN);
        assert_eq!(&decoded.payload[..2], &[1, 2]);
    }
}
