//! Two relays on loopback, one local frame, one delivered datagram
//!
//! Relay A accepts the local frame on its ingress port, routes it to relay
//! B over a plain tunnel, and B's dispatcher hands the reconstructed
//! datagram to a recording sender instead of the network.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use udptunnel_core::envelope;
use udptunnel_daemon::{RelayService, RunningRelay};
use udptunnel_dispatch::DatagramSender;
use udptunnel_network::PlainHandshake;
use udptunnel_settings::{RouteSettings, Settings, SpoofRule};

// =============================================================================
// HELPERS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
struct Emitted {
    source: Option<Ipv4Addr>,
    destination: SocketAddrV4,
    payload: Vec<u8>,
}

/// Sender that records datagrams on a channel instead of emitting them
struct Recorder {
    tx: mpsc::UnboundedSender<Emitted>,
}

impl Recorder {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Emitted>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl DatagramSender for Recorder {
    async fn send_from_self(
        &self,
        destination: SocketAddrV4,
        payload: &[u8],
    ) -> udptunnel_dispatch::Result<()> {
        let _ = self.tx.send(Emitted {
            source: None,
            destination,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn send_spoofed(
        &self,
        source: Ipv4Addr,
        destination: SocketAddrV4,
        payload: &[u8],
    ) -> udptunnel_dispatch::Result<()> {
        let _ = self.tx.send(Emitted {
            source: Some(source),
            destination,
            payload: payload.to_vec(),
        });
        Ok(())
    }
}

fn loopback_settings() -> Settings {
    let mut settings = Settings::default();
    settings.ingress.listen_addr = "127.0.0.1:0".parse().unwrap();
    settings.tunnel.listen_addr = "127.0.0.1:0".parse().unwrap();
    settings.tunnel.reconnect_initial_ms = 50;
    settings.tunnel.reconnect_max_ms = 200;
    settings.dispatch.bind_addr = "127.0.0.1:0".parse().unwrap();
    settings.dispatch.raw_socket = false;
    settings
}

fn route_to(peer: SocketAddr) -> RouteSettings {
    RouteSettings {
        subnet: "192.168.56.0/24".parse().unwrap(),
        peer,
    }
}

fn spoof_rule() -> SpoofRule {
    SpoofRule {
        senders: "10.1.1.0/24".parse().unwrap(),
        destinations: vec!["192.168.56.0/24".parse().unwrap()],
    }
}

async fn start(settings: Settings) -> (RunningRelay, mpsc::UnboundedReceiver<Emitted>) {
    let (recorder, rx) = Recorder::new();
    let service = RelayService::with_handshake(settings, Arc::new(PlainHandshake));
    let relay = service.start_with_sender(recorder).await.unwrap();
    (relay, rx)
}

async fn send_local(ingress: SocketAddr, datagram: &[u8]) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(datagram, ingress).await.unwrap();
}

async fn next_emitted(rx: &mut mpsc::UnboundedReceiver<Emitted>) -> Emitted {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no datagram emitted")
        .expect("recorder closed")
}

const REFERENCE_FRAME: [u8; 11] = [192, 168, 56, 101, 0xC4, 0x7C, 5, 4, 3, 2, 1];

// =============================================================================
// TESTS
// =============================================================================

#[tokio::test]
async fn test_local_frame_reaches_remote_destination() {
    let (remote, mut remote_rx) = start(loopback_settings()).await;

    let mut settings = loopback_settings();
    settings.routes = vec![route_to(remote.tunnel_addr())];
    let (local, _local_rx) = start(settings).await;

    send_local(local.ingress_addr(), &REFERENCE_FRAME).await;

    let emitted = next_emitted(&mut remote_rx).await;
    assert_eq!(
        emitted,
        Emitted {
            source: None,
            destination: "192.168.56.101:50300".parse().unwrap(),
            payload: vec![5, 4, 3, 2, 1],
        }
    );
    assert_eq!(remote.dispatch_stats().delivered, 1);

    local.shutdown().await;
    remote.shutdown().await;
}

#[tokio::test]
async fn test_datagrams_arrive_in_order() {
    let (remote, mut remote_rx) = start(loopback_settings()).await;

    let mut settings = loopback_settings();
    settings.routes = vec![route_to(remote.tunnel_addr())];
    let (local, _local_rx) = start(settings).await;

    // first datagram establishes the tunnel
    send_local(local.ingress_addr(), &REFERENCE_FRAME).await;
    next_emitted(&mut remote_rx).await;

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for i in 0..20u8 {
        let mut frame = REFERENCE_FRAME[..6].to_vec();
        frame.push(i);
        socket.send_to(&frame, local.ingress_addr()).await.unwrap();
    }
    for i in 0..20u8 {
        assert_eq!(next_emitted(&mut remote_rx).await.payload, vec![i]);
    }

    local.shutdown().await;
    remote.shutdown().await;
}

#[tokio::test]
async fn test_permitted_sender_is_reproduced() {
    let mut remote_settings = loopback_settings();
    remote_settings.policy.spoofing = vec![spoof_rule()];
    let (remote, mut remote_rx) = start(remote_settings).await;

    let mut settings = loopback_settings();
    settings.ingress.sender_identity = Some(Ipv4Addr::new(10, 1, 1, 9));
    settings.policy.spoofing = vec![spoof_rule()];
    settings.routes = vec![route_to(remote.tunnel_addr())];
    let (local, _local_rx) = start(settings).await;

    send_local(local.ingress_addr(), &REFERENCE_FRAME).await;

    let emitted = next_emitted(&mut remote_rx).await;
    assert_eq!(emitted.source, Some(Ipv4Addr::new(10, 1, 1, 9)));
    assert_eq!(emitted.payload, vec![5, 4, 3, 2, 1]);
    assert_eq!(remote.dispatch_stats().spoofed, 1);

    local.shutdown().await;
    remote.shutdown().await;
}

#[tokio::test]
async fn test_sender_dropped_when_remote_policy_refuses() {
    // remote has no spoofing rules
    let (remote, mut remote_rx) = start(loopback_settings()).await;

    let mut settings = loopback_settings();
    settings.ingress.sender_identity = Some(Ipv4Addr::new(10, 1, 1, 9));
    settings.policy.spoofing = vec![spoof_rule()];
    settings.routes = vec![route_to(remote.tunnel_addr())];
    let (local, _local_rx) = start(settings).await;

    send_local(local.ingress_addr(), &REFERENCE_FRAME).await;

    let emitted = next_emitted(&mut remote_rx).await;
    assert_eq!(emitted.source, None);
    assert_eq!(emitted.destination, "192.168.56.101:50300".parse().unwrap());

    local.shutdown().await;
    remote.shutdown().await;
}

#[tokio::test]
async fn test_reserved_port_never_leaves_ingress() {
    let (remote, mut remote_rx) = start(loopback_settings()).await;

    let mut settings = loopback_settings();
    settings.routes = vec![route_to(remote.tunnel_addr())];
    let (local, _local_rx) = start(settings).await;

    send_local(local.ingress_addr(), &[192, 168, 56, 101, 0x03, 0xFF, 1]).await;
    send_local(local.ingress_addr(), &[192, 168, 56, 101]).await;
    send_local(local.ingress_addr(), &REFERENCE_FRAME).await;

    // only the valid frame arrives
    let emitted = next_emitted(&mut remote_rx).await;
    assert_eq!(emitted.destination.port(), 50300);
    assert!(
        tokio::time::timeout(Duration::from_millis(200), remote_rx.recv())
            .await
            .is_err()
    );

    local.shutdown().await;
    remote.shutdown().await;
}

#[tokio::test]
async fn test_reply_reuses_inbound_connection() {
    let (remote, mut remote_rx) = start(loopback_settings()).await;

    let mut settings = loopback_settings();
    settings.routes = vec![route_to(remote.tunnel_addr())];
    let (local, mut local_rx) = start(settings).await;

    send_local(local.ingress_addr(), &REFERENCE_FRAME).await;
    next_emitted(&mut remote_rx).await;
    assert_eq!(remote.client().registry().len(), 1);

    // the remote has no route back; the inbound connection serves the reply
    let reply = envelope::encode("127.0.0.1:50301".parse().unwrap(), None, b"pong");
    let any_port: SocketAddr = "127.0.0.1:9".parse().unwrap();
    remote.client().submit(any_port, reply).unwrap();

    let emitted = next_emitted(&mut local_rx).await;
    assert_eq!(emitted.payload, b"pong".to_vec());
    assert_eq!(emitted.destination, "127.0.0.1:50301".parse().unwrap());
    assert_eq!(remote.client().registry().len(), 1);

    local.shutdown().await;
    remote.shutdown().await;
}

#[tokio::test]
async fn test_remote_restart_is_reconnected() {
    let (remote, _remote_rx) = start(loopback_settings()).await;
    let tunnel_addr = remote.tunnel_addr();

    let mut settings = loopback_settings();
    settings.routes = vec![route_to(tunnel_addr)];
    let (local, _local_rx) = start(settings).await;

    send_local(local.ingress_addr(), &REFERENCE_FRAME).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    remote.shutdown().await;

    // same port, fresh relay
    let mut restarted = loopback_settings();
    restarted.tunnel.listen_addr = tunnel_addr;
    let (recorder, mut remote_rx) = Recorder::new();
    let service = RelayService::with_handshake(restarted, Arc::new(PlainHandshake));
    let mut attempts = 0;
    let remote = loop {
        // the old listener socket closes asynchronously
        match service.start_with_sender(recorder.clone()).await {
            Ok(relay) => break relay,
            Err(e) if attempts < 20 => {
                attempts += 1;
                eprintln!("rebind attempt {}: {}", attempts, e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => panic!("could not rebind {}: {}", tunnel_addr, e),
        }
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let emitted = loop {
        send_local(local.ingress_addr(), &REFERENCE_FRAME).await;
        match tokio::time::timeout(Duration::from_millis(100), remote_rx.recv()).await {
            Ok(Some(emitted)) => break emitted,
            _ if tokio::time::Instant::now() < deadline => continue,
            _ => panic!("local relay never reconnected"),
        }
    };
    assert_eq!(emitted.payload, vec![5, 4, 3, 2, 1]);

    local.shutdown().await;
    remote.shutdown().await;
}
