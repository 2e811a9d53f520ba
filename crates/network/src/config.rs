use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use udptunnel_settings::{Settings, TunnelSettings};

/// Runtime parameters of the tunnel layer
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub listen_addr: SocketAddr,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub queue_depth: usize,
    /// Local address outbound connections are bound to
    pub bind_address: Option<IpAddr>,
    /// Peers kept connected at all times
    pub persistent_peers: Vec<SocketAddr>,
}

impl TunnelConfig {
    pub fn from_tunnel_settings(tunnel: &TunnelSettings) -> Self {
        Self {
            listen_addr: tunnel.listen_addr,
            connect_timeout: tunnel.connect_timeout(),
            idle_timeout: tunnel.idle_timeout(),
            write_timeout: tunnel.write_timeout(),
            reconnect_initial: tunnel.reconnect_initial(),
            reconnect_max: tunnel.reconnect_max(),
            queue_depth: tunnel.queue_depth.max(1),
            bind_address: None,
            persistent_peers: Vec::new(),
        }
    }

    /// Static route peers become persistent; `bind_to_sender` binds
    /// outbound connections to the sender identity.
    pub fn from_settings(settings: &Settings) -> Self {
        let mut config = Self::from_tunnel_settings(&settings.tunnel);
        if settings.tunnel.bind_to_sender {
            config.bind_address = settings.ingress.sender_identity.map(IpAddr::V4);
        }

        let mut peers: Vec<SocketAddr> = settings.routes.iter().map(|r| r.peer).collect();
        peers.sort();
        peers.dedup();
        config.persistent_peers = peers;
        config
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self::from_tunnel_settings(&TunnelSettings::default())
    }
}
