//! Destination to peer relay selection

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use ipnet::IpNet;

use udptunnel_settings::Settings;

/// Static routes, longest prefix first
#[derive(Debug, Clone)]
pub struct PeerTable {
    routes: Vec<(IpNet, SocketAddr)>,
    tunnel_port: u16,
}

impl PeerTable {
    /// Destinations not covered by a route are reached through the relay
    /// on the destination host itself, at `tunnel_port`.
    pub fn new(mut routes: Vec<(IpNet, SocketAddr)>, tunnel_port: u16) -> Self {
        routes.sort_by(|a, b| b.0.prefix_len().cmp(&a.0.prefix_len()));
        Self { routes, tunnel_port }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let routes = settings
            .routes
            .iter()
            .map(|route| (route.subnet.trunc(), route.peer))
            .collect();
        Self::new(routes, settings.tunnel.port)
    }

    /// Peer relay for `destination`
    pub fn select(&self, destination: Ipv4Addr) -> SocketAddr {
        let ip = IpAddr::V4(destination);
        self.routes
            .iter()
            .find(|(subnet, _)| subnet.contains(&ip))
            .map(|(_, peer)| *peer)
            .unwrap_or_else(|| SocketAddr::new(ip, self.tunnel_port))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(subnet: &str, peer: &str) -> (IpNet, SocketAddr) {
        (subnet.parse().unwrap(), peer.parse().unwrap())
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = PeerTable::new(
            vec![
                route("10.0.0.0/8", "203.0.113.1:55554"),
                route("10.1.0.0/16", "203.0.113.2:55554"),
                route("10.1.2.0/24", "203.0.113.3:55554"),
            ],
            55554,
        );
        assert_eq!(table.select(Ipv4Addr::new(10, 1, 2, 3)), "203.0.113.3:55554".parse().unwrap());
        assert_eq!(table.select(Ipv4Addr::new(10, 1, 9, 9)), "203.0.113.2:55554".parse().unwrap());
        assert_eq!(table.select(Ipv4Addr::new(10, 9, 9, 9)), "203.0.113.1:55554".parse().unwrap());
    }

    #[test]
    fn test_default_route_is_destination_host() {
        let table = PeerTable::new(vec![route("10.0.0.0/8", "203.0.113.1:55554")], 55554);
        assert_eq!(
            table.select(Ipv4Addr::new(192, 168, 56, 101)),
            "192.168.56.101:55554".parse().unwrap()
        );
    }

    #[test]
    fn test_from_settings_uses_tunnel_port() {
        let mut settings = Settings::default();
        settings.tunnel.port = 6000;
        let table = PeerTable::from_settings(&settings);
        assert!(table.is_empty());
        assert_eq!(table.select(Ipv4Addr::new(10, 0, 0, 1)), "10.0.0.1:6000".parse().unwrap());
    }
}
