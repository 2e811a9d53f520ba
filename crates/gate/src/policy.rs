//! Policy built from the `policy` settings section

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};

use ipnet::IpNet;
use tracing::debug;

use udptunnel_settings::PolicySettings;

use crate::AdmissionGate;

#[derive(Debug, Clone)]
struct SpoofAllowance {
    senders: IpNet,
    destinations: Vec<IpNet>,
}

/// Static CIDR-based policy
#[derive(Debug, Clone, Default)]
pub struct StaticPolicy {
    allowed_sources: Vec<IpNet>,
    denied_sources: Vec<IpNet>,
    spoofing: Vec<SpoofAllowance>,
    blocked_ports: HashSet<u16>,
}

impl StaticPolicy {
    pub fn from_settings(settings: &PolicySettings) -> Self {
        let policy = Self {
            allowed_sources: settings.allowed_sources.clone(),
            denied_sources: settings.denied_sources.clone(),
            spoofing: settings
                .spoofing
                .iter()
                .map(|rule| SpoofAllowance {
                    senders: rule.senders,
                    destinations: rule.destinations.clone(),
                })
                .collect(),
            blocked_ports: settings.blocked_ports.iter().copied().collect(),
        };
        debug!(
            allowed = policy.allowed_sources.len(),
            denied = policy.denied_sources.len(),
            spoof_rules = policy.spoofing.len(),
            blocked_ports = policy.blocked_ports.len(),
            "Built static admission policy"
        );
        policy
    }

    pub fn is_port_blocked(&self, port: u16) -> bool {
        self.blocked_ports.contains(&port)
    }
}

impl AdmissionGate for StaticPolicy {
    fn is_source_allowed(&self, source: IpAddr) -> bool {
        let source = canonical(source);
        if self.denied_sources.iter().any(|net| net.contains(&source)) {
            return false;
        }
        self.allowed_sources.is_empty() || self.allowed_sources.iter().any(|net| net.contains(&source))
    }

    fn is_spoofing_permitted(&self, sender: Ipv4Addr, destination: SocketAddrV4) -> bool {
        if self.is_port_blocked(destination.port()) {
            return false;
        }
        let sender = IpAddr::V4(sender);
        let dest_ip = IpAddr::V4(*destination.ip());
        self.spoofing.iter().any(|rule| {
            rule.senders.contains(&sender) && rule.destinations.iter().any(|net| net.contains(&dest_ip))
        })
    }
}

/// IPv4-mapped IPv6 peers are matched against IPv4 rules
fn canonical(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(addr),
        v4 => v4,
    }
}
