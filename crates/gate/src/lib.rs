//! udptunnel admission gate
//!
//! Decides which peers may talk to this relay and for which
//! sender/destination pairs the original sender address may be reproduced.
//! The gate is consulted on every datagram and every accepted connection,
//! so implementations answer from immutable data.

mod policy;

pub use policy::StaticPolicy;

use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

/// Admission and spoofing decisions
pub trait AdmissionGate: Send + Sync {
    /// May traffic from `source` enter the relay (local ingress or tunnel)?
    fn is_source_allowed(&self, source: IpAddr) -> bool;

    /// May a datagram to `destination` carry `sender` as its source address?
    fn is_spoofing_permitted(&self, sender: Ipv4Addr, destination: SocketAddrV4) -> bool;
}

impl<G: AdmissionGate + ?Sized> AdmissionGate for Arc<G> {
    fn is_source_allowed(&self, source: IpAddr) -> bool {
        (**self).is_source_allowed(source)
    }

    fn is_spoofing_permitted(&self, sender: Ipv4Addr, destination: SocketAddrV4) -> bool {
        (**self).is_spoofing_permitted(sender, destination)
    }
}

/// Admits every source and permits every spoof
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AdmissionGate for AllowAll {
    fn is_source_allowed(&self, _source: IpAddr) -> bool {
        true
    }

    fn is_spoofing_permitted(&self, _sender: Ipv4Addr, _destination: SocketAddrV4) -> bool {
        true
    }
}

/// Refuses everything
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl AdmissionGate for DenyAll {
    fn is_source_allowed(&self, _source: IpAddr) -> bool {
        false
    }

    fn is_spoofing_permitted(&self, _sender: Ipv4Addr, _destination: SocketAddrV4) -> bool {
        false
    }
}
