//! Live tunnel connections
//!
//! `ConnectionRegistry` is owned by the connection manager task and is the
//! only place connections are added or removed. Everyone else gets a
//! read-only `RegistryView`.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;

/// Registry key of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by our tunnel server
    Inbound,
    /// Dialed by our tunnel client
    Outbound,
}

/// Cloneable reference to a live connection's send queue
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub direction: Direction,
    pub queue: mpsc::Sender<Bytes>,
    pub established_at: Instant,
}

/// Point-in-time description of a connection, for status logging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub direction: Direction,
    pub age: Duration,
    pub queued: usize,
}

#[derive(Default)]
struct Entries {
    connections: HashMap<ConnectionId, ConnectionHandle>,
    by_ip: HashMap<IpAddr, ConnectionId>,
}

/// Owner of all connection entries
pub struct ConnectionRegistry {
    entries: Arc<RwLock<Entries>>,
    next_id: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(Entries::default())),
            next_id: 1,
        }
    }

    pub fn view(&self) -> RegistryView {
        RegistryView {
            entries: self.entries.clone(),
        }
    }

    /// Register a connection; it becomes the preferred route to its peer IP
    pub fn insert(
        &mut self,
        peer: SocketAddr,
        direction: Direction,
        queue: mpsc::Sender<Bytes>,
    ) -> ConnectionHandle {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;

        let handle = ConnectionHandle {
            id,
            peer,
            direction,
            queue,
            established_at: Instant::now(),
        };

        let mut entries = self.entries.write();
        entries.connections.insert(id, handle.clone());
        entries.by_ip.insert(peer.ip(), id);
        handle
    }

    /// Remove a connection; another connection to the same IP, if any,
    /// takes over as the preferred route.
    pub fn remove(&mut self, id: ConnectionId) -> Option<ConnectionHandle> {
        let mut entries = self.entries.write();
        let handle = entries.connections.remove(&id)?;
        let ip = handle.peer.ip();

        if entries.by_ip.get(&ip) == Some(&id) {
            let replacement = entries
                .connections
                .values()
                .filter(|h| h.peer.ip() == ip)
                .max_by_key(|h| h.id)
                .map(|h| h.id);
            match replacement {
                Some(other) => {
                    entries.by_ip.insert(ip, other);
                }
                None => {
                    entries.by_ip.remove(&ip);
                }
            }
        }
        Some(handle)
    }

    pub fn len(&self) -> usize {
        self.entries.read().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only access to the registry
#[derive(Clone)]
pub struct RegistryView {
    entries: Arc<RwLock<Entries>>,
}

impl RegistryView {
    pub fn get(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.entries.read().connections.get(&id).cloned()
    }

    /// Preferred connection to a peer host, inbound or outbound
    pub fn lookup_peer(&self, ip: IpAddr) -> Option<ConnectionHandle> {
        let entries = self.entries.read();
        let id = entries.by_ip.get(&ip)?;
        entries.connections.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let entries = self.entries.read();
        let mut infos: Vec<_> = entries
            .connections
            .values()
            .map(|h| ConnectionInfo {
                id: h.id,
                peer: h.peer,
                direction: h.direction,
                age: h.established_at.elapsed(),
                queued: h.queue.max_capacity() - h.queue.capacity(),
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }
}
