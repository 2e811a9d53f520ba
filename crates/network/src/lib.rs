//! udptunnel network
//!
//! Authenticated stream connections between relays carrying
//! length-prefixed envelopes.
//!
//! ## Components
//!
//! - **TunnelCodec**: 2-byte big-endian length framing
//! - **TunnelClient**: per-peer connectors with reconnect backoff
//! - **TunnelServer**: accepts peer relays after the admission gate
//! - **ConnectionRegistry**: single owner of live connections
//! - **TlsHandshake**: mutual TLS with the relay's certificate

mod backoff;
mod client;
pub mod codec;
mod config;
mod connection;
mod error;
mod manager;
mod registry;
mod server;
mod transport;

pub use backoff::Backoff;
pub use client::{ConnectorState, TunnelClient};
pub use codec::{TunnelCodec, MAX_FRAME_LEN};
pub use config::TunnelConfig;
pub use connection::CloseReason;
pub use error::{NetworkError, Result};
pub use registry::{
    ConnectionHandle, ConnectionId, ConnectionInfo, ConnectionRegistry, Direction, RegistryView,
};
pub use server::TunnelServer;
pub use transport::{BoxedStream, Handshake, PlainHandshake, TlsHandshake, TunnelStream};

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use udptunnel_gate::AdmissionGate;

use crate::connection::ConnectionLimits;
use crate::manager::TunnelManager;
use crate::server::Acceptor;

/// Receives every envelope read from any tunnel connection
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle_envelope(&self, peer: SocketAddr, envelope: Bytes);
}

/// Resolves once shutdown is signalled or the signal sender is gone
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Tunnel server, client and connection manager running together
pub struct TunnelNode {
    client: TunnelClient,
    server: TunnelServer,
    manager: JoinHandle<()>,
}

impl TunnelNode {
    pub async fn start(
        config: TunnelConfig,
        handshake: Arc<dyn Handshake>,
        gate: Arc<dyn AdmissionGate>,
        handler: Arc<dyn EnvelopeHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let limits = ConnectionLimits {
            idle_timeout: config.idle_timeout,
            write_timeout: config.write_timeout,
        };
        let (manager, manager_handle) = TunnelManager::new(handler, limits, shutdown.clone());
        let manager = tokio::spawn(manager.run());

        let acceptor = Acceptor {
            handshake: handshake.clone(),
            gate,
            manager: manager_handle.clone(),
            handshake_timeout: config.connect_timeout,
            queue_depth: config.queue_depth,
        };
        let server = match TunnelServer::start(config.listen_addr, acceptor, shutdown.clone()).await {
            Ok(server) => server,
            Err(e) => {
                manager.abort();
                return Err(e);
            }
        };

        let client = TunnelClient::new(config, handshake, manager_handle, shutdown);
        client.connect_persistent();

        Ok(Self {
            client,
            server,
            manager,
        })
    }

    pub fn client(&self) -> &TunnelClient {
        &self.client
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.server.listen_addr()
    }

    pub fn registry(&self) -> &RegistryView {
        self.client.registry()
    }

    /// Wait for the connection manager to finish after shutdown was signalled
    pub async fn join(mut self) {
        self.server.stop();
        let _ = self.manager.await;
    }
}
