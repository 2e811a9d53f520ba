//! Tunnel server: accepts peer relay connections

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use udptunnel_gate::AdmissionGate;

use crate::manager::{ManagerHandle, NewConnection};
use crate::registry::Direction;
use crate::transport::Handshake;
use crate::{NetworkError, Result};

/// Tunnel listener
pub struct TunnelServer {
    listen_addr: SocketAddr,
    handle: Option<JoinHandle<()>>,
}

pub(crate) struct Acceptor {
    pub handshake: Arc<dyn Handshake>,
    pub gate: Arc<dyn AdmissionGate>,
    pub manager: ManagerHandle,
    pub handshake_timeout: Duration,
    pub queue_depth: usize,
}

impl TunnelServer {
    /// Bind the listener and start accepting in a background task
    pub(crate) async fn start(
        listen_addr: SocketAddr,
        acceptor: Acceptor,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr).await?;
        let actual_addr = listener.local_addr()?;
        info!("Tunnel server listening on {}", actual_addr);

        let acceptor = Arc::new(acceptor);
        let handle = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted,
                    _ = crate::shutdown_requested(&mut shutdown) => break,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        if !acceptor.gate.is_source_allowed(peer.ip()) {
                            debug!("Refusing tunnel connection from {}: {}", peer, NetworkError::SourceDenied(peer.ip()));
                            continue;
                        }
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            if let Err(e) = acceptor.accept(stream, peer).await {
                                warn!("Tunnel connection from {} rejected: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Tunnel accept error: {}", e);
                    }
                }
            }
            info!("Tunnel server stopped");
        });

        Ok(Self {
            listen_addr: actual_addr,
            handle: Some(handle),
        })
    }

    /// Stop accepting; established connections are unaffected
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }
}

impl Drop for TunnelServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Acceptor {
    async fn accept(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        stream.set_nodelay(true)?;
        let stream = tokio::time::timeout(self.handshake_timeout, self.handshake.accept(stream, peer))
            .await
            .map_err(|_| NetworkError::Handshake {
                peer,
                reason: format!("no handshake within {:?}", self.handshake_timeout),
            })??;

        let (queue_tx, queue_rx) = mpsc::channel(self.queue_depth);
        self.manager
            .register(NewConnection {
                peer,
                direction: Direction::Inbound,
                stream,
                queue_tx,
                queue_rx,
                on_close: None,
            })
            .await
    }
}
