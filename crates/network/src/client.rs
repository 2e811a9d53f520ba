//! Tunnel client: peer selection to connection, reconnecting on demand
//!
//! Each remote peer has at most one `PeerConnector` task. The connector
//! walks `Disconnected → Connecting → Connected → Disconnected`, and after
//! a failed dial holds the peer in `Disconnected` for a doubling backoff.
//! Delivery is at-most-once: envelopes queued when a connection drops are
//! discarded, and submissions while the peer is disconnected are refused.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::codec::MAX_FRAME_LEN;
use crate::manager::{ManagerHandle, NewConnection};
use crate::registry::{Direction, RegistryView};
use crate::transport::{dial, Handshake};
use crate::{NetworkError, Result, TunnelConfig};

/// Connector state for one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Disconnected,
    Connecting,
    Connected,
}

struct PeerSlot {
    queue: mpsc::Sender<Bytes>,
    state: watch::Receiver<ConnectorState>,
    backoff: Arc<Mutex<Backoff>>,
}

struct ClientInner {
    config: TunnelConfig,
    handshake: Arc<dyn Handshake>,
    manager: ManagerHandle,
    slots: Mutex<HashMap<SocketAddr, PeerSlot>>,
    persistent: HashSet<SocketAddr>,
    dropped: AtomicU64,
    shutdown: watch::Receiver<bool>,
}

/// Sends envelopes to peer relays
#[derive(Clone)]
pub struct TunnelClient {
    inner: Arc<ClientInner>,
}

impl TunnelClient {
    pub(crate) fn new(
        config: TunnelConfig,
        handshake: Arc<dyn Handshake>,
        manager: ManagerHandle,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let persistent = config.persistent_peers.iter().copied().collect();
        Self {
            inner: Arc::new(ClientInner {
                config,
                handshake,
                manager,
                slots: Mutex::new(HashMap::new()),
                persistent,
                dropped: AtomicU64::new(0),
                shutdown,
            }),
        }
    }

    /// Start connectors for all persistent peers
    pub fn connect_persistent(&self) {
        for peer in &self.inner.config.persistent_peers {
            self.slot(*peer);
        }
    }

    /// Queue an envelope for `peer`
    ///
    /// An existing connection to the peer host, inbound or outbound, is
    /// reused. Otherwise a connector is started and the envelope waits in
    /// its queue while the dial is in progress.
    pub fn submit(&self, peer: SocketAddr, envelope: Bytes) -> Result<()> {
        if envelope.is_empty() {
            return Err(self.dropped(NetworkError::EmptyEnvelope));
        }
        if envelope.len() > MAX_FRAME_LEN {
            return Err(self.dropped(NetworkError::FrameTooLarge(envelope.len())));
        }

        let envelope = match self.inner.manager.registry().lookup_peer(peer.ip()) {
            Some(handle) => match handle.queue.try_send(envelope) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(_)) => return Err(self.dropped(NetworkError::QueueFull(peer))),
                Err(TrySendError::Closed(envelope)) => envelope,
            },
            None => envelope,
        };

        let (queue, state) = self.slot(peer);
        match state {
            ConnectorState::Disconnected => Err(self.dropped(NetworkError::PeerUnavailable(peer))),
            ConnectorState::Connecting | ConnectorState::Connected => match queue.try_send(envelope) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(self.dropped(NetworkError::QueueFull(peer))),
                Err(TrySendError::Closed(_)) => Err(self.dropped(NetworkError::PeerUnavailable(peer))),
            },
        }
    }

    /// Connector state for `peer`, if a connector has ever run for it
    pub fn peer_state(&self, peer: SocketAddr) -> Option<ConnectorState> {
        self.inner
            .slots
            .lock()
            .get(&peer)
            .map(|slot| *slot.state.borrow())
    }

    /// Envelopes refused since start
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn registry(&self) -> &RegistryView {
        self.inner.manager.registry()
    }

    fn dropped(&self, err: NetworkError) -> NetworkError {
        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        err
    }

    /// Queue and current state of the peer's connector, starting one if
    /// none is running.
    fn slot(&self, peer: SocketAddr) -> (mpsc::Sender<Bytes>, ConnectorState) {
        let mut slots = self.inner.slots.lock();

        let backoff = match slots.get(&peer) {
            Some(slot) if !slot.queue.is_closed() => {
                return (slot.queue.clone(), *slot.state.borrow());
            }
            Some(slot) => slot.backoff.clone(),
            None => Arc::new(Mutex::new(Backoff::new(
                self.inner.config.reconnect_initial,
                self.inner.config.reconnect_max,
            ))),
        };

        let (queue_tx, queue_rx) = mpsc::channel(self.inner.config.queue_depth);
        let (state_tx, state_rx) = watch::channel(ConnectorState::Connecting);

        let connector = PeerConnector {
            peer,
            persistent: self.inner.persistent.contains(&peer),
            bind: self.inner.config.bind_address,
            queue_tx: queue_tx.clone(),
            queue: Some(queue_rx),
            state: state_tx,
            backoff: backoff.clone(),
            inner: self.inner.clone(),
        };
        tokio::spawn(connector.run());

        slots.insert(
            peer,
            PeerSlot {
                queue: queue_tx.clone(),
                state: state_rx,
                backoff,
            },
        );
        (queue_tx, ConnectorState::Connecting)
    }
}

struct PeerConnector {
    peer: SocketAddr,
    persistent: bool,
    bind: Option<IpAddr>,
    queue_tx: mpsc::Sender<Bytes>,
    queue: Option<mpsc::Receiver<Bytes>>,
    state: watch::Sender<ConnectorState>,
    backoff: Arc<Mutex<Backoff>>,
    inner: Arc<ClientInner>,
}

impl PeerConnector {
    async fn run(mut self) {
        let mut shutdown = self.inner.shutdown.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.state.send_replace(ConnectorState::Connecting);
            debug!("Connecting to peer {}", self.peer);

            let attempt = tokio::select! {
                result = dial(self.peer, self.bind, &self.inner.handshake, self.inner.config.connect_timeout) => result,
                _ = crate::shutdown_requested(&mut shutdown) => break,
            };

            match attempt {
                Ok(stream) => {
                    self.backoff.lock().reset();
                    let Some(queue_rx) = self.queue.take() else {
                        break;
                    };
                    let (close_tx, close_rx) = oneshot::channel();
                    let registered = self
                        .inner
                        .manager
                        .register(NewConnection {
                            peer: self.peer,
                            direction: Direction::Outbound,
                            stream,
                            queue_tx: self.queue_tx.clone(),
                            queue_rx,
                            on_close: Some(close_tx),
                        })
                        .await;
                    if registered.is_err() {
                        break;
                    }
                    self.state.send_replace(ConnectorState::Connected);

                    let Ok(closed) = close_rx.await else {
                        break;
                    };
                    let Some(queue_rx) = closed.queue else {
                        break;
                    };
                    self.queue = Some(queue_rx);
                    self.discard_queued();
                    self.state.send_replace(ConnectorState::Disconnected);

                    if !self.persistent {
                        debug!("Peer {} dormant until next datagram ({})", self.peer, closed.reason);
                        break;
                    }
                    let delay = self.backoff.lock().next_delay();
                    info!("Reconnecting to {} in {:?} ({})", self.peer, delay, closed.reason);
                    if !self.wait(delay, &mut shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    self.discard_queued();
                    self.state.send_replace(ConnectorState::Disconnected);
                    let delay = self.backoff.lock().next_delay();
                    warn!("Failed to connect to {}: {}; retry in {:?}", self.peer, e, delay);
                    if !self.wait(delay, &mut shutdown).await || !self.persistent {
                        break;
                    }
                }
            }
        }

        self.state.send_replace(ConnectorState::Disconnected);
        debug!("Connector for {} stopped", self.peer);
    }

    /// Sleep through the backoff; false if shutdown arrived first
    async fn wait(&self, delay: std::time::Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = crate::shutdown_requested(shutdown) => false,
        }
    }

    fn discard_queued(&mut self) {
        let Some(queue) = self.queue.as_mut() else {
            return;
        };
        let mut discarded = 0u64;
        while queue.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            self.inner.dropped.fetch_add(discarded, Ordering::Relaxed);
            debug!("Discarded {} queued envelopes for {}", discarded, self.peer);
        }
    }
}
