//! Connection manager task
//!
//! Owns the `ConnectionRegistry` and the per-connection tasks. The tunnel
//! server and the peer connectors hand it established streams; it registers
//! them, runs them, and removes them when they end.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::connection::{run_connection, CloseReason, ConnectionLimits, ConnectionOutcome};
use crate::registry::{ConnectionId, ConnectionRegistry, Direction, RegistryView};
use crate::transport::BoxedStream;
use crate::{EnvelopeHandler, NetworkError, Result};

const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Returned to a connector when its connection ends
pub(crate) struct ConnectionClosed {
    pub reason: CloseReason,
    pub queue: Option<mpsc::Receiver<Bytes>>,
}

/// An authenticated stream ready to carry envelopes
pub(crate) struct NewConnection {
    pub peer: SocketAddr,
    pub direction: Direction,
    pub stream: BoxedStream,
    pub queue_tx: mpsc::Sender<Bytes>,
    pub queue_rx: mpsc::Receiver<Bytes>,
    /// Outbound connections get their queue back through this
    pub on_close: Option<oneshot::Sender<ConnectionClosed>>,
}

/// Cloneable way into the manager
#[derive(Clone)]
pub(crate) struct ManagerHandle {
    events: mpsc::Sender<NewConnection>,
    registry: RegistryView,
}

impl ManagerHandle {
    pub async fn register(&self, connection: NewConnection) -> Result<()> {
        self.events
            .send(connection)
            .await
            .map_err(|_| NetworkError::ManagerClosed)
    }

    pub fn registry(&self) -> &RegistryView {
        &self.registry
    }
}

pub(crate) struct TunnelManager {
    registry: ConnectionRegistry,
    events: mpsc::Receiver<NewConnection>,
    tasks: JoinSet<ConnectionOutcome>,
    pending_close: Vec<(ConnectionId, oneshot::Sender<ConnectionClosed>)>,
    handler: Arc<dyn EnvelopeHandler>,
    limits: ConnectionLimits,
    shutdown: watch::Receiver<bool>,
}

impl TunnelManager {
    pub fn new(
        handler: Arc<dyn EnvelopeHandler>,
        limits: ConnectionLimits,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, ManagerHandle) {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = mpsc::channel(64);
        let handle = ManagerHandle {
            events: tx,
            registry: registry.view(),
        };
        let manager = Self {
            registry,
            events: rx,
            tasks: JoinSet::new(),
            pending_close: Vec::new(),
            handler,
            limits,
            shutdown,
        };
        (manager, handle)
    }

    pub async fn run(mut self) {
        let mut status = tokio::time::interval(STATUS_INTERVAL);
        status.tick().await;
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(connection) => self.start(connection),
                    None => break,
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => match joined {
                    Ok(outcome) => self.finish(outcome),
                    Err(e) => error!("Connection task failed: {}", e),
                },
                _ = status.tick() => self.log_status(),
                _ = crate::shutdown_requested(&mut shutdown) => break,
            }
        }

        // connections observe the same shutdown signal and wind down on their own
        while let Some(joined) = self.tasks.join_next().await {
            if let Ok(outcome) = joined {
                self.finish(outcome);
            }
        }
        info!("Tunnel connection manager stopped");
    }

    fn start(&mut self, connection: NewConnection) {
        let NewConnection {
            peer,
            direction,
            stream,
            queue_tx,
            queue_rx,
            on_close,
        } = connection;

        let handle = self.registry.insert(peer, direction, queue_tx);
        info!(
            "{} {} {} ({} active)",
            handle.id,
            match direction {
                Direction::Inbound => "accepted from",
                Direction::Outbound => "connected to",
            },
            peer,
            self.registry.len()
        );

        if let Some(on_close) = on_close {
            self.pending_close.push((handle.id, on_close));
        }

        self.tasks.spawn(run_connection(
            handle.id,
            peer,
            stream,
            queue_rx,
            self.handler.clone(),
            self.limits,
            self.shutdown.clone(),
        ));
    }

    fn finish(&mut self, outcome: ConnectionOutcome) {
        self.registry.remove(outcome.id);
        info!(
            "{} to {} closed: {} ({} active)",
            outcome.id,
            outcome.peer,
            outcome.reason,
            self.registry.len()
        );

        if let Some(pos) = self.pending_close.iter().position(|(id, _)| *id == outcome.id) {
            let (_, on_close) = self.pending_close.swap_remove(pos);
            let _ = on_close.send(ConnectionClosed {
                reason: outcome.reason,
                queue: outcome.queue,
            });
        }
    }

    fn log_status(&self) {
        let view = self.registry.view();
        if view.is_empty() {
            return;
        }
        for info in view.snapshot() {
            debug!(
                id = %info.id,
                peer = %info.peer,
                direction = ?info.direction,
                age_secs = info.age.as_secs(),
                queued = info.queued,
                "tunnel connection"
            );
        }
    }
}
