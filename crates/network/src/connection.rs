//! One tunnel connection: a reader and a writer over a split stream
//!
//! The reader hands each decoded envelope to the `EnvelopeHandler`; the
//! writer drains the connection's queue in submission order. The connection
//! ends when either side fails, the peer closes, nothing has been read from
//! the peer for the idle timeout, or shutdown is signalled. Writes never
//! keep a silent peer alive.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::codec::TunnelCodec;
use crate::registry::ConnectionId;
use crate::transport::BoxedStream;
use crate::{EnvelopeHandler, NetworkError};

/// Why a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    IdleTimeout,
    PeerClosed,
    WriteTimeout,
    Io(String),
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
            CloseReason::PeerClosed => write!(f, "closed by peer"),
            CloseReason::WriteTimeout => write!(f, "write timeout"),
            CloseReason::Io(e) => write!(f, "connection lost: {}", e),
            CloseReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ConnectionLimits {
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
}

/// What a finished connection hands back to the manager
pub(crate) struct ConnectionOutcome {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub reason: CloseReason,
    /// `None` only if the writer task panicked
    pub queue: Option<mpsc::Receiver<Bytes>>,
}

pub(crate) async fn run_connection(
    id: ConnectionId,
    peer: SocketAddr,
    stream: BoxedStream,
    queue: mpsc::Receiver<Bytes>,
    handler: Arc<dyn EnvelopeHandler>,
    limits: ConnectionLimits,
    mut shutdown: watch::Receiver<bool>,
) -> ConnectionOutcome {
    let (read_half, write_half) = tokio::io::split(stream);

    let (stop_tx, stop_rx) = oneshot::channel();
    let mut writer = tokio::spawn(write_loop(
        peer,
        FramedWrite::new(write_half, TunnelCodec),
        queue,
        stop_rx,
        limits.write_timeout,
    ));

    let mut frames = FramedRead::new(read_half, TunnelCodec);
    let reason = tokio::select! {
        reason = read_loop(peer, &mut frames, handler.as_ref(), limits.idle_timeout) => reason,
        result = &mut writer => {
            let (queue, reason) = match result {
                Ok((queue, reason)) => (Some(queue), reason),
                Err(e) => (None, CloseReason::Io(format!("writer task failed: {}", e))),
            };
            debug!("{} to {} closed by writer: {}", id, peer, reason);
            return ConnectionOutcome { id, peer, reason, queue };
        }
        _ = crate::shutdown_requested(&mut shutdown) => CloseReason::Shutdown,
    };

    let _ = stop_tx.send(());
    let queue = match writer.await {
        Ok((queue, _)) => Some(queue),
        Err(e) => {
            warn!("{} writer task failed: {}", id, e);
            None
        }
    };

    debug!("{} to {} closed: {}", id, peer, reason);
    ConnectionOutcome {
        id,
        peer,
        reason,
        queue,
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    peer: SocketAddr,
    frames: &mut FramedRead<R, TunnelCodec>,
    handler: &dyn EnvelopeHandler,
    idle_timeout: Duration,
) -> CloseReason {
    let mut last_read = Instant::now();
    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(frame)) => {
                    last_read = Instant::now();
                    handler.handle_envelope(peer, frame.freeze()).await;
                }
                Some(Err(NetworkError::Io(e))) => return CloseReason::Io(e.to_string()),
                Some(Err(e)) => {
                    warn!("Framing error from {}: {}", peer, e);
                    return CloseReason::Io(e.to_string());
                }
                None => return CloseReason::PeerClosed,
            },
            _ = tokio::time::sleep_until(last_read + idle_timeout) => return CloseReason::IdleTimeout,
        }
    }
}

async fn write_loop(
    peer: SocketAddr,
    mut sink: FramedWrite<WriteHalf<BoxedStream>, TunnelCodec>,
    mut queue: mpsc::Receiver<Bytes>,
    mut stop: oneshot::Receiver<()>,
    write_timeout: Duration,
) -> (mpsc::Receiver<Bytes>, CloseReason) {
    let reason = loop {
        let envelope = tokio::select! {
            biased;
            _ = &mut stop => break CloseReason::Shutdown,
            envelope = queue.recv() => match envelope {
                Some(envelope) => envelope,
                None => break CloseReason::Shutdown,
            },
        };

        match tokio::time::timeout(write_timeout, sink.send(envelope)).await {
            Ok(Ok(())) => {}
            Ok(Err(NetworkError::FrameTooLarge(len))) => {
                warn!("Dropping {} byte envelope for {}: too large", len, peer);
            }
            Ok(Err(e)) => break CloseReason::Io(e.to_string()),
            Err(_) => {
                warn!("Write to {} timed out after {:?}", peer, write_timeout);
                break CloseReason::WriteTimeout;
            }
        }
    };

    let _ = tokio::time::timeout(write_timeout, sink.close()).await;
    (queue, reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Collect(mpsc::UnboundedSender<(SocketAddr, Bytes)>);

    #[async_trait]
    impl EnvelopeHandler for Collect {
        async fn handle_envelope(&self, peer: SocketAddr, envelope: Bytes) {
            let _ = self.0.send((peer, envelope));
        }
    }

    fn limits(idle_ms: u64) -> ConnectionLimits {
        ConnectionLimits {
            idle_timeout: Duration::from_millis(idle_ms),
            write_timeout: Duration::from_secs(1),
        }
    }

    fn peer() -> SocketAddr {
        "10.0.0.1:55554".parse().unwrap()
    }

    #[tokio::test]
    async fn test_reads_frames_and_writes_queue() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let (queue_tx, queue_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run_connection(
            ConnectionId(1),
            peer(),
            Box::new(local),
            queue_rx,
            Arc::new(Collect(seen_tx)),
            limits(5_000),
            shutdown_rx,
        ));

        remote.write_all(&[0, 3, 1, 2, 3]).await.unwrap();
        let (from, envelope) = seen_rx.recv().await.unwrap();
        assert_eq!(from, peer());
        assert_eq!(&envelope[..], &[1, 2, 3]);

        queue_tx.send(Bytes::from_static(&[9, 8])).await.unwrap();
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0, 2, 9, 8]);

        drop(remote);
        let outcome = task.await.unwrap();
        assert_eq!(outcome.reason, CloseReason::PeerClosed);
        assert!(outcome.queue.is_some());
    }

    #[tokio::test]
    async fn test_idle_timeout_closes() {
        let (local, _remote) = tokio::io::duplex(64);
        let (seen_tx, _seen_rx) = mpsc::unbounded_channel();
        let (_queue_tx, queue_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let outcome = run_connection(
            ConnectionId(2),
            peer(),
            Box::new(local),
            queue_rx,
            Arc::new(Collect(seen_tx)),
            limits(50),
            shutdown_rx,
        )
        .await;
        assert_eq!(outcome.reason, CloseReason::IdleTimeout);
    }

    #[tokio::test]
    async fn test_outbound_traffic_does_not_keep_silent_peer_alive() {
        let (local, _remote) = tokio::io::duplex(64 * 1024);
        let (seen_tx, _seen_rx) = mpsc::unbounded_channel();
        let (queue_tx, queue_rx) = mpsc::channel(64);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut task = tokio::spawn(run_connection(
            ConnectionId(5),
            peer(),
            Box::new(local),
            queue_rx,
            Arc::new(Collect(seen_tx)),
            limits(200),
            shutdown_rx,
        ));

        let started = Instant::now();
        let outcome = loop {
            tokio::select! {
                outcome = &mut task => break outcome.unwrap(),
                _ = tokio::time::sleep(Duration::from_millis(50)) => {
                    assert!(started.elapsed() < Duration::from_secs(1), "silent peer never timed out");
                    let _ = queue_tx.try_send(Bytes::from_static(&[1, 2, 3]));
                }
            }
        };
        assert_eq!(outcome.reason, CloseReason::IdleTimeout);
    }

    #[tokio::test]
    async fn test_stalled_write_times_out() {
        // nobody drains the remote end, so the 16 byte pipe fills
        let (local, _remote) = tokio::io::duplex(16);
        let (seen_tx, _seen_rx) = mpsc::unbounded_channel();
        let (queue_tx, queue_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        queue_tx.send(Bytes::from(vec![0xAB; 1024])).await.unwrap();
        let outcome = run_connection(
            ConnectionId(6),
            peer(),
            Box::new(local),
            queue_rx,
            Arc::new(Collect(seen_tx)),
            ConnectionLimits {
                idle_timeout: Duration::from_secs(5),
                write_timeout: Duration::from_millis(100),
            },
            shutdown_rx,
        )
        .await;
        assert_eq!(outcome.reason, CloseReason::WriteTimeout);
        assert!(outcome.queue.is_some());
    }

    #[tokio::test]
    async fn test_zero_length_frame_tears_down() {
        let (local, mut remote) = tokio::io::duplex(64);
        let (seen_tx, _seen_rx) = mpsc::unbounded_channel();
        let (_queue_tx, queue_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        remote.write_all(&[0, 0]).await.unwrap();
        let outcome = run_connection(
            ConnectionId(3),
            peer(),
            Box::new(local),
            queue_rx,
            Arc::new(Collect(seen_tx)),
            limits(5_000),
            shutdown_rx,
        )
        .await;
        assert!(matches!(outcome.reason, CloseReason::Io(_)));
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let (local, _remote) = tokio::io::duplex(64);
        let (seen_tx, _seen_rx) = mpsc::unbounded_channel();
        let (_queue_tx, queue_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run_connection(
            ConnectionId(4),
            peer(),
            Box::new(local),
            queue_rx,
            Arc::new(Collect(seen_tx)),
            limits(5_000),
            shutdown_rx,
        ));
        shutdown_tx.send(true).unwrap();
        assert_eq!(task.await.unwrap().reason, CloseReason::Shutdown);
    }
}
