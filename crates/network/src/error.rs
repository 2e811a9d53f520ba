use std::net::{IpAddr, SocketAddr};

use thiserror::Error;
use udptunnel_keystore::KeystoreError;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Envelope of {0} bytes exceeds the tunnel frame limit")]
    FrameTooLarge(usize),

    #[error("Zero-length tunnel frame")]
    EmptyFrame,

    #[error("Refusing to queue an empty envelope")]
    EmptyEnvelope,

    #[error("Peer {0} is unavailable")]
    PeerUnavailable(SocketAddr),

    #[error("Send queue for {0} is full")]
    QueueFull(SocketAddr),

    #[error("Connecting to {0} timed out")]
    ConnectTimeout(SocketAddr),

    #[error("Handshake with {peer} failed: {reason}")]
    Handshake { peer: SocketAddr, reason: String },

    #[error("Source {0} is not admitted")]
    SourceDenied(IpAddr),

    #[error("Invalid TLS server name: {0}")]
    InvalidServerName(String),

    #[error("Keystore error: {0}")]
    Keystore(#[from] KeystoreError),

    #[error("Connection manager has stopped")]
    ManagerClosed,
}

pub type Result<T> = std::result::Result<T, NetworkError>;
