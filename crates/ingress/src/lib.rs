//! udptunnel ingress
//!
//! Receives local frames from applications on this host, wraps each one in
//! an envelope and hands it to the tunnel client for the peer relay that
//! serves its destination.

mod ingress;
mod listener;
mod routes;
mod stats;

pub use ingress::{DropReason, EnvelopeSink, IngressConfig, IngressOutcome, LocalIngress};
pub use listener::{IngressListener, RECV_BUFFER_LEN};
pub use routes::PeerTable;
pub use stats::{ForwardStats, LOG_EVERY};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngressError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IngressError>;
