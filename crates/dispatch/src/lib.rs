//! udptunnel dispatch
//!
//! Final hop of the relay. Envelopes read off tunnel connections are decoded
//! and re-emitted as UDP datagrams towards their destination, either from
//! this relay's address or, when policy permits and a raw socket is
//! available, from the original sender's address.

mod dispatcher;
pub mod raw;
mod sender;

pub use dispatcher::{DispatchOutcome, DispatchStats, Dispatcher};
pub use raw::{build_ipv4_udp_packet, RawSocket};
pub use sender::{DatagramSender, UdpSender};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Raw socket unavailable")]
    RawSocketUnavailable,

    #[error("Payload of {0} bytes does not fit one IPv4 packet")]
    PayloadTooLarge(usize),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
