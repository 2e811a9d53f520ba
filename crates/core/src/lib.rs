//! udptunnel core types
//!
//! Pure wire formats shared by every relay component: the local frame that
//! applications hand to the ingress port, and the envelope carried between
//! relays over the tunnel. Nothing in this crate performs I/O.

pub mod envelope;
mod error;
pub mod local;
pub mod profiling;
mod types;

pub use envelope::Envelope;
pub use error::*;
pub use local::{check_destination_port, LocalFrame, LOCAL_HEADER_LEN};
pub use types::*;
