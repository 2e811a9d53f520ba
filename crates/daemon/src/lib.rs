//! udptunnel daemon
//!
//! Wires the relay together from settings and runs it.
//!
//! ## Components
//!
//! - **LocalIngress**: local frames from applications on this host
//! - **TunnelNode**: TLS connections to and from peer relays
//! - **Dispatcher**: final-hop datagram emission
//! - **StaticPolicy**: admission and spoofing decisions

mod service;

pub use service::{RelayService, RunningRelay};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Settings error: {0}")]
    Settings(#[from] udptunnel_settings::SettingsError),

    #[error("Keystore error: {0}")]
    Keystore(#[from] udptunnel_keystore::KeystoreError),

    #[error("Network error: {0}")]
    Network(#[from] udptunnel_network::NetworkError),

    #[error("Ingress error: {0}")]
    Ingress(#[from] udptunnel_ingress::IngressError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] udptunnel_dispatch::DispatchError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
