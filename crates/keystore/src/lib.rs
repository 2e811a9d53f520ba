//! udptunnel keystore
//!
//! Loads the certificate, private key and CA certificate a relay is handed at
//! startup and turns them into rustls client/server configurations.
//!
//! ## Features
//!
//! - PEM certificate chain, PKCS#8 / RSA / SEC1 private keys
//! - Mutual TLS: peers must present a certificate signed by the configured CA
//! - Cross-platform path expansion (~, environment variables)

mod paths;
mod tls;

pub use paths::{default_config_dir, expand_path, CONFIG_DIR_ENV};
pub use tls::TlsIdentity;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("Failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid PEM data: {0}")]
    InvalidPem(String),

    #[error("No certificates found")]
    NoCertificates,

    #[error("No private key found")]
    NoPrivateKey,

    #[error("No usable CA certificates found")]
    NoTrustRoots,

    #[error("Client verifier error: {0}")]
    Verifier(String),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
}

pub type Result<T> = std::result::Result<T, KeystoreError>;
