//! Relay TLS identity
//!
//! Every relay is handed a certificate/key pair and a CA certificate by the
//! external certificate tool. The same identity is used both ways: presented
//! as the server certificate to inbound peers and as the client certificate
//! when dialing out. Peers are always required to authenticate.

use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tracing::{debug, warn};

use crate::{KeystoreError, Result};

/// Certificate chain, private key and trust roots of one relay
pub struct TlsIdentity {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    roots: Arc<RootCertStore>,
}

impl TlsIdentity {
    /// Load the identity from PEM files on disk
    pub fn load(cert_path: &Path, key_path: &Path, ca_cert_path: &Path) -> Result<Self> {
        let cert_pem = read_file(cert_path)?;
        let key_pem = read_file(key_path)?;
        let ca_pem = read_file(ca_cert_path)?;
        debug!(
            "Loading TLS identity from {:?}, key {:?}, CA {:?}",
            cert_path, key_path, ca_cert_path
        );
        Self::from_pem(&cert_pem, &key_pem, &ca_pem)
    }

    /// Build the identity from in-memory PEM data
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8], ca_pem: &[u8]) -> Result<Self> {
        let certs = parse_certs(cert_pem)?;
        if certs.is_empty() {
            return Err(KeystoreError::NoCertificates);
        }

        let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem))
            .map_err(|e| KeystoreError::InvalidPem(e.to_string()))?
            .ok_or(KeystoreError::NoPrivateKey)?;

        let ca_certs = parse_certs(ca_pem)?;
        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(ca_certs);
        if ignored > 0 {
            warn!("Ignored {} unparsable CA certificates", ignored);
        }
        if added == 0 {
            return Err(KeystoreError::NoTrustRoots);
        }

        Ok(Self {
            certs,
            key,
            roots: Arc::new(roots),
        })
    }

    /// Server side: require and verify a client certificate from every peer
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        let verifier = WebPkiClientVerifier::builder(self.roots.clone())
            .build()
            .map_err(|e| KeystoreError::Verifier(e.to_string()))?;

        let config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.certs.clone(), self.key.clone_key())?;
        Ok(Arc::new(config))
    }

    /// Client side: trust only the configured CA and present our certificate
    pub fn client_config(&self) -> Result<Arc<ClientConfig>> {
        let config = ClientConfig::builder()
            .with_root_certificates(self.roots.clone())
            .with_client_auth_cert(self.certs.clone(), self.key.clone_key())?;
        Ok(Arc::new(config))
    }

    pub fn chain_len(&self) -> usize {
        self.certs.len()
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|source| KeystoreError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut BufReader::new(pem))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| KeystoreError::InvalidPem(e.to_string()))
}
