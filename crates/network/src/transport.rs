//! Stream establishment: TCP dial and the handshake layered on top

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use udptunnel_keystore::TlsIdentity;

use crate::{NetworkError, Result};

/// Byte stream a tunnel connection runs over
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> TunnelStream for T {}

pub type BoxedStream = Box<dyn TunnelStream>;

/// Upgrades a raw TCP stream into an authenticated tunnel stream
#[async_trait]
pub trait Handshake: Send + Sync {
    /// Outbound side
    async fn connect(&self, stream: TcpStream, peer: SocketAddr) -> Result<BoxedStream>;

    /// Inbound side
    async fn accept(&self, stream: TcpStream, peer: SocketAddr) -> Result<BoxedStream>;
}

/// Mutual TLS using the relay's identity
pub struct TlsHandshake {
    connector: TlsConnector,
    acceptor: TlsAcceptor,
    server_name: Option<ServerName<'static>>,
}

impl TlsHandshake {
    /// `server_name` overrides the name verified in the peer certificate;
    /// by default the peer IP address is verified.
    pub fn new(identity: &TlsIdentity, server_name: Option<&str>) -> Result<Self> {
        let server_name = server_name
            .map(|name| {
                ServerName::try_from(name.to_string())
                    .map_err(|_| NetworkError::InvalidServerName(name.to_string()))
            })
            .transpose()?;

        Ok(Self {
            connector: TlsConnector::from(identity.client_config()?),
            acceptor: TlsAcceptor::from(identity.server_config()?),
            server_name,
        })
    }
}

#[async_trait]
impl Handshake for TlsHandshake {
    async fn connect(&self, stream: TcpStream, peer: SocketAddr) -> Result<BoxedStream> {
        let name = self
            .server_name
            .clone()
            .unwrap_or_else(|| ServerName::from(peer.ip()));
        let tls = self
            .connector
            .connect(name, stream)
            .await
            .map_err(|e| NetworkError::Handshake {
                peer,
                reason: e.to_string(),
            })?;
        debug!("TLS session established with {}", peer);
        Ok(Box::new(tls))
    }

    async fn accept(&self, stream: TcpStream, peer: SocketAddr) -> Result<BoxedStream> {
        let tls = self
            .acceptor
            .accept(stream)
            .await
            .map_err(|e| NetworkError::Handshake {
                peer,
                reason: e.to_string(),
            })?;
        debug!("TLS session accepted from {}", peer);
        Ok(Box::new(tls))
    }
}

/// No handshake at all; for tests and trusted links
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainHandshake;

#[async_trait]
impl Handshake for PlainHandshake {
    async fn connect(&self, stream: TcpStream, _peer: SocketAddr) -> Result<BoxedStream> {
        Ok(Box::new(stream))
    }

    async fn accept(&self, stream: TcpStream, _peer: SocketAddr) -> Result<BoxedStream> {
        Ok(Box::new(stream))
    }
}

/// Dial `peer`, optionally from a fixed local address, and run the
/// handshake, all under `timeout`.
pub(crate) async fn dial(
    peer: SocketAddr,
    bind: Option<IpAddr>,
    handshake: &Arc<dyn Handshake>,
    timeout: Duration,
) -> Result<BoxedStream> {
    let attempt = async {
        let socket = if peer.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(ip) = bind.filter(|ip| ip.is_ipv4() == peer.is_ipv4()) {
            socket.bind(SocketAddr::new(ip, 0))?;
        }
        let stream = socket.connect(peer).await?;
        stream.set_nodelay(true)?;
        handshake.connect(stream, peer).await
    };

    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| NetworkError::ConnectTimeout(peer))?
}
