//! Final-hop datagram emission

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{info, warn};

use crate::raw::RawSocket;
use crate::{DispatchError, Result};

/// Puts reconstructed datagrams on the wire
#[async_trait]
pub trait DatagramSender: Send + Sync {
    /// Send from this relay's own address
    async fn send_from_self(&self, destination: SocketAddrV4, payload: &[u8]) -> Result<()>;

    /// Send with `source` as the IPv4 source address
    async fn send_spoofed(
        &self,
        source: Ipv4Addr,
        destination: SocketAddrV4,
        payload: &[u8],
    ) -> Result<()>;
}

/// UDP socket plus an optional raw socket for source rewriting
pub struct UdpSender {
    socket: UdpSocket,
    raw: Option<RawSocket>,
    local_addr: SocketAddr,
}

impl UdpSender {
    /// Bind the ordinary socket; try the raw socket if `raw_socket` is set
    pub async fn bind(addr: SocketAddr, raw_socket: bool) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;

        let raw = if raw_socket {
            match RawSocket::open() {
                Ok(raw) => {
                    info!("Raw socket open; original senders will be reproduced");
                    Some(raw)
                }
                Err(e) => {
                    warn!(
                        "Raw socket unavailable ({}); datagrams will be sent from {}",
                        e, local_addr
                    );
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            socket,
            raw,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn can_spoof(&self) -> bool {
        self.raw.is_some()
    }
}

#[async_trait]
impl DatagramSender for UdpSender {
    async fn send_from_self(&self, destination: SocketAddrV4, payload: &[u8]) -> Result<()> {
        self.socket
            .send_to(payload, SocketAddr::V4(destination))
            .await?;
        Ok(())
    }

    async fn send_spoofed(
        &self,
        source: Ipv4Addr,
        destination: SocketAddrV4,
        payload: &[u8],
    ) -> Result<()> {
        let raw = self.raw.as_ref().ok_or(DispatchError::RawSocketUnavailable)?;
        // source port is always our own socket's
        let source = SocketAddrV4::new(source, self.local_addr.port());
        raw.send(source, destination, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_from_self() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let SocketAddr::V4(dest) = receiver.local_addr().unwrap() else {
            panic!("expected IPv4");
        };

        let sender = UdpSender::bind("127.0.0.1:0".parse().unwrap(), false).await.unwrap();
        assert!(!sender.can_spoof());
        sender.send_from_self(dest, &[5, 4, 3, 2, 1]).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[5, 4, 3, 2, 1]);
        assert_eq!(from, sender.local_addr());
    }

    #[tokio::test]
    async fn test_spoof_without_raw_socket() {
        let sender = UdpSender::bind("127.0.0.1:0".parse().unwrap(), false).await.unwrap();
        let result = sender
            .send_spoofed(Ipv4Addr::new(10, 0, 0, 5), "127.0.0.1:9".parse().unwrap(), b"x")
            .await;
        assert!(matches!(result, Err(DispatchError::RawSocketUnavailable)));
    }
}
