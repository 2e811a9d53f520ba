//! UDP socket loop feeding `LocalIngress`

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::ingress::LocalIngress;
use crate::Result;

/// Largest datagram accepted on the ingress port
pub const RECV_BUFFER_LEN: usize = 65_535;

/// Ingress socket
pub struct IngressListener {
    listen_addr: SocketAddr,
    handle: Option<JoinHandle<()>>,
}

impl IngressListener {
    /// Bind the ingress socket and start receiving in a background task
    pub async fn start(ingress: Arc<LocalIngress>, mut shutdown: watch::Receiver<bool>) -> Result<Self> {
        let socket = UdpSocket::bind(ingress.config().listen_addr).await?;
        let actual_addr = socket.local_addr()?;
        info!("Local ingress listening on {}", actual_addr);

        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_LEN];
            loop {
                let received = tokio::select! {
                    received = socket.recv_from(&mut buf) => received,
                    _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                };
                match received {
                    Ok((len, source)) => {
                        ingress.process_datagram(source, &buf[..len]).await;
                    }
                    Err(e) => {
                        // ICMP errors from earlier sends surface here on some platforms
                        error!("Ingress receive error: {}", e);
                    }
                }
            }
            info!("Local ingress stopped");
        });

        Ok(Self {
            listen_addr: actual_addr,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }
}

impl Drop for IngressListener {
    fn drop(&mut self) {
        self.stop();
    }
}
