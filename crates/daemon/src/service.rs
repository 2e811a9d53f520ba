//! Relay service

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use udptunnel_core::ProtocolVersion;
use udptunnel_dispatch::{DatagramSender, Dispatcher, DispatchStats, UdpSender};
use udptunnel_gate::{AdmissionGate, StaticPolicy};
use udptunnel_ingress::{IngressConfig, IngressListener, LocalIngress, PeerTable};
use udptunnel_keystore::{expand_path, TlsIdentity};
use udptunnel_network::{Handshake, TlsHandshake, TunnelClient, TunnelConfig, TunnelNode};
use udptunnel_settings::Settings;

use crate::Result;

/// A configured, not yet running relay
pub struct RelayService {
    settings: Settings,
    gate: Arc<dyn AdmissionGate>,
    handshake: Arc<dyn Handshake>,
}

impl RelayService {
    /// Validate settings and load the TLS identity
    pub fn new(settings: Settings) -> Result<Self> {
        settings.validate()?;
        let tls = &settings.tls;
        let identity = TlsIdentity::load(
            &expand_path(&tls.cert_path),
            &expand_path(&tls.key_path),
            &expand_path(&tls.ca_cert_path),
        )?;
        let handshake = TlsHandshake::new(&identity, settings.tunnel.server_name.as_deref())?;
        Ok(Self::with_handshake(settings, Arc::new(handshake)))
    }

    /// Use a caller-supplied handshake instead of the configured certificates
    pub fn with_handshake(settings: Settings, handshake: Arc<dyn Handshake>) -> Self {
        let gate: Arc<dyn AdmissionGate> = Arc::new(StaticPolicy::from_settings(&settings.policy));
        Self {
            settings,
            gate,
            handshake,
        }
    }

    /// Replace the admission policy built from settings
    pub fn set_gate(&mut self, gate: Arc<dyn AdmissionGate>) {
        self.gate = gate;
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Bind every socket and start all tasks
    pub async fn start(&self) -> Result<RunningRelay> {
        let sender = UdpSender::bind(
            self.settings.dispatch.bind_addr,
            self.settings.dispatch.raw_socket,
        )
        .await?;
        info!("Dispatch socket bound to {}", sender.local_addr());
        self.start_with_sender(Arc::new(sender)).await
    }

    /// Start with a caller-supplied datagram sender
    pub async fn start_with_sender(&self, sender: Arc<dyn DatagramSender>) -> Result<RunningRelay> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatcher = Arc::new(Dispatcher::new(
            self.gate.clone(),
            sender,
            self.settings.profiling.enabled,
        ));

        let tunnel = TunnelNode::start(
            TunnelConfig::from_settings(&self.settings),
            self.handshake.clone(),
            self.gate.clone(),
            dispatcher.clone(),
            shutdown_rx.clone(),
        )
        .await?;

        let ingress = Arc::new(LocalIngress::new(
            IngressConfig::from_settings(&self.settings),
            self.gate.clone(),
            PeerTable::from_settings(&self.settings),
            Arc::new(tunnel.client().clone()),
            dispatcher.clone(),
        ));
        let listener = IngressListener::start(ingress, shutdown_rx).await?;

        info!(
            "Relay running (protocol {}), ingress {}, tunnel {}",
            ProtocolVersion::CURRENT,
            listener.listen_addr(),
            tunnel.listen_addr()
        );

        Ok(RunningRelay {
            tunnel,
            listener,
            dispatcher,
            shutdown_tx,
        })
    }

    /// Run until Ctrl-C
    pub async fn run(&self) -> Result<()> {
        let relay = self.start().await?;
        tokio::signal::ctrl_c().await?;
        info!("Received shutdown signal");
        relay.shutdown().await;
        Ok(())
    }
}

/// Handles to a started relay
pub struct RunningRelay {
    tunnel: TunnelNode,
    listener: IngressListener,
    dispatcher: Arc<Dispatcher>,
    shutdown_tx: watch::Sender<bool>,
}

impl RunningRelay {
    pub fn ingress_addr(&self) -> SocketAddr {
        self.listener.listen_addr()
    }

    pub fn tunnel_addr(&self) -> SocketAddr {
        self.tunnel.listen_addr()
    }

    pub fn client(&self) -> &TunnelClient {
        self.tunnel.client()
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    /// Signal every task to stop and wait for connections to close
    pub async fn shutdown(self) {
        let RunningRelay {
            tunnel,
            mut listener,
            shutdown_tx,
            ..
        } = self;
        let _ = shutdown_tx.send(true);
        listener.stop();
        tunnel.join().await;
        info!("Relay stopped");
    }
}
