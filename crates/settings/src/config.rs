//! Configuration types

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::info;

use udptunnel_core::{DEFAULT_INGRESS_PORT, DEFAULT_TUNNEL_PORT};
use udptunnel_keystore::default_config_dir;

use crate::{default_settings_path, Result, SettingsError};

/// Main settings structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Local UDP ingress
    #[serde(default)]
    pub ingress: IngressSettings,

    /// Tunnel listener and peer connections
    #[serde(default)]
    pub tunnel: TunnelSettings,

    /// Final-hop datagram emission
    #[serde(default)]
    pub dispatch: DispatchSettings,

    /// Certificate, key and CA paths
    #[serde(default)]
    pub tls: TlsSettings,

    /// Admission and spoofing policy
    #[serde(default)]
    pub policy: PolicySettings,

    /// Static destination subnet → peer relay routes
    #[serde(default)]
    pub routes: Vec<RouteSettings>,

    /// Network latency profiling
    #[serde(default)]
    pub profiling: ProfilingSettings,

    /// Log output
    #[serde(default)]
    pub logging: LoggingSettings,

    /// Settings file this was loaded from (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

impl Settings {
    /// Load settings from the default path, or create defaults
    pub fn load_or_default() -> Result<Self> {
        Self::load_from(&default_settings_path())
    }

    /// Load settings from a specific path, or create defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path).map_err(SettingsError::ReadError)?;
            let mut settings: Settings =
                serde_json::from_str(&content).map_err(SettingsError::ParseError)?;
            settings.config_path = Some(path.to_path_buf());
            info!("Loaded settings from {:?}", path);
            Ok(settings)
        } else {
            let mut settings = Self::default();
            settings.config_path = Some(path.to_path_buf());
            Ok(settings)
        }
    }

    /// Save settings to the path they were loaded from
    pub fn save(&self) -> Result<()> {
        let path = self.config_path.clone().unwrap_or_else(default_settings_path);
        self.save_to(&path)
    }

    /// Save settings to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(SettingsError::CreateDirError)?;
            }
        }

        let content = serde_json::to_string_pretty(self).map_err(SettingsError::ParseError)?;
        std::fs::write(path, content).map_err(SettingsError::WriteError)?;
        info!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Reject settings the relay cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.tunnel.port == 0 {
            return Err(SettingsError::Invalid("tunnel.port must not be 0".into()));
        }
        // port 0 binds an ephemeral port per socket
        if self.ingress.listen_addr.port() != 0 && self.ingress.listen_addr == self.tunnel.listen_addr {
            return Err(SettingsError::Invalid(format!(
                "ingress and tunnel cannot share {}",
                self.ingress.listen_addr
            )));
        }
        if self.tunnel.reconnect_initial_ms == 0
            || self.tunnel.reconnect_initial_ms > self.tunnel.reconnect_max_ms
        {
            return Err(SettingsError::Invalid(
                "tunnel.reconnect_initial_ms must be in 1..=reconnect_max_ms".into(),
            ));
        }
        if self.tunnel.idle_timeout_ms == 0 || self.tunnel.write_timeout_ms == 0 {
            return Err(SettingsError::Invalid("tunnel timeouts must be non-zero".into()));
        }
        if self.tunnel.queue_depth == 0 {
            return Err(SettingsError::Invalid("tunnel.queue_depth must be non-zero".into()));
        }
        if let Some(route) = self.routes.iter().find(|r| r.peer.port() == 0) {
            return Err(SettingsError::Invalid(format!(
                "route {} has no peer port",
                route.subnet
            )));
        }
        Ok(())
    }
}

/// Local UDP ingress settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressSettings {
    /// Address applications send local frames to
    #[serde(default = "default_ingress_addr")]
    pub listen_addr: SocketAddr,

    /// Identity attached as the original sender when policy allows
    #[serde(default)]
    pub sender_identity: Option<Ipv4Addr>,

    /// Addresses of this host; datagrams for them skip the tunnel
    #[serde(default)]
    pub local_addresses: Vec<IpAddr>,
}

fn default_ingress_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_INGRESS_PORT))
}

impl Default for IngressSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_ingress_addr(),
            sender_identity: None,
            local_addresses: Vec::new(),
        }
    }
}

/// Tunnel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSettings {
    /// Address to accept peer relay connections on
    #[serde(default = "default_tunnel_addr")]
    pub listen_addr: SocketAddr,

    /// Port peer relays listen on when reached through the default route
    #[serde(default = "default_tunnel_port")]
    pub port: u16,

    /// Optional TLS server name to verify instead of the peer IP
    #[serde(default)]
    pub server_name: Option<String>,

    /// TCP connect + TLS handshake timeout
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Tear down a connection after this long without readable bytes
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// Abandon a stalled envelope write after this long
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    /// First reconnect delay after a failed dial
    #[serde(default = "default_reconnect_initial")]
    pub reconnect_initial_ms: u64,

    /// Upper bound for the doubling reconnect delay
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,

    /// Envelopes buffered per connection before new ones are dropped
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Bind outbound connections to the sender identity address
    #[serde(default)]
    pub bind_to_sender: bool,
}

fn default_tunnel_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_TUNNEL_PORT))
}

fn default_tunnel_port() -> u16 {
    DEFAULT_TUNNEL_PORT
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_idle_timeout() -> u64 {
    300_000
}

fn default_write_timeout() -> u64 {
    5_000
}

fn default_reconnect_initial() -> u64 {
    500
}

fn default_reconnect_max() -> u64 {
    10_000
}

fn default_queue_depth() -> usize {
    1024
}

impl TunnelSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_tunnel_addr(),
            port: default_tunnel_port(),
            server_name: None,
            connect_timeout_ms: default_connect_timeout(),
            idle_timeout_ms: default_idle_timeout(),
            write_timeout_ms: default_write_timeout(),
            reconnect_initial_ms: default_reconnect_initial(),
            reconnect_max_ms: default_reconnect_max(),
            queue_depth: default_queue_depth(),
            bind_to_sender: false,
        }
    }
}

/// Final-hop datagram emission settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Local address of the socket used for ordinary sends
    #[serde(default = "default_dispatch_addr")]
    pub bind_addr: SocketAddr,

    /// Open a raw socket for source-address rewriting (needs CAP_NET_RAW)
    #[serde(default = "default_true")]
    pub raw_socket: bool,
}

fn default_dispatch_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

fn default_true() -> bool {
    true
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            bind_addr: default_dispatch_addr(),
            raw_socket: true,
        }
    }
}

/// Certificate paths
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    #[serde(default = "default_cert_path")]
    pub cert_path: PathBuf,

    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,

    #[serde(default = "default_ca_cert_path")]
    pub ca_cert_path: PathBuf,
}

fn default_cert_path() -> PathBuf {
    default_config_dir().join("udptunnel.cert")
}

fn default_key_path() -> PathBuf {
    default_config_dir().join("udptunnel.key")
}

fn default_ca_cert_path() -> PathBuf {
    default_config_dir().join("ca.cert.pem")
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            cert_path: default_cert_path(),
            key_path: default_key_path(),
            ca_cert_path: default_ca_cert_path(),
        }
    }
}

/// Admission policy
///
/// Empty `allowed_sources` admits everyone not explicitly denied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySettings {
    #[serde(default)]
    pub allowed_sources: Vec<IpNet>,

    /// Denials win over allowances
    #[serde(default)]
    pub denied_sources: Vec<IpNet>,

    /// Sender/destination pairs allowed to carry the original sender
    #[serde(default)]
    pub spoofing: Vec<SpoofRule>,

    /// Destination ports closed by the host firewall
    #[serde(default)]
    pub blocked_ports: Vec<u16>,
}

/// One spoofing allowance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoofRule {
    /// Sender addresses this rule covers
    pub senders: IpNet,
    /// Destinations the senders may be impersonated towards
    #[serde(default = "any_destination")]
    pub destinations: Vec<IpNet>,
}

fn any_destination() -> Vec<IpNet> {
    vec![IpNet::V4(ipnet::Ipv4Net::default())]
}

/// Static route to a peer relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSettings {
    pub subnet: IpNet,
    pub peer: SocketAddr,
}

/// Network latency profiling
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfilingSettings {
    /// Append a timestamp to payloads at ingress and dispatch
    #[serde(default)]
    pub enabled: bool,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// 0 = warn, 1 = info, 2+ = debug
    #[serde(default)]
    pub level: u8,

    /// Write logs to this file instead of stderr, rotated daily
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Rotated log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

fn default_max_log_files() -> usize {
    7
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: 0,
            file: None,
            max_files: default_max_log_files(),
        }
    }
}
