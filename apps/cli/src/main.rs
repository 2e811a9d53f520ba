//! udptunnel CLI
//!
//! Runs the relay and offers a few helpers for operating it.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::UdpSocket;
use tracing::info;

use udptunnel_core::{LocalFrame, ProtocolVersion, DEFAULT_INGRESS_PORT};
use udptunnel_daemon::RelayService;
use udptunnel_logging::{init_file_logging, init_logging};
use udptunnel_settings::{default_settings_path, Settings};

/// udptunnel - UDP relay over TLS tunnels
#[derive(Parser)]
#[command(name = "udptunnel")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file (defaults to $UDPTUNNEL_CONFIG or /etc/udptunnel/udptunnel.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay until interrupted
    Run,

    /// Validate the settings file and exit
    CheckConfig,

    /// Print the effective settings as JSON
    ShowConfig,

    /// Write a settings file with default values
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Send one datagram through a running relay's ingress port
    Send {
        /// Final destination address
        dest: Ipv4Addr,

        /// Final destination port
        port: u16,

        /// Payload as hex
        payload: String,

        /// Ingress address of the local relay
        #[arg(long, default_value_t = SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_INGRESS_PORT)))]
        relay: SocketAddr,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = cli.config.clone().unwrap_or_else(default_settings_path);

    match cli.command {
        Commands::Run => {
            let settings = load_settings(&path)?;
            let level = cli.verbose.max(settings.logging.level);
            match &settings.logging.file {
                Some(file) => init_file_logging(level, file, settings.logging.max_files)?,
                None => init_logging(level, None)?,
            }
            run_relay(settings).await?;
        }
        Commands::CheckConfig => {
            init_logging(cli.verbose, None)?;
            let settings = load_settings(&path)?;
            settings.validate().context("Settings are invalid")?;
            println!("{}: ok", path.display());
        }
        Commands::ShowConfig => {
            init_logging(cli.verbose, None)?;
            let settings = load_settings(&path)?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        Commands::InitConfig { force } => {
            init_logging(cli.verbose, None)?;
            init_config(&path, force)?;
        }
        Commands::Send {
            dest,
            port,
            payload,
            relay,
        } => {
            init_logging(cli.verbose, None)?;
            send_datagram(relay, SocketAddrV4::new(dest, port), &payload).await?;
        }
        Commands::Version => {
            println!("udptunnel {}", env!("CARGO_PKG_VERSION"));
            println!("protocol {}", ProtocolVersion::CURRENT);
        }
    }

    Ok(())
}

fn load_settings(path: &Path) -> Result<Settings> {
    Settings::load_from(path).with_context(|| format!("Failed to load settings from {}", path.display()))
}

// ============================================================================
// Relay
// ============================================================================

async fn run_relay(settings: Settings) -> Result<()> {
    info!("Starting udptunnel relay...");
    if let Some(path) = settings.config_path() {
        info!("Settings: {:?}", path);
    }

    let service = RelayService::new(settings).context("Failed to configure relay")?;

    info!("Press Ctrl+C to stop");
    service.run().await?;

    Ok(())
}

// ============================================================================
// Settings File
// ============================================================================

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Settings::default().save_to(path)?;
    println!("Wrote default settings to {}", path.display());
    Ok(())
}

// ============================================================================
// Send
// ============================================================================

async fn send_datagram(relay: SocketAddr, destination: SocketAddrV4, payload_hex: &str) -> Result<()> {
    let payload = hex::decode(payload_hex.trim()).context("Payload must be hex")?;
    let frame = LocalFrame::encode(destination, &payload);

    let bind: SocketAddr = if relay.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    let sent = socket.send_to(&frame, relay).await?;

    println!(
        "Sent {} bytes for {} via {} ({} payload bytes)",
        sent,
        destination,
        relay,
        payload.len()
    );
    Ok(())
}
