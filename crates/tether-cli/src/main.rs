use std::net::IpAddr;

use anyhow::Result;
use clap::Parser;
use tether_forward::{DeviceForwarder, DeviceForwarderConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Device-side reverse port forwarder.
///
/// Listens on the command port for the host's command connection, then makes
/// every listed device-local port reachable from the host. Runs until the
/// command connection is lost.
#[derive(Parser)]
#[command(name = "tether-device", version)]
struct Cli {
    /// Port the host's command connection arrives on
    command_port: u16,
    /// Device-local ports to forward
    #[arg(required = true)]
    ports: Vec<u16>,
    /// Address to bind the listeners on
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = DeviceForwarderConfig::new(cli.command_port, cli.ports);
    config.bind_addr = cli.bind;

    let forwarder = DeviceForwarder::bind(config).await?;
    info!(command = %forwarder.command_addr(), "forwarder ready");
    forwarder.run().await?;
    Ok(())
}
