//! Standalone bwprobe measurement endpoint: binds one TCP+UDP port and
//! serves probe sessions until killed.

use bwprobe::server::{ProbeServer, ServerConfig};
use clap::Parser;
use std::net::SocketAddr;
use tokio::net::{TcpListener, UdpSocket};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bwprobe-server", about = "bwprobe bandwidth/quality probe endpoint")]
struct Args {
    /// Address to listen on for both the TCP control/data port and the UDP port.
    #[arg(long, default_value = "0.0.0.0:7575")]
    listen: SocketAddr,

    /// Idle session expiry, in seconds.
    #[arg(long, default_value_t = 60)]
    session_expiry_secs: u64,

    /// Janitor sweep interval, in seconds.
    #[arg(long, default_value_t = 30)]
    janitor_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let mut config = ServerConfig::default();
    config.session_expiry = std::time::Duration::from_secs(args.session_expiry_secs);
    config.janitor_interval = std::time::Duration::from_secs(args.janitor_interval_secs);

    let tcp_listener = TcpListener::bind(args.listen).await?;
    let udp_socket = UdpSocket::bind(args.listen).await?;
    tracing::info!(addr = %args.listen, "bwprobe-server listening");

    let server = ProbeServer::new(config);
    server.run(tcp_listener, udp_socket).await?;
    Ok(())
}
