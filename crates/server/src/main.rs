//! Headless dedicated server.
//!
//! Hosts the protocol core with a minimal world: player avatars plus
//! whatever the map script would add. Renderer-less by construction; run a
//! client against it to exercise the full connect/frame/prediction path.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use arclight_net::protocol::{CS_MAP, CS_SERVER_NAME, PORT_SERVER};
use arclight_net::{NetConfig, UdpTransport};
use arclight_server::Server;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Milliseconds per server tick (10 Hz, the classic rate).
const TICK_MS: u64 = 100;

#[derive(Parser, Debug)]
#[command(name = "arclight-server", about = "Arclight dedicated server")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value_t = default_listen())]
    listen: SocketAddr,

    /// Map path announced to clients.
    #[arg(long, default_value = "maps/demo1")]
    map: String,

    /// Optional TOML file with protocol tuning values.
    #[arg(long)]
    net_config: Option<PathBuf>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], PORT_SERVER))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = args
        .net_config
        .as_deref()
        .map(NetConfig::load_from_path)
        .unwrap_or_default();

    let transport = UdpTransport::bind(args.listen)?;
    let mut server = Server::new(transport, config);
    server.set_config_string(CS_SERVER_NAME, "arclight dedicated")?;
    server.set_config_string(CS_MAP, &args.map)?;

    info!(listen = %args.listen, map = %args.map, "server up");

    let start = Instant::now();
    let mut next_tick = Duration::ZERO;
    loop {
        let now = start.elapsed();
        if now < next_tick {
            std::thread::sleep(next_tick - now);
        }
        next_tick += Duration::from_millis(TICK_MS);
        server.tick(start.elapsed().as_millis() as u64);
    }
}
