//! Rendezvous server binary.
//!
//! Usage:
//! ```bash
//! terracotta-rendezvous --bind 0.0.0.0:13448 --relay-bind 0.0.0.0:13449
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use terracotta_core::signaling::{RendezvousServer, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "terracotta-rendezvous")]
#[command(about = "Room rendezvous and relay server for terracotta peers")]
#[command(version)]
struct Args {
    /// TCP address for room signaling
    #[arg(short, long, default_value = "0.0.0.0:13448")]
    bind: SocketAddr,

    /// UDP address for the frame relay
    #[arg(short, long, default_value = "0.0.0.0:13449")]
    relay_bind: SocketAddr,

    /// Rooms older than this many hours are expired
    #[arg(long, default_value_t = 24)]
    room_ttl_hours: u64,

    /// Minutes a closed room's code answers "expired" instead of "not found"
    #[arg(long, default_value_t = 60)]
    tombstone_ttl_minutes: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let config = ServerConfig {
        room_ttl: Duration::from_secs(args.room_ttl_hours * 60 * 60),
        tombstone_ttl: Duration::from_secs(args.tombstone_ttl_minutes * 60),
    };

    log::info!(
        "Starting rendezvous server on {} (relay {})",
        args.bind,
        args.relay_bind
    );

    RendezvousServer::bind(args.bind, args.relay_bind, config)
        .await?
        .run()
        .await
}
