use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use holdfast::{server, HoldfastError, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "holdfastd", about = "Stream-bound lock and slot keeper server")]
struct Args {
    /// Serve the named lock service.
    #[arg(long)]
    lock: bool,

    /// Serve the slot keeper service.
    #[arg(long)]
    slotkeeper: bool,

    /// Serve everything.
    #[arg(long)]
    all: bool,

    /// Listen address.
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    #[arg(long, default_value_t = 47002)]
    port: u16,

    /// Seconds without a client heartbeat before a holder is released.
    #[arg(long, default_value_t = 10)]
    heartbeat_timeout: u64,

    /// Seconds between stats lines; 0 disables them.
    #[arg(long, default_value_t = 60)]
    stats_interval: u64,

    /// Log filter, e.g. `info` or `holdfast=debug`.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), HoldfastError> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ServerConfig {
        addr: SocketAddr::new(args.host, args.port),
        enable_lock: args.all || args.lock,
        enable_slotkeeper: args.all || args.slotkeeper,
        heartbeat_timeout_ms: Some(args.heartbeat_timeout.saturating_mul(1000)),
        sync_queue_depth: None,
    };

    let handle = server::spawn(config).await?;

    if args.stats_interval == 0 {
        tokio::signal::ctrl_c().await?;
    } else {
        let mut ticker = tokio::time::interval(Duration::from_secs(args.stats_interval));
        ticker.tick().await; // Skip first immediate tick
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = ticker.tick() => {
                    if let Some(stats) = handle.lock_stats() {
                        info!("lock: {stats}");
                    }
                    if let Some(stats) = handle.slot_stats() {
                        info!("slotkeeper: {stats}");
                    }
                }
            }
        }
    }

    info!("shutting down");
    handle.shutdown().await
}
