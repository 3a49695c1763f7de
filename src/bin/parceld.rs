//! Entry point for the parcel daemon.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use parcel::daemon::{
    Daemon, DaemonConfig, DEFAULT_BACKLOG, DEFAULT_MAX_CONNECTIONS, DEFAULT_PORT,
};

#[derive(Parser, Debug)]
#[command(name = "parceld", version, about = "parcel relay daemon")]
struct Cli {
    /// Port to listen on
    #[arg(
        short = 'p',
        long = "port",
        default_value_t = DEFAULT_PORT,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    port: u16,

    /// Limit on the pending-connection queue (listen backlog)
    #[arg(short = 'q', long = "queue", default_value_t = DEFAULT_BACKLOG)]
    queue: u32,

    /// Limit on active connections, counting the listener's slot
    #[arg(short = 'm', long = "max-connections", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut daemon = Daemon::bind(DaemonConfig {
        port: cli.port,
        backlog: cli.queue,
        max_connections: cli.max_connections,
    })
    .await?;

    println!("\x1b[32;1m===  parceld {}  ===\x1b[0m", env!("CARGO_PKG_VERSION"));
    println!("\x1b[1mMaximum active connections:\x1b[0m\n=> {}", daemon.max_peers());
    println!("\x1b[1mListening on:\x1b[0m\n=> {}", daemon.local_addr()?);
    println!("\x1b[1mDaemon started...\x1b[0m");

    daemon.run().await
}
