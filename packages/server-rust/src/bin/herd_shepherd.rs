//! The shepherd membership coordinator.

use std::net::IpAddr;

use clap::Parser;
use herd_server::cluster::coordinator;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "herd-shepherd", about = "herd membership coordinator")]
struct Args {
    /// Listener address.
    #[arg(short = 'b', long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Listener port.
    #[arg(short = 'p', long, default_value_t = 7000)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let listener = TcpListener::bind((args.bind, args.port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "shepherd listening");
    coordinator::run(listener).await
}
