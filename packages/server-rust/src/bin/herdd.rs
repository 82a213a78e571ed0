//! The herd node daemon.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use herd_core::proto::ClusterStatus;
use herd_server::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "herdd", about = "herd object-store node daemon")]
struct Args {
    /// Base directory for persisted state.
    #[arg(short = 'd', long, default_value = "/var/lib/herd", env = "HERD_DIR")]
    dir: PathBuf,

    /// Listener address.
    #[arg(short = 'b', long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Listener port.
    #[arg(short = 'p', long, default_value_t = 7001)]
    port: u16,

    /// Dedicated data-plane listener address.
    #[arg(long)]
    io_bind: Option<IpAddr>,

    /// Dedicated data-plane listener port.
    #[arg(long, default_value_t = 0)]
    io_port: u16,

    /// Failure domain of this node.
    #[arg(short = 'z', long, default_value_t = 0)]
    zone: u32,

    /// Advertised capacity in bytes.
    #[arg(long, default_value_t = 0)]
    space: u64,

    /// Membership driver (local, shepherd, zookeeper).
    #[arg(short = 'c', long, default_value = "shepherd")]
    cluster: String,

    /// Driver option (e.g. the shepherd host:port).
    #[arg(long)]
    cluster_option: Option<String>,
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
    let config = ServerConfig {
        base_dir: args.dir,
        addr: args.bind,
        port: args.port,
        io_addr: args.io_bind,
        io_port: args.io_port,
        zone: args.zone,
        space: args.space,
        cluster_driver: args.cluster,
        cluster_option: args.cluster_option,
    };

    let node = herd_server::start(config).await?;
    node.wait_for_join().await;

    // Run until a shutdown request (signal or cluster op) arrives.
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, leaving the cluster");
                node.leave().await?;
                break;
            }
            () = tokio::time::sleep(std::time::Duration::from_millis(250)) => {
                if matches!(
                    node.sys.status(),
                    ClusterStatus::Shutdown | ClusterStatus::Killed
                ) {
                    tracing::info!("cluster status asks for shutdown");
                    break;
                }
            }
        }
    }
    Ok(())
}
