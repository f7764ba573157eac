//! Seat reservation server.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use seatlock::config::{ClusterConfig, MutexConfig};
use seatlock::mutex::{JoinMode, LamportMutex};
use seatlock::seats::SeatTable;
use seatlock::server::ClientServer;

#[derive(Parser, Debug)]
#[command(name = "seatlock")]
#[command(about = "Run one replica of the replicated seat table")]
struct Args {
    /// Server file: `<serverID> <nServers> <nSeats>` then one `<host>:<port>` per replica.
    server_file: PathBuf,

    /// Rejoin a running cluster after a crash instead of a fresh start.
    #[arg(long)]
    restart: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let cluster = ClusterConfig::load(&args.server_file)?;
    info!(
        replica = cluster.replica_id + 1,
        n_servers = cluster.cluster_size(),
        n_seats = cluster.n_seats,
        client_port = cluster.local().port,
        "server file loaded"
    );
    for (id, replica) in cluster.replicas.iter().enumerate() {
        info!(replica = id + 1, host = %replica.host, port = replica.port, "cluster member");
    }

    let seats = Arc::new(SeatTable::new(cluster.n_seats));
    let mode = if args.restart {
        JoinMode::Recovery
    } else {
        JoinMode::Fresh
    };
    let mutex = Arc::new(LamportMutex::start(
        &cluster,
        MutexConfig::default(),
        seats.clone(),
        mode,
    )?);
    info!(seats = seats.n_seats(), live_peers = mutex.live_peers(), "replica ready");

    let client_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, cluster.local().port));
    let server = ClientServer::bind(client_addr, mutex, seats)?;
    server.run();
    Ok(())
}
