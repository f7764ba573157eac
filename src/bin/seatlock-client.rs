//! Interactive client for the seat servers.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use seatlock::client::SeatClient;
use seatlock::config::{ClientConfig, DEFAULT_CLIENT_CONNECT_TIMEOUT};

#[derive(Parser, Debug)]
#[command(name = "seatlock-client")]
#[command(about = "Send seat commands to the first reachable server")]
struct Args {
    /// Client file: `<nServers>`, one `<host>:<port>` per server, then preloaded commands.
    client_file: PathBuf,

    /// How long to wait on one server before trying the next.
    #[arg(long, default_value_t = DEFAULT_CLIENT_CONNECT_TIMEOUT.as_millis() as u64)]
    connect_timeout_ms: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let config = ClientConfig::load(&args.client_file)?;
    info!(
        servers = config.servers.len(),
        commands = config.commands.len(),
        "client file loaded"
    );

    let mut client = SeatClient::new(
        config.servers,
        Duration::from_millis(args.connect_timeout_ms),
    );
    client.connect()?;

    for command in &config.commands {
        println!("Executing preloaded command: {command}");
        println!(">>> {}", client.execute(command));
    }

    let mut stdout = io::stdout();
    print!(">>> ");
    stdout.flush()?;
    for line in io::stdin().lock().lines() {
        let response = client.execute(&line?);
        print!("{response} \n>>> ");
        stdout.flush()?;
    }

    println!("Good Bye!");
    Ok(())
}
