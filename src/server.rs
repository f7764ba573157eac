//! Client-facing TCP server.
//!
//! Each client connection gets its own thread. A connection carries one JSON
//! object of string fields per line and receives one JSON object per line
//! back. Every valid command runs inside the cluster-wide critical section
//! and publishes the resulting seat table on release.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use tracing::{debug, info, warn};

use crate::mutex::{Application, InitError, LamportMutex};
use crate::seats::{SeatCommand, SeatReply, SeatTable};

/// Errors that end a client connection.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("client I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed client request: {0}")]
    Json(#[from] serde_json::Error),
}

/// Run one client request to completion.
///
/// Requests that do not parse are answered without touching the critical
/// section.
pub fn handle_request(
    mutex: &LamportMutex,
    seats: &SeatTable,
    fields: &HashMap<String, String>,
) -> SeatReply {
    let command = match SeatCommand::parse(fields) {
        Ok(command) => command,
        Err(e) => {
            info!(error = %e, "invalid client request");
            return SeatReply::invalid();
        }
    };

    mutex.request_critical_section();
    let reply = seats.apply(&command);
    mutex.release_critical_section(seats.serialized_state());

    debug!(?command, message = %reply.message, "client request applied");
    reply
}

/// Accepts client connections for one replica.
pub struct ClientServer {
    listener: TcpListener,
    mutex: Arc<LamportMutex>,
    seats: Arc<SeatTable>,
}

impl ClientServer {
    pub fn bind(
        addr: SocketAddr,
        mutex: Arc<LamportMutex>,
        seats: Arc<SeatTable>,
    ) -> Result<Self, InitError> {
        let listener = TcpListener::bind(addr).map_err(|source| InitError::Bind { addr, source })?;
        Ok(ClientServer {
            listener,
            mutex,
            seats,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve clients until the listener fails.
    pub fn run(&self) {
        info!(
            replica = self.mutex.replica_id(),
            addr = ?self.listener.local_addr().ok(),
            "serving clients"
        );
        for stream in self.listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "client accept failed");
                    continue;
                }
            };
            let peer = stream.peer_addr().ok();
            info!(client = ?peer, "client connected");

            let mutex = Arc::clone(&self.mutex);
            let seats = Arc::clone(&self.seats);
            let spawned = thread::Builder::new()
                .name("client".to_string())
                .spawn(move || match serve_client(&mutex, &seats, stream) {
                    Ok(()) => info!(client = ?peer, "client disconnected"),
                    Err(e) => warn!(client = ?peer, error = %e, "closing client connection"),
                });
            if let Err(e) = spawned {
                warn!(error = %e, "cannot spawn client thread");
            }
        }
    }
}

fn serve_client(
    mutex: &LamportMutex,
    seats: &SeatTable,
    stream: TcpStream,
) -> Result<(), ClientError> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }
        let fields: HashMap<String, String> = serde_json::from_str(&line)?;
        debug!(?fields, "client request");

        let response: BTreeMap<String, String> = handle_request(mutex, seats, &fields).into_fields();
        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        writer.write_all(out.as_bytes())?;
        writer.flush()?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::{Duration, Instant};

    use crate::config::{ClusterConfig, MutexConfig, ReplicaAddr};
    use crate::mutex::JoinMode;

    fn settings() -> MutexConfig {
        MutexConfig {
            connect_backoff: Duration::from_millis(50),
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..MutexConfig::default()
        }
    }

    fn configs(n: usize, n_seats: usize) -> Vec<ClusterConfig> {
        let placeholders: Vec<TcpListener> = (0..n)
            .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        let replicas: Vec<ReplicaAddr> = placeholders
            .iter()
            .map(|p| ReplicaAddr::new("127.0.0.1", p.local_addr().unwrap().port() - 1).unwrap())
            .collect();
        drop(placeholders);
        (0..n)
            .map(|id| ClusterConfig::new(id as u32, replicas.clone(), n_seats).unwrap())
            .collect()
    }

    /// Start a replica's mutex listener and client server; joining is left
    /// to the caller.
    fn start_replica(config: &ClusterConfig) -> (Arc<LamportMutex>, Arc<SeatTable>, SocketAddr) {
        let seats = Arc::new(SeatTable::new(config.n_seats));
        let mutex = Arc::new(LamportMutex::listen(config, settings(), seats.clone()).unwrap());
        let server = ClientServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::clone(&mutex),
            Arc::clone(&seats),
        )
        .unwrap();
        let addr = server.local_addr().unwrap();
        thread::spawn(move || server.run());
        (mutex, seats, addr)
    }

    struct Client {
        reader: BufReader<TcpStream>,
        writer: TcpStream,
    }

    impl Client {
        fn connect(addr: SocketAddr) -> Self {
            let writer = TcpStream::connect(addr).unwrap();
            writer.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
            Client {
                reader: BufReader::new(writer.try_clone().unwrap()),
                writer,
            }
        }

        fn send_line(&mut self, line: &str) {
            writeln!(self.writer, "{line}").unwrap();
        }

        fn call(&mut self, pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
            let request: HashMap<&str, &str> = pairs.iter().copied().collect();
            self.send_line(&serde_json::to_string(&request).unwrap());
            let mut line = String::new();
            self.reader.read_line(&mut line).unwrap();
            serde_json::from_str(&line).unwrap()
        }
    }

    #[test]
    fn test_single_replica_session() {
        let config = &configs(1, 2)[0];
        let (mutex, seats, addr) = start_replica(config);
        mutex.join(JoinMode::Fresh);
        let mut client = Client::connect(addr);

        let reply = client.call(&[("REQUEST", "RESERVE"), ("NAME", "ann")]);
        assert_eq!(reply["MESSAGE"], "Seat assigned to you is 1");
        assert_eq!(reply["SEATNUM"], "1");

        let reply = client.call(&[("REQUEST", "BOOKSEAT"), ("NAME", "bob"), ("SEATNUM", "2")]);
        assert_eq!(reply["MESSAGE"], "Seat assigned to you is 2");

        let reply = client.call(&[("REQUEST", "RESERVE"), ("NAME", "cy")]);
        assert_eq!(reply["MESSAGE"], "Sold out - no seat available.");
        assert_eq!(reply["SEATNUM"], "-1");

        let reply = client.call(&[("REQUEST", "DELETE"), ("NAME", "ann")]);
        assert_eq!(reply["MESSAGE"], "Reservation deleted for ann");
        assert!(!reply.contains_key("SEATNUM"));

        assert_eq!(seats.snapshot(), vec![String::new(), "bob".to_string()]);
    }

    #[test]
    fn test_invalid_command_keeps_connection() {
        let config = &configs(1, 1)[0];
        let (mutex, _seats, addr) = start_replica(config);
        mutex.join(JoinMode::Fresh);
        let mut client = Client::connect(addr);

        let reply = client.call(&[("REQUEST", "CANCEL"), ("NAME", "ann")]);
        assert_eq!(reply["MESSAGE"], "Invalid command");

        let reply = client.call(&[("REQUEST", "BOOKSEAT"), ("NAME", "ann"), ("SEATNUM", "x")]);
        assert_eq!(reply["MESSAGE"], "Invalid command");

        let reply = client.call(&[("REQUEST", "SEARCH"), ("NAME", "ann")]);
        assert_eq!(reply["MESSAGE"], "No reservation found for ann");
        assert_eq!(reply["SEATNUM"], "-1");
    }

    #[test]
    fn test_malformed_json_closes_connection() {
        let config = &configs(1, 1)[0];
        let (mutex, _seats, addr) = start_replica(config);
        mutex.join(JoinMode::Fresh);
        let mut client = Client::connect(addr);

        client.send_line("RESERVE ann");
        let mut line = String::new();
        assert_eq!(client.reader.read_line(&mut line).unwrap_or(0), 0);
    }

    #[test]
    fn test_bookings_replicate_across_servers() {
        let configs = configs(2, 3);
        let replicas: Vec<_> = configs.iter().map(start_replica).collect();
        let joins: Vec<_> = replicas
            .iter()
            .map(|(mutex, _, _)| {
                let mutex = Arc::clone(mutex);
                thread::spawn(move || mutex.join(JoinMode::Fresh))
            })
            .collect();
        for join in joins {
            join.join().unwrap();
        }

        let mut first = Client::connect(replicas[0].2);
        let mut second = Client::connect(replicas[1].2);

        let reply = first.call(&[("REQUEST", "BOOKSEAT"), ("NAME", "ann"), ("SEATNUM", "3")]);
        assert_eq!(reply["MESSAGE"], "Seat assigned to you is 3");

        let reply = second.call(&[("REQUEST", "SEARCH"), ("NAME", "ann")]);
        assert_eq!(reply["MESSAGE"], "Reserved seat for ann is 3");

        let reply = second.call(&[("REQUEST", "BOOKSEAT"), ("NAME", "bob"), ("SEATNUM", "3")]);
        assert_eq!(reply["MESSAGE"], "Seat 3 is not available.");

        let reply = second.call(&[("REQUEST", "RESERVE"), ("NAME", "bob")]);
        assert_eq!(reply["SEATNUM"], "1");

        let deadline = Instant::now() + Duration::from_secs(10);
        while replicas[0].1.snapshot() != replicas[1].1.snapshot() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(
            replicas[0].1.snapshot(),
            vec!["bob".to_string(), String::new(), "ann".to_string()]
        );
    }
}
