//! Cluster configuration.
//!
//! The server file has one header line followed by one address per replica:
//!
//! ```text
//! <serverID> <nServers> <nSeats>
//! <host>:<port>
//! ...
//! ```
//!
//! `serverID` is 1-based in the file and 0-based everywhere else. `port` is
//! the client-facing port; replicas talk to each other on `port + 1`.
//!
//! A client file lists the servers to try, in order, followed by commands
//! to run before reading standard input:
//!
//! ```text
//! <nServers>
//! <host>:<port>
//! ...
//! <command>
//! ...
//! ```

use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::mutex::{ReplicaId, Timestamp};

/// Default pause between two failed connection attempts.
pub const DEFAULT_CONNECT_BACKOFF: Duration = Duration::from_millis(500);

/// Default timeout of a single outbound connect.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Default time a peer gets to send its handshake line.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time a client waits on one server before trying the next.
pub const DEFAULT_CLIENT_CONNECT_TIMEOUT: Duration = Duration::from_millis(100);

/// Errors while reading the server file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("server file is empty")]
    Empty,

    #[error("line {line}: expected `<serverID> <nServers> <nSeats>`, got {text:?}")]
    Header { line: usize, text: String },

    #[error("line {line}: expected `<nServers>`, got {text:?}")]
    ServerCount { line: usize, text: String },

    #[error("line {line}: expected `<host>:<port>`, got {text:?}")]
    Address { line: usize, text: String },

    #[error("server file declares {declared} servers but lists {listed}")]
    ReplicaCount { declared: usize, listed: usize },

    #[error("server id {id} is outside 1..={n_servers}")]
    ReplicaId { id: u64, n_servers: usize },

    #[error("port {0} leaves no room for the peer port")]
    PortOverflow(u16),
}

/// Address of one replica as listed in the server file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaAddr {
    pub host: String,
    /// Client-facing port.
    pub port: u16,
}

impl ReplicaAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, ConfigError> {
        if port == u16::MAX {
            return Err(ConfigError::PortOverflow(port));
        }
        Ok(ReplicaAddr {
            host: host.into(),
            port,
        })
    }

    /// Port of the replica-to-replica listener.
    pub fn peer_port(&self) -> u16 {
        self.port + 1
    }
}

/// Static description of the cluster, seen from one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    /// This replica (0-based).
    pub replica_id: ReplicaId,
    /// Every replica, indexed by id.
    pub replicas: Vec<ReplicaAddr>,
    /// Size of the seat table.
    pub n_seats: usize,
}

impl ClusterConfig {
    pub fn new(
        replica_id: ReplicaId,
        replicas: Vec<ReplicaAddr>,
        n_seats: usize,
    ) -> Result<Self, ConfigError> {
        if replica_id as usize >= replicas.len() {
            return Err(ConfigError::ReplicaId {
                id: u64::from(replica_id) + 1,
                n_servers: replicas.len(),
            });
        }
        Ok(ClusterConfig {
            replica_id,
            replicas,
            n_seats,
        })
    }

    /// Read and parse a server file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parse the contents of a server file.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(i, l)| (i + 1, l.trim()))
            .filter(|(_, l)| !l.is_empty());

        let (header_line, header) = lines.next().ok_or(ConfigError::Empty)?;
        let bad_header = || ConfigError::Header {
            line: header_line,
            text: header.to_string(),
        };
        let fields: Vec<&str> = header.split_whitespace().collect();
        let [id, n_servers, n_seats] = fields.as_slice() else {
            return Err(bad_header());
        };
        let id: u64 = id.parse().map_err(|_| bad_header())?;
        let n_servers: usize = n_servers.parse().map_err(|_| bad_header())?;
        let n_seats: usize = n_seats.parse().map_err(|_| bad_header())?;

        let replicas = lines
            .map(|(line, text)| parse_address(line, text))
            .collect::<Result<Vec<_>, _>>()?;
        if replicas.len() != n_servers {
            return Err(ConfigError::ReplicaCount {
                declared: n_servers,
                listed: replicas.len(),
            });
        }
        if id == 0 || id > n_servers as u64 {
            return Err(ConfigError::ReplicaId { id, n_servers });
        }

        Self::new((id - 1) as ReplicaId, replicas, n_seats)
    }

    pub fn cluster_size(&self) -> usize {
        self.replicas.len()
    }

    /// This replica's own address entry.
    pub fn local(&self) -> &ReplicaAddr {
        &self.replicas[self.replica_id as usize]
    }
}

/// What a client needs: servers in failover order and preloaded commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub servers: Vec<ReplicaAddr>,
    pub commands: Vec<String>,
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(i, l)| (i + 1, l.trim()))
            .filter(|(_, l)| !l.is_empty());

        let (line, header) = lines.next().ok_or(ConfigError::Empty)?;
        let n_servers: usize = header.parse().map_err(|_| ConfigError::ServerCount {
            line,
            text: header.to_string(),
        })?;

        let servers = lines
            .by_ref()
            .take(n_servers)
            .map(|(line, text)| parse_address(line, text))
            .collect::<Result<Vec<_>, _>>()?;
        if servers.len() != n_servers {
            return Err(ConfigError::ReplicaCount {
                declared: n_servers,
                listed: servers.len(),
            });
        }
        let commands = lines.map(|(_, text)| text.to_string()).collect();

        Ok(ClientConfig { servers, commands })
    }
}

fn parse_address(line: usize, text: &str) -> Result<ReplicaAddr, ConfigError> {
    let bad = || ConfigError::Address {
        line,
        text: text.to_string(),
    };
    let (host, port) = text.rsplit_once(':').ok_or_else(bad)?;
    if host.is_empty() {
        return Err(bad());
    }
    let port: u16 = port.trim().parse().map_err(|_| bad())?;
    ReplicaAddr::new(host.trim(), port)
}

/// Protocol tunables. Not part of the server file.
#[derive(Debug, Clone)]
pub struct MutexConfig {
    /// Pause after a failed connect before the next attempt.
    pub connect_backoff: Duration,
    /// Timeout of one outbound connect.
    pub connect_timeout: Duration,
    /// How long a new link may take to deliver its handshake line.
    pub handshake_timeout: Duration,
    /// Starting value of the logical clock.
    pub initial_clock: Timestamp,
    /// Interface the peer listener binds to.
    pub bind_ip: IpAddr,
}

impl Default for MutexConfig {
    fn default() -> Self {
        MutexConfig {
            connect_backoff: DEFAULT_CONNECT_BACKOFF,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            initial_clock: 0,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}
