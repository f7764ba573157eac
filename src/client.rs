//! Command-line client for the seat servers.
//!
//! A client holds one connection at a time. Servers are tried in the order
//! the client file lists them; when the current server stops answering, the
//! request is sent once more through the next server that accepts a
//! connection.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::ReplicaAddr;
use crate::seats::{FIELD_MESSAGE, FIELD_NAME, FIELD_REQUEST, FIELD_SEATNUM};

/// A command line the client refuses before contacting any server.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    #[error("NOTE: not enough tokens in {0} string")]
    NotEnoughTokens(&'static str),

    #[error("ERROR: No such command")]
    UnknownCommand,
}

/// Errors from talking to the servers.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to connect to any of {tried} servers, please try again later")]
    NoServer { tried: usize },

    #[error("server closed the connection")]
    Closed,

    #[error("server I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed server response: {0}")]
    Json(#[from] serde_json::Error),
}

/// Turn `reserve <name>`, `bookSeat <name> <n>`, `search <name>` or
/// `delete <name>` into a request map. Extra tokens are ignored.
pub fn parse_command_line(line: &str) -> Result<HashMap<String, String>, InputError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let (kind, label, arity) = match tokens.first().copied() {
        Some("reserve") => ("RESERVE", "reserve", 2),
        Some("bookSeat") => ("BOOKSEAT", "bookseat", 3),
        Some("search") => ("SEARCH", "search", 2),
        Some("delete") => ("DELETE", "delete", 2),
        _ => return Err(InputError::UnknownCommand),
    };
    if tokens.len() < arity {
        return Err(InputError::NotEnoughTokens(label));
    }

    let mut request = HashMap::new();
    request.insert(FIELD_REQUEST.to_string(), kind.to_string());
    request.insert(FIELD_NAME.to_string(), tokens[1].to_string());
    if arity == 3 {
        request.insert(FIELD_SEATNUM.to_string(), tokens[2].to_string());
    }
    Ok(request)
}

struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Connection {
    fn dial(server: &ReplicaAddr, timeout: Duration) -> io::Result<Self> {
        let mut last_err = None;
        for addr in (server.host.as_str(), server.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(writer) => {
                    return Ok(Connection {
                        reader: BufReader::new(writer.try_clone()?),
                        writer,
                    })
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
        }))
    }

    fn exchange(
        &mut self,
        request: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>, SessionError> {
        let mut out = serde_json::to_string(request)?;
        out.push('\n');
        self.writer.write_all(out.as_bytes())?;
        self.writer.flush()?;

        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(SessionError::Closed);
        }
        Ok(serde_json::from_str(&line)?)
    }
}

/// Client session with failover across the listed servers.
pub struct SeatClient {
    servers: Vec<ReplicaAddr>,
    connect_timeout: Duration,
    /// Index of the server to try first on the next connect.
    next: usize,
    conn: Option<Connection>,
}

impl SeatClient {
    pub fn new(servers: Vec<ReplicaAddr>, connect_timeout: Duration) -> Self {
        SeatClient {
            servers,
            connect_timeout,
            next: 0,
            conn: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Connect to the first reachable server, starting after the one used
    /// last. Each server gets one attempt per call.
    pub fn connect(&mut self) -> Result<(), SessionError> {
        self.conn = None;
        let n = self.servers.len();
        for offset in 0..n {
            let idx = (self.next + offset) % n;
            let server = &self.servers[idx];
            match Connection::dial(server, self.connect_timeout) {
                Ok(conn) => {
                    info!(host = %server.host, port = server.port, "connected");
                    self.conn = Some(conn);
                    self.next = (idx + 1) % n;
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    warn!(host = %server.host, port = server.port, "timed out connecting");
                }
                Err(e) => {
                    debug!(host = %server.host, port = server.port, error = %e, "connect failed");
                }
            }
        }
        Err(SessionError::NoServer { tried: n })
    }

    /// Send one request and wait for its reply, failing over once if the
    /// current server is gone.
    pub fn call(
        &mut self,
        request: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>, SessionError> {
        if self.conn.is_none() {
            self.connect()?;
        }
        let first = match self.conn.as_mut() {
            Some(conn) => conn.exchange(request),
            None => Err(SessionError::Closed),
        };
        match first {
            Err(e @ (SessionError::Closed | SessionError::Io(_))) => {
                warn!(error = %e, "lost server, reconnecting");
                self.connect()?;
                let conn = self.conn.as_mut().ok_or(SessionError::Closed)?;
                let reply = conn.exchange(request);
                if reply.is_err() {
                    self.conn = None;
                }
                reply
            }
            other => other,
        }
    }

    /// Run one command line and return the text to show the user.
    pub fn execute(&mut self, line: &str) -> String {
        let request = match parse_command_line(line) {
            Ok(request) => request,
            Err(e) => return e.to_string(),
        };
        match self.call(&request) {
            Ok(mut reply) => reply.remove(FIELD_MESSAGE).unwrap_or_default(),
            Err(e) => format!("ERROR: {e}"),
        }
    }
}
