//! TCP peer links.
//!
//! One listener accepts inbound links; every established link gets a reader
//! thread (decodes lines into [`MutexEngine::process_message`]) and a writer
//! thread (drains the link's channel onto the socket). The first line on
//! each link is the join handshake.

use std::collections::{HashMap, HashSet};
use std::io::{self, BufRead, BufReader, Write};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};
use tracing::{debug, info, warn};

use crate::config::MutexConfig;

use super::engine::{LinkId, MutexEngine};
use super::errors::{InitError, LinkError};
use super::message::{Message, MessageKind, ReplicaId};

/// How long `join_cluster` sleeps between checks of the shutdown flag.
const MEMBERSHIP_POLL: Duration = Duration::from_millis(100);

/// How a replica enters the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    /// Whole cluster starting together: dial every lower id, wait for the
    /// higher ids to dial us.
    Fresh,
    /// Restart after a crash: dial anyone reachable and learn from the first
    /// JOIN_RESPONSE how many peers are still alive.
    Recovery,
}

/// Write one message as a JSON line.
pub fn write_message<W: Write>(writer: &mut W, msg: &Message) -> io::Result<()> {
    let mut line = msg.encode();
    line.push('\n');
    writer.write_all(line.as_bytes())?;
    writer.flush()
}

/// Read one message. `Ok(None)` means the peer closed the stream.
pub fn read_message<R: BufRead>(reader: &mut R) -> Result<Option<Message>, LinkError> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(Message::decode(&line)?))
}

/// Owns the peer listener and the sockets of every established link.
pub struct LinkManager {
    engine: Arc<MutexEngine>,
    /// Peer-listener address of every replica, indexed by id.
    peer_addrs: Vec<SocketAddr>,
    settings: MutexConfig,
    local_addr: SocketAddr,
    shutdown: AtomicBool,
    /// Socket of each live link, kept so shutdown can close them.
    streams: Mutex<HashMap<LinkId, TcpStream>>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl LinkManager {
    /// Bind the peer listener and start accepting inbound links.
    ///
    /// Failing to bind is fatal: the replica cannot take part in the
    /// protocol without it.
    pub fn listen(
        engine: Arc<MutexEngine>,
        peer_addrs: Vec<SocketAddr>,
        settings: MutexConfig,
    ) -> Result<Arc<Self>, InitError> {
        let me = engine.replica_id();
        let port = peer_addrs
            .get(me as usize)
            .ok_or(InitError::MissingAddress {
                replica: me,
                listed: peer_addrs.len(),
            })?
            .port();
        let addr = SocketAddr::new(settings.bind_ip, port);
        let listener = TcpListener::bind(addr).map_err(|source| InitError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| InitError::Bind { addr, source })?;
        info!(replica = me, %local_addr, "peer listener bound");

        let links = Arc::new(LinkManager {
            engine,
            peer_addrs,
            settings,
            local_addr,
            shutdown: AtomicBool::new(false),
            streams: Mutex::new(HashMap::new()),
            accept_thread: Mutex::new(None),
        });

        let acceptor = Arc::clone(&links);
        let handle = thread::Builder::new()
            .name(format!("peer-accept-{}", me))
            .spawn(move || acceptor.accept_loop(listener))
            .map_err(|e| InitError::Spawn("peer accept", e))?;
        *links.accept_thread.lock().expect("accept handle poisoned") = Some(handle);

        Ok(links)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn replica_id(&self) -> ReplicaId {
        self.engine.replica_id()
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        for stream in listener.incoming() {
            if self.is_shutdown() {
                break;
            }
            match stream {
                Ok(stream) => {
                    let links = Arc::clone(&self);
                    let spawned = thread::Builder::new()
                        .name(format!("peer-inbound-{}", self.replica_id()))
                        .spawn(move || links.handle_inbound(stream));
                    if let Err(e) = spawned {
                        warn!(replica = self.replica_id(), error = %e, "cannot spawn inbound link thread");
                    }
                }
                Err(e) => {
                    warn!(replica = self.replica_id(), error = %e, "accept failed");
                }
            }
        }
        debug!(replica = self.replica_id(), "peer listener stopped");
    }

    fn handle_inbound(self: Arc<Self>, stream: TcpStream) {
        let remote = stream.peer_addr().ok();
        if let Err(e) = self.inbound_link(stream) {
            warn!(replica = self.replica_id(), ?remote, error = %e, "rejected inbound peer connection");
        }
    }

    /// Acceptor side: expect JOIN_REQUEST, answer, then serve the link on
    /// this thread until it drops.
    fn inbound_link(self: &Arc<Self>, stream: TcpStream) -> Result<(), LinkError> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(self.settings.handshake_timeout))?;
        let mut reader = BufReader::new(stream.try_clone()?);

        let hello = read_message(&mut reader)?.ok_or(LinkError::Closed)?;
        if hello.kind != MessageKind::JoinRequest {
            return Err(LinkError::UnexpectedMessage {
                expected: "JOIN_REQUEST",
                found: format!("{:?}", hello.kind),
            });
        }
        let peer = hello.origin;
        if peer as usize >= self.peer_addrs.len() {
            return Err(LinkError::UnknownReplica(peer));
        }
        stream.set_read_timeout(None)?;

        let (tx, rx) = unbounded();
        let link_id = self
            .engine
            .accept_join(&hello, tx)
            .ok_or(LinkError::Duplicate(peer))?;

        self.start_writer(peer, link_id, &stream, rx)?;
        self.read_loop(peer, link_id, reader);
        Ok(())
    }

    /// Joiner side of the handshake with `peer`.
    ///
    /// Returns the responder's live-peer count.
    pub fn join_peer(self: &Arc<Self>, peer: ReplicaId) -> Result<u32, LinkError> {
        let addr = *self
            .peer_addrs
            .get(peer as usize)
            .ok_or(LinkError::UnknownReplica(peer))?;
        let stream = TcpStream::connect_timeout(&addr, self.settings.connect_timeout)?;
        stream.set_nodelay(true)?;

        let hello = self.engine.join_request();
        write_message(&mut &stream, &hello)?;
        self.engine.record_send();

        stream.set_read_timeout(Some(self.settings.handshake_timeout))?;
        let mut reader = BufReader::new(stream.try_clone()?);
        let response = read_message(&mut reader)?.ok_or(LinkError::Closed)?;
        stream.set_read_timeout(None)?;

        if response.kind != MessageKind::JoinResponse {
            return Err(LinkError::UnexpectedMessage {
                expected: "JOIN_RESPONSE",
                found: format!("{:?}", response.kind),
            });
        }
        if response.origin != peer {
            return Err(LinkError::UnexpectedMessage {
                expected: "JOIN_RESPONSE from the dialed replica",
                found: format!("JOIN_RESPONSE from replica {}", response.origin),
            });
        }
        let replica_count = response.replica_count.unwrap_or(0);

        let (tx, rx) = unbounded();
        let Some(link_id) = self.engine.complete_join(&response, tx) else {
            // Crossed dial: the peer's own link to us won. Dropping this
            // socket is what the peer expects.
            if self.engine.is_linked(peer) {
                debug!(replica = self.replica_id(), peer, "already linked through the peer's dial");
                return Ok(replica_count);
            }
            return Err(LinkError::Duplicate(peer));
        };
        self.start_writer(peer, link_id, &stream, rx)?;

        let links = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("peer-reader-{}-{}", self.replica_id(), peer))
            .spawn(move || links.read_loop(peer, link_id, reader));
        if let Err(e) = spawned {
            self.close_link(peer, link_id);
            return Err(e.into());
        }

        Ok(replica_count)
    }

    fn start_writer(
        &self,
        peer: ReplicaId,
        link_id: LinkId,
        stream: &TcpStream,
        rx: Receiver<Message>,
    ) -> Result<(), LinkError> {
        let spawn = || -> io::Result<()> {
            self.streams
                .lock()
                .expect("link streams poisoned")
                .insert(link_id, stream.try_clone()?);
            let writer = stream.try_clone()?;
            let me = self.replica_id();
            thread::Builder::new()
                .name(format!("peer-writer-{}-{}", me, peer))
                .spawn(move || writer_loop(me, peer, writer, rx))?;
            Ok(())
        };
        spawn().map_err(|e| {
            self.close_link(peer, link_id);
            LinkError::Io(e)
        })
    }

    /// Feed every message of an established link to the engine.
    ///
    /// A read error, EOF or malformed line ends the link; there is no
    /// reconnect from this side.
    fn read_loop<R: BufRead>(&self, peer: ReplicaId, link_id: LinkId, mut reader: R) {
        let me = self.replica_id();
        loop {
            match read_message(&mut reader) {
                Ok(Some(msg)) if msg.origin == peer => self.engine.process_message(msg),
                Ok(Some(msg)) => {
                    warn!(replica = me, peer, origin = msg.origin, "message with foreign origin, dropping link");
                    break;
                }
                Ok(None) => {
                    info!(replica = me, peer, "peer closed link");
                    break;
                }
                Err(e) if self.is_shutdown() => {
                    debug!(replica = me, peer, error = %e, "link closed by shutdown");
                    break;
                }
                Err(e) => {
                    warn!(replica = me, peer, error = %e, "peer link failed");
                    break;
                }
            }
        }
        self.close_link(peer, link_id);
    }

    fn close_link(&self, peer: ReplicaId, link_id: LinkId) {
        self.engine.detach_peer(peer, link_id);
        if let Some(stream) = self.streams.lock().expect("link streams poisoned").remove(&link_id) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Run the join protocol. Returns once the replica has as many links as
    /// the mode requires, or when shut down.
    pub fn join_cluster(self: &Arc<Self>, mode: JoinMode) -> usize {
        match mode {
            JoinMode::Fresh => self.join_fresh(),
            JoinMode::Recovery => self.join_recovery(),
        }
    }

    fn join_fresh(self: &Arc<Self>) -> usize {
        let me = self.replica_id();
        let target = self.peer_addrs.len() - 1;

        for peer in 0..me {
            while !self.is_shutdown() && !self.engine.is_linked(peer) {
                match self.join_peer(peer) {
                    Ok(_) => {}
                    Err(LinkError::Duplicate(_)) => break,
                    Err(e) => {
                        debug!(replica = me, peer, error = %e, "peer not reachable yet");
                        thread::sleep(self.settings.connect_backoff);
                    }
                }
            }
        }

        info!(replica = me, target, "waiting for higher replicas to join");
        while !self.is_shutdown() && !self.engine.wait_for_peers(target, Some(MEMBERSHIP_POLL)) {}
        target
    }

    /// Dial peers until as many have joined as the first JOIN_RESPONSE
    /// said were alive. A joined peer that dies afterwards still counts.
    fn join_recovery(self: &Arc<Self>) -> usize {
        let me = self.replica_id();
        let candidates: Vec<ReplicaId> = (0..self.peer_addrs.len() as ReplicaId)
            .filter(|&peer| peer != me)
            .collect();
        let mut joined: HashSet<ReplicaId> = HashSet::new();
        let mut target: Option<usize> = None;

        loop {
            if self.is_shutdown() {
                return joined.len();
            }
            // Peers that dialed us have joined too.
            joined.extend(candidates.iter().copied().filter(|&peer| self.engine.is_linked(peer)));
            match target {
                Some(target) if joined.len() >= target => {
                    info!(replica = me, target, live_peers = self.engine.live_peers(), "recovered cluster membership");
                    return target;
                }
                _ if joined.len() == candidates.len() => return joined.len(),
                _ => {}
            }

            for &peer in &candidates {
                if self.is_shutdown() || target.is_some_and(|t| joined.len() >= t) {
                    break;
                }
                if joined.contains(&peer) {
                    continue;
                }
                match self.join_peer(peer) {
                    Ok(count) => {
                        joined.insert(peer);
                        if target.is_none() {
                            info!(replica = me, peer, live = count, "learned live cluster size");
                            target = Some(count as usize);
                        }
                    }
                    Err(e) => {
                        debug!(replica = me, peer, error = %e, "join attempt failed");
                        thread::sleep(self.settings.connect_backoff);
                    }
                }
            }

            if joined.is_empty() {
                warn!(replica = me, "no live peer reachable, retrying");
            }
        }
    }

    /// Close the listener and every link.
    ///
    /// Peers observe this exactly like a crash of this replica.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        // Unblock accept() so the listener thread sees the flag.
        let wake_ip = match self.local_addr.ip() {
            ip if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            ip => ip,
        };
        let _ = TcpStream::connect_timeout(
            &SocketAddr::new(wake_ip, self.local_addr.port()),
            self.settings.connect_timeout,
        );
        if let Some(handle) = self.accept_thread.lock().expect("accept handle poisoned").take() {
            let _ = handle.join();
        }

        let streams: Vec<TcpStream> = self
            .streams
            .lock()
            .expect("link streams poisoned")
            .drain()
            .map(|(_, stream)| stream)
            .collect();
        for stream in streams {
            let _ = stream.shutdown(Shutdown::Both);
        }
        let dropped = self.engine.detach_all();
        info!(replica = self.replica_id(), links = dropped.len(), "peer links shut down");
    }
}

fn writer_loop(me: ReplicaId, peer: ReplicaId, mut stream: TcpStream, rx: Receiver<Message>) {
    for msg in rx.iter() {
        if let Err(e) = write_message(&mut stream, &msg) {
            warn!(replica = me, peer, error = %e, "write to peer failed");
            break;
        }
    }
    // The engine dropped the link or the socket broke. Closing only our
    // half lets the peer's reader see EOF while anything it already sent is
    // still read; the reader closes the rest.
    let _ = stream.shutdown(Shutdown::Write);
}
