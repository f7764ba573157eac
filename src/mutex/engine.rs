//! Lamport mutual-exclusion state machine.
//!
//! The engine owns everything the protocol shares between threads: the
//! logical clock, the request queue, the ACKs of the current round and the
//! set of linked peers. All of it lives behind one `Mutex`; callers blocked
//! in [`MutexEngine::request_critical_section`] park on a `Condvar` that is
//! notified after every change that can make their predicate true.
//!
//! # Invariants
//!
//! 1. **Single Round per Replica**: at most one local caller is past the
//!    `Idle` gate at a time; others wait for the phase to return to `Idle`.
//! 2. **Total Order**: requests are ordered by (timestamp, replica id).
//! 3. **Entry Condition**: a replica enters only while its own request is the
//!    queue minimum and every currently linked peer has ACKed the round.
//! 4. **Live Quorum**: the ACK quorum is re-evaluated against the current
//!    membership, so a lost peer never blocks the survivors.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::{debug, info, trace, warn};

use super::clock::{LogicalClock, Timestamp};
use super::message::{Message, MessageKind, ReplicaId, RequestKey};
use super::queue::RequestQueue;
use super::traits::Application;

/// Identifies one incarnation of a peer link.
///
/// A replica that drops and rejoins gets a new link; the reader of the old
/// link must not tear down the new one when it exits.
pub type LinkId = u64;

/// Where this replica stands in the current critical-section round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No outstanding request.
    Idle,
    /// REQUEST broadcast, waiting for ACKs and queue head.
    Requesting,
    /// Holding the critical section.
    InCriticalSection,
}

/// Outbound half of a peer link.
struct PeerLink {
    link_id: LinkId,
    tx: Sender<Message>,
    /// Replica that opened the connection.
    dialer: ReplicaId,
}

/// What to do with a newly handshaken link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// First link to this peer.
    New,
    /// Crossed dial: the new link wins and the old one is dropped.
    Replace,
    Reject,
}

struct EngineState {
    clock: LogicalClock,
    queue: RequestQueue,
    phase: Phase,
    /// Peers that ACKed the current round.
    acks: HashSet<ReplicaId>,
    /// Our own REQUEST while a round is open.
    outstanding: Option<Message>,
    /// Membership set: one entry per live peer.
    peers: HashMap<ReplicaId, PeerLink>,
}

impl EngineState {
    /// Queue `msg` on the peer's link. Counts as a send event on success.
    fn send(&mut self, peer: ReplicaId, msg: Message) -> bool {
        let Some(link) = self.peers.get(&peer) else {
            debug!(peer, kind = ?msg.kind, "no link to peer, dropping message");
            return false;
        };
        if link.tx.send(msg).is_err() {
            debug!(peer, "link writer has exited, dropping message");
            return false;
        }
        self.clock.increment();
        true
    }

    /// Send `msg` to every linked peer. Returns how many accepted it.
    fn broadcast(&mut self, msg: &Message) -> usize {
        let targets: Vec<ReplicaId> = self.peers.keys().copied().collect();
        targets
            .into_iter()
            .filter(|&peer| self.send(peer, msg.clone()))
            .count()
    }

    fn may_enter(&self, me: ReplicaId) -> bool {
        self.phase == Phase::Requesting
            && self.queue.peek_min().map(|head| head.origin) == Some(me)
            && self.peers.keys().all(|peer| self.acks.contains(peer))
    }

    /// Decide whether a link to `peer` opened by `dialer` may be registered.
    ///
    /// Two replicas that dial each other at the same time end up with two
    /// links. Both sides keep the one dialed by the higher id, so they agree
    /// on which socket survives. A second link from the same dialer is a
    /// duplicate and is refused.
    fn admission(&self, me: ReplicaId, peer: ReplicaId, dialer: ReplicaId) -> Admission {
        if peer == me {
            return Admission::Reject;
        }
        match self.peers.get(&peer) {
            None => Admission::New,
            Some(existing) if existing.dialer != dialer && dialer == me.max(peer) => {
                Admission::Replace
            }
            Some(_) => Admission::Reject,
        }
    }

    /// Register a link without any protocol traffic. A replaced link's
    /// sender is dropped, which stops its writer.
    fn link(&mut self, peer: ReplicaId, link_id: LinkId, tx: Sender<Message>, dialer: ReplicaId) {
        self.peers.insert(peer, PeerLink { link_id, tx, dialer });
    }

    /// Whether an ACK belongs to the round in progress.
    ///
    /// A peer stamps its ACK after observing our REQUEST, so an ACK for the
    /// current round always carries a later timestamp than the request.
    fn is_current_ack(&self, ack: &Message) -> bool {
        self.phase == Phase::Requesting
            && self
                .outstanding
                .as_ref()
                .is_some_and(|request| ack.timestamp > request.timestamp)
    }

    /// Bring a newly linked peer up to date with our open round.
    ///
    /// The peer missed the first broadcast and would otherwise never ACK us.
    fn forward_outstanding(&mut self, peer: ReplicaId) {
        if let Some(request) = self.outstanding.clone() {
            debug!(peer, timestamp = request.timestamp, "forwarding open request to new peer");
            self.send(peer, request);
        }
    }
}

/// The receive-side and caller-side halves of the Lamport mutex.
pub struct MutexEngine {
    replica_id: ReplicaId,
    app: Arc<dyn Application>,
    state: Mutex<EngineState>,
    changed: Condvar,
    next_link_id: AtomicU64,
}

impl MutexEngine {
    /// Create an engine for `replica_id` with no linked peers.
    pub fn new(replica_id: ReplicaId, app: Arc<dyn Application>, initial_clock: Timestamp) -> Self {
        MutexEngine {
            replica_id,
            app,
            state: Mutex::new(EngineState {
                clock: LogicalClock::new(initial_clock),
                queue: RequestQueue::new(),
                phase: Phase::Idle,
                acks: HashSet::new(),
                outstanding: None,
                peers: HashMap::new(),
            }),
            changed: Condvar::new(),
            next_link_id: AtomicU64::new(1),
        }
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().expect("mutex engine state poisoned")
    }

    // =========================================================================
    // CALLER SIDE
    // =========================================================================

    /// Block until this replica holds the critical section.
    ///
    /// Broadcasts a REQUEST stamped with the current clock, then waits until
    /// every live peer has ACKed it and it is the head of the queue. There is
    /// no timeout; progress after a peer crash relies on link-loss detection
    /// shrinking the membership.
    pub fn request_critical_section(&self) {
        let me = self.replica_id;
        let state = self.lock();
        let mut state = self
            .changed
            .wait_while(state, |s| s.phase != Phase::Idle)
            .expect("mutex engine state poisoned");

        state.phase = Phase::Requesting;
        state.acks.clear();

        let request = Message::request(me, state.clock.value());
        state.queue.insert(request.clone());
        state.outstanding = Some(request.clone());
        let sent = state.broadcast(&request);
        debug!(replica = me, timestamp = request.timestamp, peers = sent, "requested critical section");

        let mut state = self
            .changed
            .wait_while(state, |s| !s.may_enter(me))
            .expect("mutex engine state poisoned");

        state.phase = Phase::InCriticalSection;
        info!(
            replica = me,
            timestamp = request.timestamp,
            acks = state.acks.len(),
            clock = state.clock.value(),
            "entered critical section"
        );
    }

    /// Leave the critical section and publish `new_state` to every peer.
    ///
    /// A call while not holding the critical section is ignored.
    pub fn release_critical_section(&self, new_state: String) {
        let me = self.replica_id;
        let mut state = self.lock();
        if state.phase != Phase::InCriticalSection {
            warn!(replica = me, phase = ?state.phase, "release without holding the critical section, ignoring");
            return;
        }

        let release = Message::release(me, state.clock.value(), new_state);
        state.broadcast(&release);

        if state.queue.remove(me).is_none() {
            warn!(replica = me, "own request missing from queue at release");
        }
        state.outstanding = None;
        state.acks.clear();
        state.phase = Phase::Idle;
        info!(replica = me, clock = state.clock.value(), "released critical section");

        drop(state);
        self.changed.notify_all();
    }

    // =========================================================================
    // RECEIVE SIDE
    // =========================================================================

    /// Apply one message read from an established peer link.
    ///
    /// Safe to call concurrently from several reader threads; the engine
    /// lock serializes them.
    pub fn process_message(&self, msg: Message) {
        let me = self.replica_id;
        let mut state = self.lock();
        state.clock.observe(msg.timestamp);
        trace!(replica = me, from = msg.origin, kind = ?msg.kind, clock = state.clock.value(), "received");

        match msg.kind {
            MessageKind::Request => {
                if !state.peers.contains_key(&msg.origin) {
                    debug!(replica = me, from = msg.origin, "request from unlinked replica");
                }
                let origin = msg.origin;
                state.queue.insert(msg);
                let ack = Message::ack(me, state.clock.value());
                state.send(origin, ack);
            }
            MessageKind::Ack => {
                if state.is_current_ack(&msg) {
                    state.acks.insert(msg.origin);
                } else {
                    debug!(replica = me, from = msg.origin, timestamp = msg.timestamp, "stale ack, ignoring");
                }
            }
            MessageKind::Release => {
                if state.queue.remove(msg.origin).is_none() {
                    debug!(replica = me, from = msg.origin, "release without a queued request");
                }
                self.app.sync(&msg.payload);
            }
            MessageKind::JoinRequest | MessageKind::JoinResponse => {
                warn!(replica = me, from = msg.origin, kind = ?msg.kind, "handshake message on established link, ignoring");
            }
        }

        drop(state);
        self.changed.notify_all();
    }

    // =========================================================================
    // MEMBERSHIP
    // =========================================================================

    fn allocate_link_id(&self) -> LinkId {
        self.next_link_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register an already-handshaken link to `peer`.
    ///
    /// Returns `None` if the peer is this replica or is already linked.
    pub fn attach_peer(&self, peer: ReplicaId, tx: Sender<Message>) -> Option<LinkId> {
        let me = self.replica_id;
        let mut state = self.lock();
        if state.admission(me, peer, me) != Admission::New {
            return None;
        }
        let link_id = self.allocate_link_id();
        state.link(peer, link_id, tx, me);
        state.forward_outstanding(peer);
        info!(replica = me, peer, live_peers = state.peers.len(), "peer linked");

        drop(state);
        self.changed.notify_all();
        Some(link_id)
    }

    /// Build the first line of an outbound link.
    pub fn join_request(&self) -> Message {
        let state = self.lock();
        Message::join_request(self.replica_id, state.clock.value())
    }

    /// Count a message written outside of an established link.
    pub fn record_send(&self) {
        self.lock().clock.increment();
    }

    /// Acceptor side of the join handshake.
    ///
    /// Registers the joiner and queues its JOIN_RESPONSE (our live-peer
    /// count, including the joiner, and a snapshot of the application
    /// state) ahead of any other traffic on the link. Returns `None` when
    /// the link is refused.
    pub fn accept_join(&self, request: &Message, tx: Sender<Message>) -> Option<LinkId> {
        let peer = request.origin;
        let mut state = self.lock();
        let admission = state.admission(self.replica_id, peer, peer);
        if admission == Admission::Reject {
            return None;
        }
        state.clock.observe(request.timestamp);

        let link_id = self.allocate_link_id();
        state.link(peer, link_id, tx, peer);
        if admission == Admission::Replace {
            info!(replica = self.replica_id, peer, "crossed dial, keeping the peer's link");
        }

        let live = u32::try_from(state.peers.len()).unwrap_or(u32::MAX);
        let response = Message::join_response(
            self.replica_id,
            state.clock.value(),
            live,
            self.app.serialized_state(),
        );
        state.send(peer, response);
        state.forward_outstanding(peer);
        info!(replica = self.replica_id, peer, live_peers = live, "accepted join");

        drop(state);
        self.changed.notify_all();
        Some(link_id)
    }

    /// Joiner side of the handshake: adopt the responder's state and link it.
    ///
    /// Returns `None` when the peer is already linked through a link that
    /// wins over this one.
    pub fn complete_join(&self, response: &Message, tx: Sender<Message>) -> Option<LinkId> {
        let me = self.replica_id;
        let peer = response.origin;
        let mut state = self.lock();
        let admission = state.admission(me, peer, me);
        if admission == Admission::Reject {
            return None;
        }
        state.clock.observe(response.timestamp);
        self.app.sync(&response.payload);

        let link_id = self.allocate_link_id();
        state.link(peer, link_id, tx, me);
        if admission == Admission::Replace {
            info!(replica = me, peer, "crossed dial, keeping our link");
        }
        state.forward_outstanding(peer);
        info!(
            replica = self.replica_id,
            peer,
            responder_peers = ?response.replica_count,
            live_peers = state.peers.len(),
            "joined peer"
        );

        drop(state);
        self.changed.notify_all();
        Some(link_id)
    }

    /// Drop the link to `peer` if it is still incarnation `link_id`.
    ///
    /// The peer's pending request, if any, leaves the queue with it.
    pub fn detach_peer(&self, peer: ReplicaId, link_id: LinkId) -> bool {
        let mut state = self.lock();
        match state.peers.get(&peer) {
            Some(link) if link.link_id == link_id => {}
            _ => return false,
        }
        state.peers.remove(&peer);
        state.acks.remove(&peer);
        if state.queue.remove(peer).is_some() {
            debug!(replica = self.replica_id, peer, "purged request of lost peer");
        }
        info!(replica = self.replica_id, peer, live_peers = state.peers.len(), "peer lost");

        drop(state);
        self.changed.notify_all();
        true
    }

    /// Drop every link. Returns the peers that were linked.
    pub fn detach_all(&self) -> Vec<ReplicaId> {
        let mut state = self.lock();
        let peers: Vec<ReplicaId> = state.peers.drain().map(|(peer, _)| peer).collect();
        for peer in &peers {
            state.queue.remove(*peer);
            state.acks.remove(peer);
        }

        drop(state);
        self.changed.notify_all();
        peers
    }

    /// Block until at least `target` peers are linked.
    ///
    /// Returns false if `timeout` elapsed first.
    pub fn wait_for_peers(&self, target: usize, timeout: Option<Duration>) -> bool {
        let state = self.lock();
        match timeout {
            None => {
                let _state = self
                    .changed
                    .wait_while(state, |s| s.peers.len() < target)
                    .expect("mutex engine state poisoned");
                true
            }
            Some(timeout) => {
                let (_state, result) = self
                    .changed
                    .wait_timeout_while(state, timeout, |s| s.peers.len() < target)
                    .expect("mutex engine state poisoned");
                !result.timed_out()
            }
        }
    }

    // =========================================================================
    // INTROSPECTION
    // =========================================================================

    /// Number of linked peers (the ACK quorum).
    pub fn live_peers(&self) -> usize {
        self.lock().peers.len()
    }

    /// Cluster size as this replica sees it, including itself.
    pub fn n_servers(&self) -> usize {
        self.live_peers() + 1
    }

    pub fn is_linked(&self, peer: ReplicaId) -> bool {
        self.lock().peers.contains_key(&peer)
    }

    pub fn peer_ids(&self) -> Vec<ReplicaId> {
        let mut peers: Vec<ReplicaId> = self.lock().peers.keys().copied().collect();
        peers.sort_unstable();
        peers
    }

    pub fn clock(&self) -> Timestamp {
        self.lock().clock.value()
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    /// ACKs received in the current round.
    pub fn ack_count(&self) -> usize {
        self.lock().acks.len()
    }

    /// Head of the local request queue.
    pub fn queue_head(&self) -> Option<RequestKey> {
        self.lock().queue.peek_min().map(Message::key)
    }

    /// Number of pending requests in the local queue.
    pub fn pending_requests(&self) -> usize {
        self.lock().queue.len()
    }
}
