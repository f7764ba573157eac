use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use tracing::info;

use crate::config::{ClusterConfig, MutexConfig};

use super::engine::{MutexEngine, Phase};
use super::errors::InitError;
use super::link::{JoinMode, LinkManager};
use super::message::ReplicaId;
use super::traits::Application;

/// A replica's handle on the cluster-wide critical section.
///
/// Owns the engine and the TCP links. Dropping it closes every link, which
/// the other replicas see as this replica crashing.
pub struct LamportMutex {
    engine: Arc<MutexEngine>,
    links: Arc<LinkManager>,
}

impl LamportMutex {
    /// Bind the peer listener and run the join protocol.
    ///
    /// Blocks until the replica is linked to as many peers as `mode`
    /// requires. Only a failure to bind or resolve is an error.
    pub fn start(
        cluster: &ClusterConfig,
        settings: MutexConfig,
        app: Arc<dyn Application>,
        mode: JoinMode,
    ) -> Result<Self, InitError> {
        let mutex = Self::listen(cluster, settings, app)?;
        mutex.join(mode);
        Ok(mutex)
    }

    /// First half of [`LamportMutex::start`]: accept inbound links only.
    pub fn listen(
        cluster: &ClusterConfig,
        settings: MutexConfig,
        app: Arc<dyn Application>,
    ) -> Result<Self, InitError> {
        let peer_addrs = resolve_peers(cluster)?;
        let engine = Arc::new(MutexEngine::new(
            cluster.replica_id,
            app,
            settings.initial_clock,
        ));
        let links = LinkManager::listen(Arc::clone(&engine), peer_addrs, settings)?;
        Ok(LamportMutex { engine, links })
    }

    /// Second half of [`LamportMutex::start`]. Returns the peer count reached.
    pub fn join(&self, mode: JoinMode) -> usize {
        info!(replica = self.replica_id(), ?mode, "joining cluster");
        let target = self.links.join_cluster(mode);
        info!(
            replica = self.replica_id(),
            live_peers = self.engine.live_peers(),
            target,
            "cluster joined"
        );
        target
    }

    /// Block until this replica holds the critical section.
    pub fn request_critical_section(&self) {
        self.engine.request_critical_section();
    }

    /// Leave the critical section, publishing `new_state` to every peer.
    pub fn release_critical_section(&self, new_state: String) {
        self.engine.release_critical_section(new_state);
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.engine.replica_id()
    }

    pub fn live_peers(&self) -> usize {
        self.engine.live_peers()
    }

    pub fn phase(&self) -> Phase {
        self.engine.phase()
    }

    pub fn engine(&self) -> &Arc<MutexEngine> {
        &self.engine
    }

    /// Address the peer listener is bound to.
    pub fn peer_addr(&self) -> SocketAddr {
        self.links.local_addr()
    }

    /// Close the listener and drop every link.
    pub fn shutdown(&self) {
        self.links.shutdown();
    }
}

impl Drop for LamportMutex {
    fn drop(&mut self) {
        self.links.shutdown();
    }
}

/// Peer-listener address of every replica. Prefers IPv4, which is what
/// the default listener binds.
fn resolve_peers(cluster: &ClusterConfig) -> Result<Vec<SocketAddr>, InitError> {
    cluster
        .replicas
        .iter()
        .enumerate()
        .map(|(id, replica)| {
            let unresolved = || InitError::Resolve {
                replica: id as ReplicaId,
                host: replica.host.clone(),
                port: replica.peer_port(),
            };
            let addrs: Vec<SocketAddr> = (replica.host.as_str(), replica.peer_port())
                .to_socket_addrs()
                .map_err(|_| unresolved())?
                .collect();
            addrs
                .iter()
                .find(|addr| addr.is_ipv4())
                .or_else(|| addrs.first())
                .copied()
                .ok_or_else(unresolved)
        })
        .collect()
}
