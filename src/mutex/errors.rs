use std::io;
use std::net::SocketAddr;

use super::message::ReplicaId;

/// A peer line that could not be turned into a [`Message`](super::Message).
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("empty message line")]
    EmptyLine,

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid nServers value {0}")]
    BadReplicaCount(i64),

    #[error("JOIN_RESPONSE without a replica count")]
    MissingReplicaCount,
}

/// Failure of a single peer link: handshake or established stream.
///
/// None of these are fatal to the replica; the link is dropped and the
/// join loop (or the peer) tries again.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("peer closed the connection")]
    Closed,

    #[error("expected {expected}, peer sent {found}")]
    UnexpectedMessage {
        expected: &'static str,
        found: String,
    },

    #[error("replica {0} is already linked")]
    Duplicate(ReplicaId),

    #[error("replica id {0} is not part of the cluster")]
    UnknownReplica(ReplicaId),
}

/// Startup failures. These abort initialization.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("cannot bind peer listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("cannot resolve address of replica {replica} ({host}:{port})")]
    Resolve {
        replica: ReplicaId,
        host: String,
        port: u16,
    },

    #[error("replica {replica} has no address among the {listed} listed")]
    MissingAddress { replica: ReplicaId, listed: usize },

    #[error("failed to spawn {0} thread: {1}")]
    Spawn(&'static str, #[source] io::Error),
}
