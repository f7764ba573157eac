//! Lamport distributed mutual exclusion over a full TCP mesh.
//!
//! A replica that wants the critical section:
//! - Stamps a REQUEST with its logical clock, queues it locally and
//!   broadcasts it to every live peer
//! - Enters once every live peer has ACKed and its request heads the queue
//! - Broadcasts RELEASE with the new application state when done
//!
//! Replicas join the mesh through a JOIN_REQUEST/JOIN_RESPONSE handshake
//! that also hands the joiner the current application state.
//!
//! # Invariants
//!
//! 1. **Total Order**: requests compare by timestamp, then replica id.
//! 2. **Mutual Exclusion**: at most one replica is in the critical section.
//! 3. **Clock Discipline**: each send and each receive advances the clock
//!    exactly once.
//! 4. **Live Membership**: the ACK quorum is the set of currently linked
//!    peers, never the static cluster size.

pub mod clock;
pub mod engine;
pub mod errors;
pub mod lamport;
pub mod link;
pub mod message;
pub mod queue;
pub mod traits;

#[cfg(test)]
mod checker;

pub use clock::{LogicalClock, Timestamp};
pub use engine::{LinkId, MutexEngine, Phase};
pub use errors::{CodecError, InitError, LinkError};
pub use lamport::LamportMutex;
pub use link::{JoinMode, LinkManager};
pub use message::{Message, MessageKind, ReplicaId, RequestKey};
pub use queue::RequestQueue;
pub use traits::Application;
