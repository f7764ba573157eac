/// Shared state guarded by the distributed mutex.
///
/// The mutex never looks inside the state: it only moves the serialized
/// form between replicas. Implementations must be cheap to call from the
/// peer reader threads, and must not call back into the mutex.
pub trait Application: Send + Sync + 'static {
    /// Snapshot of the current state. Sent to replicas that join.
    fn serialized_state(&self) -> String;

    /// Replace the local state with `state`.
    ///
    /// Called when a peer releases the critical section and when a join
    /// handshake completes.
    fn sync(&self, state: &str);
}
