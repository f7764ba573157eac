//! Critical-section history and mutual-exclusion checker.
//!
//! Test threads record every entry into and exit from the critical
//! section; the checker then verifies:
//! - No Overlap: no two recorded holds intersect in time
//! - Completeness: every entry has a matching exit

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use super::message::ReplicaId;

/// One hold of the critical section.
#[derive(Debug, Clone)]
pub struct Hold {
    pub replica: ReplicaId,
    pub entered: Instant,
    pub exited: Option<Instant>,
}

/// A mutual-exclusion violation found by the checker.
#[derive(Debug, Clone)]
pub enum Violation {
    /// Two replicas were inside at the same time.
    Overlap { first: ReplicaId, second: ReplicaId },
    /// A hold was never closed.
    Unfinished { replica: ReplicaId },
}

#[derive(Debug, Default)]
struct Inner {
    holds: Vec<Hold>,
    /// Concurrent holders observed at any entry beyond the first.
    max_occupancy: usize,
}

/// Thread-safe recorder of critical-section holds.
#[derive(Debug, Clone, Default)]
pub struct CsHistory {
    inner: Arc<Mutex<Inner>>,
    occupancy: Arc<AtomicUsize>,
}

impl CsHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record entry right after `request_critical_section` returns.
    ///
    /// Returns the index to pass to [`CsHistory::exit`].
    pub fn enter(&self, replica: ReplicaId) -> usize {
        let holders = self.occupancy.fetch_add(1, Ordering::SeqCst) + 1;
        let mut inner = self.inner.lock().unwrap();
        inner.max_occupancy = inner.max_occupancy.max(holders);
        inner.holds.push(Hold {
            replica,
            entered: Instant::now(),
            exited: None,
        });
        inner.holds.len() - 1
    }

    /// Record exit right before `release_critical_section` is called.
    pub fn exit(&self, hold: usize) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.holds[hold].exited = Some(Instant::now());
        }
        self.occupancy.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().holds.len()
    }

    /// Number of holds per replica, indexed by id.
    pub fn holds_per_replica(&self, n: usize) -> Vec<usize> {
        let mut counts = vec![0; n];
        for hold in &self.inner.lock().unwrap().holds {
            counts[hold.replica as usize] += 1;
        }
        counts
    }

    /// Verify the recorded history.
    pub fn check(&self) -> Result<(), Violation> {
        let inner = self.inner.lock().unwrap();

        let mut holds = inner.holds.clone();
        holds.sort_by_key(|h| h.entered);

        for hold in &holds {
            if hold.exited.is_none() {
                return Err(Violation::Unfinished { replica: hold.replica });
            }
        }
        for pair in holds.windows(2) {
            let (first, second) = (&pair[0], &pair[1]);
            if first.exited.map_or(true, |exit| exit > second.entered) {
                return Err(Violation::Overlap {
                    first: first.replica,
                    second: second.replica,
                });
            }
        }
        if inner.max_occupancy > 1 {
            let first = holds.first().map(|h| h.replica).unwrap_or_default();
            return Err(Violation::Overlap { first, second: first });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_sequential_holds_pass() {
        let history = CsHistory::new();
        for replica in 0..3 {
            let hold = history.enter(replica);
            thread::sleep(Duration::from_millis(1));
            history.exit(hold);
        }
        assert!(history.check().is_ok());
        assert_eq!(history.holds_per_replica(3), vec![1, 1, 1]);
    }

    #[test]
    fn test_overlap_detected() {
        let history = CsHistory::new();
        let a = history.enter(0);
        let b = history.enter(1);
        history.exit(a);
        history.exit(b);
        assert!(matches!(history.check(), Err(Violation::Overlap { .. })));
    }

    #[test]
    fn test_unfinished_detected() {
        let history = CsHistory::new();
        history.enter(2);
        assert!(matches!(
            history.check(),
            Err(Violation::Unfinished { replica: 2 })
        ));
    }
}
