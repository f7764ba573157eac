//! Lamport logical clock.

/// A scalar Lamport timestamp.
pub type Timestamp = u64;

/// Scalar Lamport clock.
///
/// Not synchronized: the engine keeps it behind its state lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogicalClock {
    value: Timestamp,
}

impl LogicalClock {
    /// Create a clock starting at `initial`.
    pub fn new(initial: Timestamp) -> Self {
        LogicalClock { value: initial }
    }

    /// Local event (a send).
    #[inline]
    pub fn increment(&mut self) {
        self.value = self.value.saturating_add(1);
    }

    /// Current value.
    #[inline]
    pub fn value(&self) -> Timestamp {
        self.value
    }

    /// Merge a remote timestamp on receive: `max(local, remote) + 1`.
    #[inline]
    pub fn observe(&mut self, remote: Timestamp) {
        self.value = self.value.max(remote).saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_and_observe() {
        let mut clock = LogicalClock::new(0);
        clock.increment();
        assert_eq!(clock.value(), 1);

        clock.observe(10);
        assert_eq!(clock.value(), 11);

        // An older remote stamp still advances the clock by one.
        clock.observe(3);
        assert_eq!(clock.value(), 12);
    }

    #[test]
    fn test_clock_never_decreases() {
        let mut clock = LogicalClock::new(7);
        let remotes = [0u64, 100, 5, 100, 99, 250, 1, 0, 251];

        let mut last = clock.value();
        for (i, remote) in remotes.iter().enumerate() {
            if i % 3 == 0 {
                clock.increment();
            } else {
                clock.observe(*remote);
            }
            assert!(clock.value() > last, "clock went from {} to {}", last, clock.value());
            last = clock.value();
        }
    }

    #[test]
    fn test_observe_saturates() {
        let mut clock = LogicalClock::new(u64::MAX - 1);
        clock.observe(u64::MAX);
        assert_eq!(clock.value(), u64::MAX);
        clock.increment();
        assert_eq!(clock.value(), u64::MAX);
    }
}
