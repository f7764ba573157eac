//! Pending critical-section requests, ordered by (timestamp, replica id).
//!
//! Every replica keeps a copy of this queue. A replica may enter the
//! critical section only while its own request is the minimum entry.

use std::collections::{BTreeMap, HashMap};

use super::message::{Message, ReplicaId, RequestKey};

/// Priority queue of REQUEST messages, one entry per replica.
///
/// Not synchronized on its own; the engine mutates it under its state lock.
#[derive(Debug, Default)]
pub struct RequestQueue {
    /// Entries in request order.
    entries: BTreeMap<RequestKey, Message>,
    /// Current entry of each replica.
    by_origin: HashMap<ReplicaId, RequestKey>,
}

impl RequestQueue {
    pub fn new() -> Self {
        RequestQueue {
            entries: BTreeMap::new(),
            by_origin: HashMap::new(),
        }
    }

    /// Insert a request.
    ///
    /// A replica has at most one active entry: a newer request from the
    /// same origin replaces the old one.
    pub fn insert(&mut self, request: Message) {
        let key = request.key();
        if let Some(previous) = self.by_origin.insert(key.origin, key) {
            self.entries.remove(&previous);
        }
        self.entries.insert(key, request);
    }

    /// The request that currently holds the right to enter.
    pub fn peek_min(&self) -> Option<&Message> {
        self.entries.values().next()
    }

    /// Remove and return the minimum request.
    pub fn remove_min(&mut self) -> Option<Message> {
        let key = *self.entries.keys().next()?;
        self.by_origin.remove(&key.origin);
        self.entries.remove(&key)
    }

    /// Remove the entry of `origin`, wherever it sits in the order.
    pub fn remove(&mut self, origin: ReplicaId) -> Option<Message> {
        let key = self.by_origin.remove(&origin)?;
        self.entries.remove(&key)
    }

    /// Whether `origin` has a pending request.
    pub fn contains(&self, origin: ReplicaId) -> bool {
        self.by_origin.contains_key(&origin)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
