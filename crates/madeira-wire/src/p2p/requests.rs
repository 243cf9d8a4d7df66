// SPDX-License-Identifier: MIT

//! Sliding-window accounting for the data we asked one peer for. Only a
//! bounded number of getdata items ride the wire at once; the rest wait
//! in a queue and are sent as answers come back. Every in-flight item
//! carries a deadline base so the pool's stall sweep can catch a peer
//! that takes something and never delivers.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::hash::Hash;
use std::time::Duration;
use std::time::Instant;

#[derive(Debug)]
pub struct RequestTracker<K: Hash + Eq + Clone> {
    /// In-flight keys and their deadline base
    window: HashMap<K, Instant>,
    /// Accepted but not yet sent
    queue: VecDeque<K>,
    window_limit: usize,
    queue_limit: usize,
    /// Deadline spread between items of one batch
    stagger: Duration,
}

impl<K: Hash + Eq + Clone> RequestTracker<K> {
    pub fn new(window_limit: usize, queue_limit: usize, stagger: Duration) -> Self {
        RequestTracker {
            window: HashMap::new(),
            queue: VecDeque::new(),
            window_limit,
            queue_limit,
            stagger,
        }
    }

    /// Accept a key for request. Returns false when the peer already has
    /// more queued than it is ever going to answer.
    pub fn push(&mut self, key: K) -> bool {
        if self.contains(&key) {
            return true;
        }

        if self.queue.len() >= self.queue_limit {
            return false;
        }

        self.queue.push_back(key);
        true
    }

    /// Move queued keys into the window, up to its limit, and hand back
    /// the keys that should go out in a getdata right now. With
    /// `staggered` set, each key's deadline base advances by the stagger
    /// so a large batch doesn't time out as one block.
    pub fn fill(&mut self, staggered: bool) -> Vec<K> {
        let mut base = Instant::now();
        let mut out = Vec::new();

        while self.window.len() < self.window_limit {
            let Some(key) = self.queue.pop_front() else {
                break;
            };

            self.window.insert(key.clone(), base);
            out.push(key);

            if staggered {
                base += self.stagger;
            }
        }

        out
    }

    /// Register a key as already on the wire, bypassing the queue and
    /// the window limit. Used for data a peer pushes at us unasked in
    /// high-bandwidth mode.
    pub fn push_in_flight(&mut self, key: K) {
        if !self.contains(&key) {
            self.window.insert(key, Instant::now());
        }
    }

    /// Mark a key as answered (or notfound). Returns false if we never
    /// asked for it.
    pub fn resolve(&mut self, key: &K) -> bool {
        if self.window.remove(key).is_some() {
            return true;
        }

        if let Some(pos) = self.queue.iter().position(|k| k == key) {
            self.queue.remove(pos);
            return true;
        }

        false
    }

    pub fn contains(&self, key: &K) -> bool {
        self.window.contains_key(key) || self.queue.contains(key)
    }

    /// Whether any in-flight key has been outstanding longer than
    /// `timeout` past its deadline base.
    pub fn stalled(&self, timeout: Duration) -> bool {
        let now = Instant::now();

        self.window
            .values()
            .any(|deadline| now > *deadline + timeout)
    }

    /// Every key we track, in no particular order. Used when the peer
    /// dies and the pool-wide sets need cleaning.
    pub fn drain(&mut self) -> Vec<K> {
        let mut keys: Vec<K> = self.window.drain().map(|(k, _)| k).collect();
        keys.extend(self.queue.drain(..));
        keys
    }

    pub fn len(&self) -> usize {
        self.window.len() + self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty() && self.queue.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.window.len()
    }
}
