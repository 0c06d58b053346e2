use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::GridPos;

/// Who receives an effect, resolved against the source's neighbourhood when applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Target {
    /// The person who scheduled the effect.
    SelfTarget,
    /// One neighbour satisfying the condition, picked uniformly.
    RandomNeighbor,
    /// Every neighbour satisfying the condition.
    AllNeighbors,
}

/// A deferred command scheduled by one person, applied by the cluster once its
/// clock reaches `timestamp`.
#[derive(Debug, Clone, Serialize)]
pub struct Effect<C, K> {
    pub timestamp: DateTime<Utc>,
    pub source: GridPos,
    pub target: Target,
    pub condition: Option<K>,
    pub command: C,
    /// Insertion sequence; breaks timestamp ties in FIFO order.
    seq: u64,
}

// Ordered by (timestamp, seq) only; the payload never takes part.
impl<C, K> PartialEq for Effect<C, K> {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp && self.seq == other.seq
    }
}

impl<C, K> Eq for Effect<C, K> {}

impl<C, K> PartialOrd for Effect<C, K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<C, K> Ord for Effect<C, K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp.cmp(&other.timestamp).then(self.seq.cmp(&other.seq))
    }
}

/// Per-cluster priority queue of pending effects.
#[derive(Debug)]
pub struct EffectQueue<C, K> {
    heap: BinaryHeap<Reverse<Effect<C, K>>>,
    next_seq: u64,
}

impl<C, K> Default for EffectQueue<C, K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C, K> EffectQueue<C, K> {
    pub fn new() -> Self {
        EffectQueue { heap: BinaryHeap::new(), next_seq: 0 }
    }

    pub fn schedule(
        &mut self,
        timestamp: DateTime<Utc>,
        source: GridPos,
        target: Target,
        condition: Option<K>,
        command: C,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Effect { timestamp, source, target, condition, command, seq }));
    }

    /// Remove and return the earliest effect if it is due at or before `until`.
    pub fn pop_due(&mut self, until: DateTime<Utc>) -> Option<Effect<C, K>> {
        match self.heap.peek() {
            Some(Reverse(e)) if e.timestamp <= until => self.heap.pop().map(|Reverse(e)| e),
            _ => None,
        }
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.heap.peek().map(|Reverse(e)| e.timestamp)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Total number of effects ever scheduled on this queue.
    pub fn scheduled(&self) -> u64 {
        self.next_seq
    }
}
