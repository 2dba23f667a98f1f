//! A single min-heap keyed by deadline, shared by the Sender's
//! retransmission timers and the Receiver's skip timers.
//!
//! `SPEC_FULL.md` §4.3/§4.4 choose this over one Tokio task per in-flight
//! sequence (the REDESIGN FLAGS option spec.md §9 explicitly allows): late
//! or cancelled entries are detected lazily by comparing the generation
//! counter carried alongside the key against the one the owning slot holds
//! at pop time, rather than by cancelling a task.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

#[derive(Debug)]
struct Entry<K> {
    deadline: Instant,
    key: K,
    generation: u64,
}

/// A deadline-ordered queue of `(key, generation)` pairs. Owns no timer
/// itself — the driver loop asks for [`TimerWheel::next_deadline`] and
/// sleeps until then, then calls [`TimerWheel::pop_due`] in a loop.
pub struct TimerWheel<K> {
    heap: BinaryHeap<Reverse<(Instant, u64, usize)>>,
    entries: Vec<Option<Entry<K>>>,
    free: Vec<usize>,
}

impl<K: Copy> TimerWheel<K> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            entries: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Schedule `key` (tagged with `generation`) to fire at `deadline`.
    pub fn schedule(&mut self, deadline: Instant, key: K, generation: u64) {
        let entry = Some(Entry {
            deadline,
            key,
            generation,
        });
        let slot = match self.free.pop() {
            Some(slot) => {
                self.entries[slot] = entry;
                slot
            }
            None => {
                self.entries.push(entry);
                self.entries.len() - 1
            }
        };
        self.heap.push(Reverse((deadline, generation, slot)));
    }

    /// Earliest deadline still pending, ignoring entries that have already
    /// been superseded (their slot was cleared or overwritten).
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.drop_stale();
        self.heap.peek().map(|Reverse((deadline, _, _))| *deadline)
    }

    /// Pop and return the earliest entry if its deadline is `<= now`.
    /// Returns `(key, generation)`; the caller must check the generation
    /// against its own slot state to decide whether this firing is live.
    pub fn pop_due(&mut self, now: Instant) -> Option<(K, u64)> {
        self.drop_stale();
        let Reverse((deadline, _, slot)) = *self.heap.peek()?;
        if deadline > now {
            return None;
        }
        self.heap.pop();
        let entry = self.entries[slot].take().expect("slot already consumed");
        self.free.push(slot);
        Some((entry.key, entry.generation))
    }

    fn drop_stale(&mut self) {
        while let Some(Reverse((_, _, slot))) = self.heap.peek() {
            if self.entries[*slot].is_none() {
                self.heap.pop();
            } else {
                break;
            }
        }
    }
}

impl<K: Copy> Default for TimerWheel<K> {
    fn default() -> Self {
        Self::new()
    }
}
