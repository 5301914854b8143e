//! Monotonic timers on a min-heap.
//!
//! Deadlines are absolute milliseconds on the caller's monotonic clock.
//! The heap never reads the clock itself; the owning loop passes `now`
//! into `expire`. Cancellation is lazy: heap entries carry a generation
//! and are skipped when the slot was cancelled or reused.
//!
//! `expire(now)` pops everything due in a single pass and returns the
//! payloads; timers armed by the caller while handling those payloads
//! are therefore never expired in the same pass.

use slab::Slab;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    slot: usize,
    generation: u64,
}

struct Entry<T> {
    generation: u64,
    payload: T,
}

pub struct Timers<T> {
    slots: Slab<Entry<T>>,
    heap: BinaryHeap<Reverse<(u64, usize, u64)>>, // (deadline, slot, generation)
    next_generation: u64,
}

impl<T> Default for Timers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Timers<T> {
    pub fn new() -> Timers<T> {
        Timers {
            slots: Slab::new(),
            heap: BinaryHeap::new(),
            next_generation: 0,
        }
    }

    /// Arm a timer at absolute deadline `deadline_ms`.
    pub fn add(&mut self, deadline_ms: u64, payload: T) -> TimerHandle {
        self.next_generation += 1;
        let generation = self.next_generation;
        let slot = self.slots.insert(Entry {
            generation,
            payload,
        });
        self.heap.push(Reverse((deadline_ms, slot, generation)));
        TimerHandle { slot, generation }
    }

    /// Cancel if still armed; harmless on an already-fired handle.
    pub fn cancel(&mut self, handle: TimerHandle) {
        if let Some(entry) = self.slots.get(handle.slot) {
            if entry.generation == handle.generation {
                self.slots.remove(handle.slot);
            }
        }
    }

    /// Deadline of the nearest armed timer, if any.
    pub fn next_deadline(&mut self) -> Option<u64> {
        while let Some(&Reverse((deadline, slot, generation))) = self.heap.peek() {
            match self.slots.get(slot) {
                Some(entry) if entry.generation == generation => return Some(deadline),
                _ => {
                    // Stale heap entry from a cancelled/reused slot.
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Pop every timer with `deadline <= now`, returning payloads in
    /// deadline order.
    pub fn expire(&mut self, now: u64) -> Vec<T> {
        let mut due = Vec::new();
        while let Some(&Reverse((deadline, slot, generation))) = self.heap.peek() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(entry) = self.slots.get(slot) {
                if entry.generation == generation {
                    due.push(self.slots.remove(slot).payload);
                }
            }
        }
        due
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
