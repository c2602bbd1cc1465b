//! Threads currently inside a monitor.
//!
//! A doubly linked list kept in a slab, ordered by entry time. Adding and
//! removing are O(1); the oldest entry is always at the head. The list has
//! its own lock so tracking never waits on a monitor's aggregate lock.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use perfmon_types::current_timestamp_ms;

/// One thread inside a monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedThread {
    pub thread_name: String,
    pub started: Instant,
    /// Wall-clock entry time (ms since Unix epoch).
    pub started_ms: u64,
}

/// Handle returned by [`ThreadTracker::add`] and used to remove the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerToken {
    index: usize,
    generation: u64,
}

#[derive(Debug)]
struct Slot {
    entry: Option<TrackedThread>,
    prev: Option<usize>,
    next: Option<usize>,
    generation: u64,
}

#[derive(Debug, Default)]
struct List {
    slots: Vec<Slot>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl List {
    fn push_back(&mut self, entry: TrackedThread) -> TrackerToken {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    entry: None,
                    prev: None,
                    next: None,
                    generation: 0,
                });
                self.slots.len() - 1
            }
        };

        let tail = self.tail;
        let slot = &mut self.slots[index];
        slot.generation += 1;
        slot.entry = Some(entry);
        slot.prev = tail;
        slot.next = None;
        let generation = slot.generation;

        match tail {
            Some(t) => self.slots[t].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;

        TrackerToken { index, generation }
    }

    fn remove(&mut self, token: TrackerToken) -> Option<TrackedThread> {
        let slot = self.slots.get_mut(token.index)?;
        if slot.generation != token.generation || slot.entry.is_none() {
            return None;
        }
        let entry = slot.entry.take();
        let (prev, next) = (slot.prev.take(), slot.next.take());

        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }
        self.free.push(token.index);
        self.len -= 1;
        entry
    }

    fn iter(&self) -> impl Iterator<Item = &TrackedThread> {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let index = cursor?;
            let slot = &self.slots[index];
            cursor = slot.next;
            slot.entry.as_ref()
        })
    }
}

#[derive(Debug, Default)]
pub struct ThreadTracker {
    list: Mutex<List>,
}

impl ThreadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the calling thread entered the monitor.
    pub fn add_current(&self) -> TrackerToken {
        let name = std::thread::current()
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{:?}", std::thread::current().id()));
        self.add(name)
    }

    /// Record a thread entering. The entry time is taken under the lock so
    /// the list stays ordered by it.
    pub fn add(&self, thread_name: String) -> TrackerToken {
        let mut list = self.list.lock();
        list.push_back(TrackedThread {
            thread_name,
            started: Instant::now(),
            started_ms: current_timestamp_ms(),
        })
    }

    /// Remove an entry. Returns `false` for a token already removed.
    pub fn remove(&self, token: TrackerToken) -> bool {
        self.list.lock().remove(token).is_some()
    }

    pub fn len(&self) -> usize {
        self.list.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The entry that has been inside longest.
    pub fn oldest(&self) -> Option<TrackedThread> {
        self.list.lock().iter().next().cloned()
    }

    /// Number of entries inside for at least `age` as of `now`.
    pub fn count_older_than(&self, age: Duration, now: Instant) -> u64 {
        self.list
            .lock()
            .iter()
            .take_while(|t| now.saturating_duration_since(t.started) >= age)
            .count() as u64
    }

    /// All entries, oldest first.
    pub fn snapshot(&self) -> Vec<TrackedThread> {
        self.list.lock().iter().cloned().collect()
    }
}
