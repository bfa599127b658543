//! Deadline-ordered queue behind the scheduler worker.
//!
//! The queue is a plain data structure driven by explicit clock readings, so its ordering
//! and retry behaviour can be tested without a thread.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace};

/// How long a sink that reported [`Delivery::Full`] is left alone before the next attempt.
pub const RETRY_DELAY: Duration = Duration::from_millis(1);

/// Result of handing one due item to its sink.
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery<T> {
    /// The sink took the item
    Delivered,
    /// The sink is full; the item is handed back for a later retry
    Full(T),
    /// The sink is gone; its items are dropped
    Gone,
}

/// Destination for due items.
///
/// Items sharing a sink [`key`](Deliver::key) are delivered in due order, even across
/// [`Delivery::Full`] retries.
pub trait Deliver<T>: Send + Sync {
    /// Identity of the sink. Equal keys mean the same destination.
    fn key(&self) -> u64;

    /// Tries to hand `item` over without blocking.
    fn deliver(&self, item: T) -> Delivery<T>;
}

struct Entry<T> {
    due: Instant,
    seq: u64,
    item: T,
    sink: Arc<dyn Deliver<T>>,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    // reversed: BinaryHeap is a max-heap
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Stalled<T> {
    retry_at: Instant,
    items: VecDeque<(T, Arc<dyn Deliver<T>>)>,
}

/// Min-deadline queue with per-sink back-pressure.
pub struct DelayQueue<T> {
    heap: BinaryHeap<Entry<T>>,
    stalled: HashMap<u64, Stalled<T>>,
    next_seq: u64,
}

impl<T> Default for DelayQueue<T> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            stalled: HashMap::new(),
            next_seq: 0,
        }
    }
}

impl<T> DelayQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `item` for delivery to `sink` at `due`.
    pub fn push(&mut self, due: Instant, item: T, sink: Arc<dyn Deliver<T>>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            due,
            seq,
            item,
            sink,
        });
    }

    /// Number of items not yet delivered.
    pub fn len(&self) -> usize {
        self.heap.len() + self.stalled.values().map(|s| s.items.len()).sum::<usize>()
    }

    /// True when nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest instant at which [`DelayQueue::fire`] has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let due = self.heap.peek().map(|entry| entry.due);
        let retry = self.stalled.values().map(|s| s.retry_at).min();
        match (due, retry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Delivers every item due at `now`, returning how many were delivered.
    pub fn fire(&mut self, now: Instant) -> usize {
        let mut delivered = self.retry_stalled(now);

        while self.heap.peek().is_some_and(|entry| entry.due <= now) {
            let Some(Entry { item, sink, .. }) = self.heap.pop() else {
                break;
            };
            let key = sink.key();
            if let Some(stalled) = self.stalled.get_mut(&key) {
                stalled.items.push_back((item, sink));
                continue;
            }
            match sink.deliver(item) {
                Delivery::Delivered => delivered += 1,
                Delivery::Full(item) => {
                    trace!("sink {} is full, retrying", key);
                    let mut items = VecDeque::new();
                    items.push_back((item, sink));
                    self.stalled.insert(
                        key,
                        Stalled {
                            retry_at: now + RETRY_DELAY,
                            items,
                        },
                    );
                }
                Delivery::Gone => debug!("sink {} is gone, dropping item", key),
            }
        }

        delivered
    }

    fn retry_stalled(&mut self, now: Instant) -> usize {
        let mut delivered = 0;
        self.stalled.retain(|key, stalled| {
            if stalled.retry_at > now {
                return true;
            }
            while let Some((item, sink)) = stalled.items.pop_front() {
                match sink.deliver(item) {
                    Delivery::Delivered => delivered += 1,
                    Delivery::Full(item) => {
                        stalled.items.push_front((item, sink));
                        stalled.retry_at = now + RETRY_DELAY;
                        return true;
                    }
                    Delivery::Gone => {
                        debug!(
                            "sink {} is gone, dropping {} items",
                            key,
                            stalled.items.len() + 1
                        );
                        return false;
                    }
                }
            }
            false
        });
        delivered
    }
}
