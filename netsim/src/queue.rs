//! Time-ordered delivery schedule.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use tokio::time::Instant;
use voip_bench_common::RtpPacket;

/// One pending delivery of a packet.
#[derive(Debug, Clone)]
pub struct ScheduledDelivery {
    // ---
    pub packet: RtpPacket,

    /// When the packet should reach the far end
    pub deliver_at: Instant,

    /// When the packet entered the simulator
    pub submitted_at: Instant,

    pub is_duplicate: bool,

    /// Payload gets mangled at delivery time
    pub is_corrupted: bool,
}

#[derive(Debug)]
struct Entry {
    order: u64,
    delivery: ScheduledDelivery,
}

impl Entry {
    fn key(&self) -> (Instant, u64) {
        (self.delivery.deliver_at, self.order)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Min-heap of deliveries keyed by deadline.
///
/// Entries with equal deadlines come out in insertion order, so a zero-
/// delay link never reorders on its own.
#[derive(Debug, Default)]
pub struct DeliveryQueue {
    // ---
    heap: BinaryHeap<Reverse<Entry>>,
    next_order: u64,
}

impl DeliveryQueue {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delivery: ScheduledDelivery) {
        // ---
        let order = self.next_order;
        self.next_order = self.next_order.wrapping_add(1);
        self.heap.push(Reverse(Entry { order, delivery }));
    }

    /// Earliest-deadline entry without removing it.
    pub fn peek_min(&self) -> Option<&ScheduledDelivery> {
        self.heap.peek().map(|Reverse(e)| &e.delivery)
    }

    pub fn pop_min(&mut self) -> Option<ScheduledDelivery> {
        self.heap.pop().map(|Reverse(e)| e.delivery)
    }

    /// Removes the earliest entry only if its deadline is at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<ScheduledDelivery> {
        // ---
        match self.peek_min() {
            Some(d) if d.deliver_at <= now => self.pop_min(),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Discards every pending delivery, returning how many were dropped.
    pub fn clear(&mut self) -> usize {
        // ---
        let n = self.heap.len();
        self.heap.clear();
        n
    }
}
