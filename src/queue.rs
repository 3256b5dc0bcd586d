use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;

use ordered_float::OrderedFloat;
use serde::Serialize;

use crate::{Event, EventKind};

/// Entry stored in the queue. Ordered by timestamp, then priority, then
/// insertion sequence, so that equal keys dequeue in insertion order.
#[derive(Debug)]
struct QueueEntry {
    key: Reverse<(OrderedFloat<f64>, i32, u64)>,
    event: Event,
}

impl QueueEntry {
    fn new(event: Event, seq: u64) -> Self {
        Self {
            key: Reverse((OrderedFloat(event.timestamp), event.priority, seq)),
            event,
        }
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

#[derive(Debug, Default)]
struct Inner {
    heap: BinaryHeap<QueueEntry>,
    next_seq: u64,
}

/// Time-ordered priority queue of simulation events.
///
/// The queue is internally synchronized: producers may enqueue concurrently
/// while the dispatch worker dequeues. None of the operations fail; dequeuing
/// from an empty queue returns `None`.
#[derive(Debug, Default)]
pub struct EventQueue {
    inner: Mutex<Inner>,
}

/// Snapshot of queue statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    /// Number of pending events.
    pub size: usize,
    /// Timestamp of the next event, or `None` when empty.
    pub next_event_time: Option<f64>,
    /// Pending event counts per event kind.
    pub kind_counts: HashMap<EventKind, usize>,
    /// Pending event counts per target component.
    pub component_counts: HashMap<String, usize>,
}

impl EventQueue {
    /// Constructs an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an event to the queue.
    pub fn enqueue(&self, event: Event) {
        let mut inner = self.inner.lock().expect("event queue lock poisoned");
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(QueueEntry::new(event, seq));
    }

    /// Removes and returns the event with the lowest (timestamp, priority)
    /// key, or `None` if the queue is empty.
    pub fn dequeue(&self) -> Option<Event> {
        let mut inner = self.inner.lock().expect("event queue lock poisoned");
        inner.heap.pop().map(|entry| entry.event)
    }

    /// Returns a copy of the next event without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<Event> {
        let inner = self.inner.lock().expect("event queue lock poisoned");
        inner.heap.peek().map(|entry| entry.event.clone())
    }

    /// Number of pending events.
    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("event queue lock poisoned");
        inner.heap.len()
    }

    /// Returns `true` if no events are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes all pending events.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("event queue lock poisoned");
        inner.heap.clear();
    }

    /// Timestamp of the next event, or `-1.0` when the queue is empty.
    #[must_use]
    pub fn next_event_time(&self) -> f64 {
        let inner = self.inner.lock().expect("event queue lock poisoned");
        inner
            .heap
            .peek()
            .map_or(-1.0, |entry| entry.event.timestamp)
    }

    /// Removes every event targeted at `component_id`, returning how many
    /// were removed. The heap is rebuilt after the filter.
    pub fn remove_for_component(&self, component_id: &str) -> usize {
        let mut inner = self.inner.lock().expect("event queue lock poisoned");
        let before = inner.heap.len();
        let retained: BinaryHeap<_> = inner
            .heap
            .drain()
            .filter(|entry| entry.event.component_id != component_id)
            .collect();
        inner.heap = retained;
        before - inner.heap.len()
    }

    /// Returns copies of all pending events targeted at `component_id`.
    #[must_use]
    pub fn events_for_component(&self, component_id: &str) -> Vec<Event> {
        self.scan(|event| event.component_id == component_id)
    }

    /// Returns copies of all pending events of the given kind.
    #[must_use]
    pub fn events_by_kind(&self, kind: EventKind) -> Vec<Event> {
        self.scan(|event| event.kind == kind)
    }

    /// Returns copies of all pending events with `start <= timestamp <= end`.
    #[must_use]
    pub fn events_in_range(&self, start: f64, end: f64) -> Vec<Event> {
        self.scan(|event| event.timestamp >= start && event.timestamp <= end)
    }

    fn scan<F: Fn(&Event) -> bool>(&self, predicate: F) -> Vec<Event> {
        let inner = self.inner.lock().expect("event queue lock poisoned");
        inner
            .heap
            .iter()
            .filter(|entry| predicate(&entry.event))
            .map(|entry| entry.event.clone())
            .collect()
    }

    /// Produces a snapshot of the queue statistics.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().expect("event queue lock poisoned");
        let mut stats = QueueStats {
            size: inner.heap.len(),
            next_event_time: inner.heap.peek().map(|entry| entry.event.timestamp),
            ..QueueStats::default()
        };
        for entry in &inner.heap {
            *stats.kind_counts.entry(entry.event.kind).or_default() += 1;
            *stats
                .component_counts
                .entry(entry.event.component_id.clone())
                .or_default() += 1;
        }
        stats
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn arrival(id: &str, timestamp: f64, priority: i32) -> Event {
        Event::new(id, timestamp, EventKind::RequestArrival, "svc").with_priority(priority)
    }

    #[test]
    fn test_dequeue_orders_by_timestamp() {
        let queue = EventQueue::new();
        queue.enqueue(arrival("b", 2.0, 0));
        queue.enqueue(arrival("a", 1.0, 0));
        queue.enqueue(arrival("c", 3.0, 0));
        let ids: Vec<_> = std::iter::from_fn(|| queue.dequeue())
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn test_equal_timestamps_order_by_priority_then_insertion() {
        let queue = EventQueue::new();
        queue.enqueue(arrival("first-low", 1.0, 1));
        queue.enqueue(arrival("high", 1.0, 0));
        queue.enqueue(arrival("second-low", 1.0, 1));
        let ids: Vec<_> = std::iter::from_fn(|| queue.dequeue())
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, ["high", "first-low", "second-low"]);
    }

    #[test]
    fn test_peek_matches_minimum() {
        let queue = EventQueue::new();
        assert!(queue.peek().is_none());
        queue.enqueue(arrival("b", 5.0, 0));
        queue.enqueue(arrival("a", 4.0, 0));
        assert_eq!(queue.peek().unwrap().id, "a");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_dequeue_empty_returns_none() {
        let queue = EventQueue::new();
        assert!(queue.dequeue().is_none());
        assert_eq!(queue.next_event_time(), -1.0);
    }

    #[test]
    fn test_remove_for_component() {
        let queue = EventQueue::new();
        queue.enqueue(arrival("a", 1.0, 0));
        queue.enqueue(Event::new("x", 2.0, EventKind::DatabaseRead, "db"));
        queue.enqueue(arrival("b", 3.0, 0));
        assert_eq!(queue.remove_for_component("svc"), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dequeue().unwrap().id, "x");
    }

    #[test]
    fn test_ordering_survives_removal() {
        let queue = EventQueue::new();
        queue.enqueue(arrival("a", 1.0, 0));
        queue.enqueue(Event::new("x", 1.5, EventKind::DatabaseRead, "db"));
        queue.enqueue(arrival("b", 2.0, 0));
        queue.enqueue(arrival("c", 2.0, 1));
        queue.remove_for_component("db");
        let ids: Vec<_> = std::iter::from_fn(|| queue.dequeue())
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn test_diagnostic_scans() {
        let queue = EventQueue::new();
        queue.enqueue(arrival("a", 1.0, 0));
        queue.enqueue(Event::new("x", 2.0, EventKind::DatabaseRead, "db"));
        queue.enqueue(arrival("b", 3.0, 0));
        assert_eq!(queue.events_for_component("svc").len(), 2);
        assert_eq!(queue.events_by_kind(EventKind::DatabaseRead).len(), 1);
        assert_eq!(queue.events_in_range(1.5, 3.0).len(), 2);
    }

    #[test]
    fn test_stats() {
        let queue = EventQueue::new();
        queue.enqueue(arrival("a", 1.0, 0));
        queue.enqueue(arrival("b", 2.0, 0));
        queue.enqueue(Event::new("x", 0.5, EventKind::DatabaseRead, "db"));
        let stats = queue.stats();
        assert_eq!(stats.size, 3);
        assert_eq!(stats.next_event_time, Some(0.5));
        assert_eq!(stats.kind_counts[&EventKind::RequestArrival], 2);
        assert_eq!(stats.component_counts["db"], 1);
    }
}
