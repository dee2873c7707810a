//! A min-heap delay queue keyed by `next_attempt_time` (spec.md §9
//! redesign: "centralize retry scheduling in a min-heap delay queue"
//! rather than a per-entry sleeping task per retry).

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use chrono::Utc;
use logbeam_core::batch::DispatchItem;
use parking_lot::Mutex;

pub struct RetryQueue {
    heap: Mutex<BinaryHeap<Reverse<DispatchItem>>>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self { heap: Mutex::new(BinaryHeap::new()) }
    }

    pub fn push(&self, item: DispatchItem) {
        self.heap.lock().push(Reverse(item));
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    /// Pops every item whose `next_attempt_time` has passed, leaving
    /// not-yet-ready items in the heap.
    pub fn drain_ready(&self) -> Vec<DispatchItem> {
        let now = Utc::now();
        let mut heap = self.heap.lock();
        let mut ready = Vec::new();
        while let Some(Reverse(item)) = heap.peek() {
            if item.next_attempt_time > now {
                break;
            }
            if let Some(Reverse(item)) = heap.pop() {
                ready.push(item);
            }
        }
        ready
    }
}

impl Default for RetryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use logbeam_core::entry::SourceKind;
    use logbeam_core::LogEntry;

    fn item(delay_secs: i64) -> DispatchItem {
        let mut item = DispatchItem::new(LogEntry::new(SourceKind::File, "a", "x").unwrap(), "sink");
        item.next_attempt_time = Utc::now() + Duration::seconds(delay_secs);
        item
    }

    #[test]
    fn drain_ready_returns_only_elapsed_items() {
        let queue = RetryQueue::new();
        queue.push(item(-5));
        queue.push(item(60));
        let ready = queue.drain_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn items_drain_in_time_order() {
        let queue = RetryQueue::new();
        queue.push(item(-1));
        queue.push(item(-10));
        queue.push(item(-5));
        let ready = queue.drain_ready();
        assert_eq!(ready.len(), 3);
        for pair in ready.windows(2) {
            assert!(pair[0].next_attempt_time <= pair[1].next_attempt_time);
        }
    }
}
