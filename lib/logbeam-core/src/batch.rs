use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::entry::LogEntry;

/// A single queued entry awaiting delivery, carrying the retry bookkeeping
/// the dispatcher's delay queue needs (spec.md §4.L, "a delay queue
/// (min-heap keyed by `next_attempt_time`)").
#[derive(Debug, Clone)]
pub struct DispatchItem {
    pub entry: LogEntry,
    pub sink_target: String,
    pub attempt_count: u32,
    pub next_attempt_time: DateTime<Utc>,
    pub original_enqueue_time: DateTime<Utc>,
}

impl DispatchItem {
    pub fn new(entry: LogEntry, sink_target: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            entry,
            sink_target: sink_target.into(),
            attempt_count: 0,
            next_attempt_time: now,
            original_enqueue_time: now,
        }
    }
}

// Ordered by `next_attempt_time` so `DispatchItem` can sit directly in a
// `BinaryHeap`-backed min-heap (wrapped in `Reverse` by the caller).
impl PartialEq for DispatchItem {
    fn eq(&self, other: &Self) -> bool {
        self.next_attempt_time == other.next_attempt_time
    }
}
impl Eq for DispatchItem {}
impl PartialOrd for DispatchItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DispatchItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.next_attempt_time.cmp(&other.next_attempt_time)
    }
}

/// An ordered batch of entries owned by exactly one worker at a time,
/// headed to a single sink target.
#[derive(Debug, Clone)]
pub struct Batch {
    pub batch_id: Uuid,
    pub sink_target: String,
    pub entries: Vec<LogEntry>,
    pub first_attempt_time: Option<DateTime<Utc>>,
    pub attempt_count: u32,
}

impl Batch {
    pub fn new(sink_target: impl Into<String>, entries: Vec<LogEntry>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            sink_target: sink_target.into(),
            entries,
            first_attempt_time: None,
            attempt_count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records that a send attempt is beginning; sets `first_attempt_time`
    /// on the very first try.
    pub fn record_attempt(&mut self) {
        if self.first_attempt_time.is_none() {
            self.first_attempt_time = Some(Utc::now());
        }
        self.attempt_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::SourceKind;
    use std::cmp::Reverse;
    use std::collections::BinaryHeap;

    fn item_at(secs: i64) -> DispatchItem {
        let mut item = DispatchItem::new(LogEntry::new(SourceKind::File, "a", "x").unwrap(), "sink");
        item.next_attempt_time = Utc::now() + chrono::Duration::seconds(secs);
        item
    }

    #[test]
    fn min_heap_orders_by_next_attempt_time() {
        let mut heap = BinaryHeap::new();
        heap.push(Reverse(item_at(30)));
        heap.push(Reverse(item_at(5)));
        heap.push(Reverse(item_at(10)));
        let Reverse(first) = heap.pop().unwrap();
        assert!(first.next_attempt_time < Utc::now() + chrono::Duration::seconds(20));
    }

    #[test]
    fn batch_records_first_attempt_time_once() {
        let mut batch = Batch::new("loki", vec![]);
        batch.record_attempt();
        let first = batch.first_attempt_time;
        batch.record_attempt();
        assert_eq!(batch.first_attempt_time, first);
        assert_eq!(batch.attempt_count, 2);
    }
}
