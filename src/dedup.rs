//! Deduplicator (spec.md §4.H): an LRU+TTL fingerprint cache that drops
//! repeat entries seen within the TTL window.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use logbeam_core::LogEntry;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    first_seen: Instant,
    last_seen: Instant,
    hit_count: u64,
}

/// Intrusive doubly-linked LRU list over a slab, indexed by a hash map
/// from fingerprint to slab index. This avoids the O(n) "find & move"
/// which a plain `VecDeque` would need on every hit.
struct LruList {
    prev: Vec<usize>,
    next: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl LruList {
    fn with_capacity(cap: usize) -> Self {
        Self {
            prev: Vec::with_capacity(cap),
            next: Vec::with_capacity(cap),
            head: None,
            tail: None,
        }
    }

    fn push_new(&mut self) -> usize {
        let idx = self.prev.len();
        self.prev.push(usize::MAX);
        self.next.push(usize::MAX);
        self.push_front_existing(idx);
        idx
    }

    fn push_front_existing(&mut self, idx: usize) {
        self.prev[idx] = usize::MAX;
        self.next[idx] = self.head.unwrap_or(usize::MAX);
        if let Some(head) = self.head {
            self.prev[head] = idx;
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn unlink(&mut self, idx: usize) {
        let p = self.prev[idx];
        let n = self.next[idx];
        if p != usize::MAX {
            self.next[p] = n;
        } else {
            self.head = if n != usize::MAX { Some(n) } else { None };
        }
        if n != usize::MAX {
            self.prev[n] = p;
        } else {
            self.tail = if p != usize::MAX { Some(p) } else { None };
        }
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.push_front_existing(idx);
    }
}

pub struct Deduplicator {
    max_cache_size: usize,
    ttl: Duration,
    include_timestamp: bool,
    include_source_id: bool,
    index: HashMap<u64, usize>,
    keys: Vec<u64>,
    entries: Vec<CacheEntry>,
    free_slots: Vec<usize>,
    lru: LruList,
    pub hits: u64,
    pub misses: u64,
}

impl Deduplicator {
    pub fn new(max_cache_size: usize, ttl: Duration, include_timestamp: bool, include_source_id: bool) -> Self {
        Self {
            max_cache_size,
            ttl,
            include_timestamp,
            include_source_id,
            index: HashMap::new(),
            keys: Vec::new(),
            entries: Vec::new(),
            free_slots: Vec::new(),
            lru: LruList::with_capacity(max_cache_size.max(1)),
            hits: 0,
            misses: 0,
        }
    }

    fn fingerprint(&self, entry: &LogEntry) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        let mut hasher = DefaultHasher::new();
        entry.message.hash(&mut hasher);
        if self.include_source_id {
            entry.source_id.hash(&mut hasher);
        }
        if self.include_timestamp {
            // Truncate to the second so near-simultaneous duplicates still
            // collide, per spec.md's "optionally plus truncated timestamp".
            entry.event_timestamp.timestamp().hash(&mut hasher);
        }
        hasher.finish()
    }

    /// Returns `true` if this entry is a duplicate of one seen within the
    /// TTL window, incrementing its hit count and refreshing its LRU
    /// position. Otherwise inserts it fresh and returns `false`.
    pub fn is_duplicate(&mut self, entry: &LogEntry) -> bool {
        self.is_duplicate_at(entry, Instant::now())
    }

    fn is_duplicate_at(&mut self, entry: &LogEntry, now: Instant) -> bool {
        let key = self.fingerprint(entry);
        if let Some(&idx) = self.index.get(&key) {
            let e = &mut self.entries[idx];
            if now.duration_since(e.first_seen) < self.ttl {
                e.last_seen = now;
                e.hit_count += 1;
                self.lru.move_to_front(idx);
                self.hits += 1;
                return true;
            }
            // Expired: refresh in place as a fresh entry.
            e.first_seen = now;
            e.last_seen = now;
            e.hit_count = 0;
            self.lru.move_to_front(idx);
            self.misses += 1;
            return false;
        }

        self.misses += 1;
        self.insert(key, now);
        false
    }

    fn insert(&mut self, key: u64, now: Instant) {
        if self.index.len() >= self.max_cache_size {
            self.evict_lru();
        }
        let idx = if let Some(slot) = self.free_slots.pop() {
            self.keys[slot] = key;
            self.entries[slot] = CacheEntry {
                first_seen: now,
                last_seen: now,
                hit_count: 0,
            };
            self.lru.push_front_existing(slot);
            slot
        } else {
            self.keys.push(key);
            self.entries.push(CacheEntry {
                first_seen: now,
                last_seen: now,
                hit_count: 0,
            });
            self.lru.push_new()
        };
        self.index.insert(key, idx);
    }

    fn evict_lru(&mut self) {
        if let Some(tail) = self.lru.tail {
            let key = self.keys[tail];
            self.index.remove(&key);
            self.lru.unlink(tail);
            self.free_slots.push(tail);
        }
    }

    /// Removes TTL-expired entries and trims to capacity; intended to run
    /// on a periodic timer.
    pub fn cleanup(&mut self) {
        self.cleanup_at(Instant::now());
    }

    fn cleanup_at(&mut self, now: Instant) {
        let expired: Vec<usize> = self
            .index
            .values()
            .copied()
            .filter(|&idx| now.duration_since(self.entries[idx].last_seen) >= self.ttl)
            .collect();
        for idx in expired {
            let key = self.keys[idx];
            self.index.remove(&key);
            self.lru.unlink(idx);
            self.free_slots.push(idx);
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logbeam_core::entry::SourceKind;

    fn entry(source: &str, message: &str) -> LogEntry {
        LogEntry::new(SourceKind::File, source, message).unwrap()
    }

    #[test]
    fn second_identical_entry_within_ttl_is_duplicate() {
        let mut dedup = Deduplicator::new(100, Duration::from_secs(60), false, true);
        let e = entry("fileA", "same");
        assert!(!dedup.is_duplicate(&e));
        assert!(dedup.is_duplicate(&e));
        assert_eq!(dedup.hits, 1);
    }

    #[test]
    fn different_source_is_not_duplicate_when_include_source_id() {
        let mut dedup = Deduplicator::new(100, Duration::from_secs(60), false, true);
        assert!(!dedup.is_duplicate(&entry("fileA", "same")));
        assert!(!dedup.is_duplicate(&entry("fileB", "same")));
    }

    #[test]
    fn expired_after_ttl_is_not_duplicate() {
        let mut dedup = Deduplicator::new(100, Duration::from_millis(10), false, true);
        let e = entry("fileA", "same");
        let t0 = Instant::now();
        assert!(!dedup.is_duplicate_at(&e, t0));
        assert!(!dedup.is_duplicate_at(&e, t0 + Duration::from_millis(50)));
    }

    #[test]
    fn lru_eviction_respects_capacity() {
        let mut dedup = Deduplicator::new(2, Duration::from_secs(60), false, true);
        dedup.is_duplicate(&entry("a", "1"));
        dedup.is_duplicate(&entry("a", "2"));
        dedup.is_duplicate(&entry("a", "3")); // evicts "1"
        assert_eq!(dedup.len(), 2);
        assert!(!dedup.is_duplicate(&entry("a", "1")));
    }

    #[test]
    fn cleanup_removes_expired_entries() {
        let mut dedup = Deduplicator::new(100, Duration::from_millis(10), false, true);
        let t0 = Instant::now();
        dedup.is_duplicate_at(&entry("a", "1"), t0);
        assert_eq!(dedup.len(), 1);
        dedup.cleanup_at(t0 + Duration::from_millis(50));
        assert_eq!(dedup.len(), 0);
    }
}
