//! Dead-letter queue (spec.md §4.C): durable holding area for entries that
//! exhausted delivery retries, with a background reprocess loop driven by
//! exponential backoff with jitter.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use logbeam_core::LogEntry;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::disk_buffer::{DiskBuffer, DiskBufferConfig, DiskBufferError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub entry: LogEntry,
    pub sink_name: String,
    pub failure_reason: String,
    pub enqueued_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub next_retry_at: DateTime<Utc>,
}

pub struct DlqConfig {
    pub directory: PathBuf,
    pub max_file_size: u64,
    pub max_total_size: u64,
    pub retention_period: Duration,
    pub max_recovery_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub max_pending_in_memory: usize,
}

/// Outcome of `DeadLetterQueue::add`, letting the caller decide whether to
/// drop or block when the in-memory pending index is full, per spec.md
/// §4.C: "AddEntry... always returns success unless the DLQ is disabled or
/// its in-memory queue is full (then caller decides drop or block)."
#[derive(Debug, PartialEq, Eq)]
pub enum AddOutcome {
    Written,
    Disabled,
    PendingFull,
}

pub struct DeadLetterQueue {
    disk: DiskBuffer,
    pending: Vec<DlqEntry>,
    config: DlqConfig,
    enabled: bool,
}

impl DeadLetterQueue {
    pub fn open(config: DlqConfig, enabled: bool) -> Result<Self, DiskBufferError> {
        let disk = DiskBuffer::open(DiskBufferConfig {
            directory: config.directory.clone(),
            max_file_size: config.max_file_size,
            max_total_size: config.max_total_size,
            retention_period: config.retention_period,
        })?;
        Ok(Self {
            disk,
            pending: Vec::new(),
            config,
            enabled,
        })
    }

    pub fn add(&mut self, entry: LogEntry, sink_name: &str, reason: &str, attempt_count: u32) -> AddOutcome {
        if !self.enabled {
            return AddOutcome::Disabled;
        }
        if self.pending.len() >= self.config.max_pending_in_memory {
            return AddOutcome::PendingFull;
        }
        let dlq_entry = DlqEntry {
            entry,
            sink_name: sink_name.to_string(),
            failure_reason: reason.to_string(),
            enqueued_at: Utc::now(),
            attempt_count,
            next_retry_at: Utc::now(),
        };
        if let Ok(payload) = serde_json::to_vec(&dlq_entry) {
            if let Err(e) = self.disk.append(&payload) {
                warn!(error = %e, "failed to persist DLQ record to disk");
            }
        }
        self.pending.push(dlq_entry);
        AddOutcome::Written
    }

    /// Loads every record written to disk across process restarts into the
    /// in-memory pending index; call once at startup.
    pub fn recover(&mut self) -> Result<usize, DiskBufferError> {
        let records = DiskBuffer::recover(&self.config.directory)?;
        let mut loaded = 0;
        for payload in records {
            if let Ok(entry) = serde_json::from_slice::<DlqEntry>(&payload) {
                self.pending.push(entry);
                loaded += 1;
            }
        }
        info!(loaded, "recovered DLQ entries from disk");
        Ok(loaded)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Runs one pass of the reprocess loop: for every pending entry whose
    /// `next_retry_at` has elapsed, invokes `reprocess`. On success the
    /// entry is removed; on failure its `attempt_count` is incremented and
    /// `next_retry_at` is rescheduled via backoff-with-jitter. Entries past
    /// `max_recovery_attempts` are tombstoned (dropped, counted).
    pub fn reprocess_once<F>(&mut self, mut reprocess: F) -> ReprocessStats
    where
        F: FnMut(&LogEntry) -> bool,
    {
        let now = Utc::now();
        let mut stats = ReprocessStats::default();
        let mut still_pending = Vec::with_capacity(self.pending.len());

        for mut item in self.pending.drain(..) {
            if item.next_retry_at > now {
                still_pending.push(item);
                continue;
            }
            if reprocess(&item.entry) {
                stats.succeeded += 1;
                continue;
            }
            item.attempt_count += 1;
            if item.attempt_count >= self.config.max_recovery_attempts {
                stats.tombstoned += 1;
                continue;
            }
            item.next_retry_at = now + backoff_with_jitter(
                self.config.backoff_base,
                self.config.backoff_max,
                item.attempt_count,
            );
            stats.rescheduled += 1;
            still_pending.push(item);
        }

        self.pending = still_pending;
        stats
    }

    pub fn cleanup(&self) -> std::io::Result<u64> {
        self.disk.cleanup()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReprocessStats {
    pub succeeded: u32,
    pub rescheduled: u32,
    pub tombstoned: u32,
}

/// `delay = min(base * 2^attempt, max_delay) * random(0.5..1.5)`, per
/// spec.md §4.C.
fn backoff_with_jitter(base: Duration, max: Duration, attempt: u32) -> chrono::Duration {
    let exp = base.as_secs_f64() * 2f64.powi(attempt as i32);
    let capped = exp.min(max.as_secs_f64());
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    let seconds = (capped * jitter).max(0.0);
    chrono::Duration::milliseconds((seconds * 1000.0) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use logbeam_core::entry::SourceKind;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> DlqConfig {
        DlqConfig {
            directory: dir.to_path_buf(),
            max_file_size: 1_000_000,
            max_total_size: 10_000_000,
            retention_period: Duration::from_secs(86400),
            max_recovery_attempts: 3,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(100),
            max_pending_in_memory: 10,
        }
    }

    fn entry() -> LogEntry {
        LogEntry::new(SourceKind::File, "a", "boom").unwrap()
    }

    #[test]
    fn add_returns_written_when_enabled() {
        let dir = tempdir().unwrap();
        let mut dlq = DeadLetterQueue::open(config(dir.path()), true).unwrap();
        assert_eq!(dlq.add(entry(), "loki", "http_503", 1), AddOutcome::Written);
        assert_eq!(dlq.pending_len(), 1);
    }

    #[test]
    fn add_returns_disabled_when_dlq_disabled() {
        let dir = tempdir().unwrap();
        let mut dlq = DeadLetterQueue::open(config(dir.path()), false).unwrap();
        assert_eq!(dlq.add(entry(), "loki", "http_503", 1), AddOutcome::Disabled);
    }

    #[test]
    fn add_returns_pending_full_when_over_capacity() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.max_pending_in_memory = 1;
        let mut dlq = DeadLetterQueue::open(cfg, true).unwrap();
        assert_eq!(dlq.add(entry(), "loki", "r", 1), AddOutcome::Written);
        assert_eq!(dlq.add(entry(), "loki", "r", 1), AddOutcome::PendingFull);
    }

    #[test]
    fn add_persists_the_caller_supplied_attempt_count() {
        let dir = tempdir().unwrap();
        let mut dlq = DeadLetterQueue::open(config(dir.path()), true).unwrap();
        dlq.add(entry(), "loki", "r", 3);
        assert_eq!(dlq.pending[0].attempt_count, 3);
    }

    #[test]
    fn reprocess_success_removes_entry() {
        let dir = tempdir().unwrap();
        let mut dlq = DeadLetterQueue::open(config(dir.path()), true).unwrap();
        dlq.add(entry(), "loki", "r", 1);
        let stats = dlq.reprocess_once(|_| true);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(dlq.pending_len(), 0);
    }

    #[test]
    fn reprocess_failure_increments_attempt_and_reschedules() {
        let dir = tempdir().unwrap();
        let mut dlq = DeadLetterQueue::open(config(dir.path()), true).unwrap();
        dlq.add(entry(), "loki", "r", 1);
        let stats = dlq.reprocess_once(|_| false);
        assert_eq!(stats.rescheduled, 1);
        assert_eq!(dlq.pending[0].attempt_count, 2);
        assert!(dlq.pending[0].next_retry_at > Utc::now());
    }

    #[test]
    fn reprocess_tombstones_after_max_attempts() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.max_recovery_attempts = 1;
        let mut dlq = DeadLetterQueue::open(cfg, true).unwrap();
        dlq.add(entry(), "loki", "r", 1);
        let stats = dlq.reprocess_once(|_| false);
        assert_eq!(stats.tombstoned, 1);
        assert_eq!(dlq.pending_len(), 0);
    }

    #[test]
    fn recover_loads_persisted_entries() {
        let dir = tempdir().unwrap();
        {
            let mut dlq = DeadLetterQueue::open(config(dir.path()), true).unwrap();
            dlq.add(entry(), "loki", "r", 1);
        }
        let mut dlq2 = DeadLetterQueue::open(config(dir.path()), true).unwrap();
        let loaded = dlq2.recover().unwrap();
        assert_eq!(loaded, 1);
    }
}
