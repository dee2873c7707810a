//! Dispatcher (spec.md §4.L): the worker pool that runs each entry
//! through the gating pipeline, batches it per sink in a worker-private
//! buffer, and drives send/retry/DLQ handoff.

mod pipeline;
mod retry_queue;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Duration as ChronoDuration;
use logbeam_buffers::dlq::{AddOutcome, DeadLetterQueue};
use logbeam_core::batch::{Batch, DispatchItem};
use logbeam_core::LogEntry;
use rand::Rng;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

pub use pipeline::{DropReason, GateOutcome, Pipeline};
pub use retry_queue::RetryQueue;

use crate::batcher::{AdaptiveBatcher, AdaptiveBatcherConfig};
use crate::sinks::Sink;

pub struct SinkTarget {
    pub name: String,
    pub sink: Arc<dyn Sink>,
    pub batcher_config: AdaptiveBatcherConfig,
}

pub struct DispatcherConfig {
    pub worker_count: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub dlq_enabled: bool,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    pipeline: Arc<Pipeline>,
    sinks: Vec<SinkTarget>,
    retry_queue: Arc<RetryQueue>,
    dlq: Option<Arc<AsyncMutex<DeadLetterQueue>>>,
    dropped_total: std::sync::atomic::AtomicU64,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        pipeline: Pipeline,
        sinks: Vec<SinkTarget>,
        dlq: Option<DeadLetterQueue>,
    ) -> Self {
        Self {
            config,
            pipeline: Arc::new(pipeline),
            sinks,
            retry_queue: Arc::new(RetryQueue::new()),
            dlq: dlq.map(|d| Arc::new(AsyncMutex::new(d))),
            dropped_total: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn pipeline(&self) -> Arc<Pipeline> {
        self.pipeline.clone()
    }

    /// Spawns the worker pool and the retry-drain task, consuming
    /// `inbound` across all workers. `shutdown` is watched by the
    /// retry-drain task only: workers exit on their own once every
    /// producer drops its sender half of `inbound`.
    pub fn spawn(
        self: Arc<Self>,
        inbound: mpsc::Receiver<LogEntry>,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let shared_inbound = Arc::new(AsyncMutex::new(inbound));
        let mut handles = Vec::new();

        for worker_id in 0..self.config.worker_count.max(1) {
            let dispatcher = self.clone();
            let inbound = shared_inbound.clone();
            handles.push(tokio::spawn(async move {
                dispatcher.worker_loop(worker_id, inbound).await;
            }));
        }

        let dispatcher = self.clone();
        handles.push(tokio::spawn(async move {
            dispatcher.retry_drain_loop(shutdown).await;
        }));

        handles
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, inbound: Arc<AsyncMutex<mpsc::Receiver<LogEntry>>>) {
        // Each worker owns a private batcher per sink, per spec.md's
        // "workers own private batch buffers" requirement.
        let mut batchers: HashMap<String, AdaptiveBatcher> = self
            .sinks
            .iter()
            .map(|target| (target.name.clone(), AdaptiveBatcher::new(clone_batcher_config(&target.batcher_config))))
            .collect();

        loop {
            let entry = {
                let mut guard = inbound.lock().await;
                guard.recv().await
            };
            let entry = match entry {
                Some(entry) => entry,
                None => break,
            };

            match self.pipeline.handle(entry) {
                GateOutcome::Dropped(reason) => {
                    debug!(worker_id, ?reason, "entry dropped at gating stage");
                    self.dropped_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    continue;
                }
                GateOutcome::Pass(entry) => {
                    for target in &self.sinks {
                        let batcher = batchers.get_mut(&target.name).expect("batcher created for every sink");
                        let now = Instant::now();
                        if let Some(batch) = batcher.add(entry.clone(), now) {
                            if !batch.is_empty() {
                                self.dispatch_batch(target, Batch::new(target.name.clone(), batch), Some(batcher)).await;
                            }
                        }
                    }
                }
            }
        }

        // Flush whatever remains in each private batcher on shutdown.
        for target in &self.sinks {
            let remaining = match batchers.get_mut(&target.name) {
                Some(batcher) => batcher.take(Instant::now()),
                None => continue,
            };
            if !remaining.is_empty() {
                let batch = Batch::new(target.name.clone(), remaining);
                self.dispatch_batch(target, batch, batchers.get_mut(&target.name)).await;
            }
        }
    }

    /// `batcher` is `Some` when called from a worker's own per-sink batcher
    /// (so the adaptive size/flush-delay can react to the send outcome) and
    /// `None` from the retry drain loop, which resends off the adaptive hot
    /// path and shouldn't perturb a worker's batching decisions.
    async fn dispatch_batch(&self, target: &SinkTarget, mut batch: Batch, batcher: Option<&mut AdaptiveBatcher>) {
        batch.record_attempt();
        let entries_sent = batch.len();
        let start = Instant::now();
        let result = target.sink.send(&batch).await;
        let elapsed = start.elapsed();

        match result {
            Ok(()) => {
                debug!(sink = %target.name, entries = batch.len(), "batch delivered");
                if let Some(batcher) = batcher {
                    batcher.record_send(elapsed, entries_sent, elapsed);
                    batcher.maybe_adapt(Instant::now());
                }
            }
            Err(err) => {
                warn!(sink = %target.name, error = %err, attempt = batch.attempt_count, "batch delivery failed");
                if let Some(batcher) = batcher {
                    batcher.record_drop();
                    batcher.maybe_adapt(Instant::now());
                }
                self.schedule_retry(target, batch, &err.to_string()).await;
            }
        }
    }

    async fn schedule_retry(&self, target: &SinkTarget, batch: Batch, reason: &str) {
        for entry in batch.entries {
            if batch.attempt_count > self.config.max_retries {
                self.hand_off_to_dlq(target, entry, reason, batch.attempt_count).await;
                continue;
            }
            let mut item = DispatchItem::new(entry, target.name.clone());
            item.attempt_count = batch.attempt_count;
            item.next_attempt_time = chrono::Utc::now() + ChronoDuration::milliseconds(backoff_millis(self.config.retry_base_delay_ms, batch.attempt_count) as i64);
            self.retry_queue.push(item);
        }
    }

    async fn hand_off_to_dlq(&self, target: &SinkTarget, entry: LogEntry, reason: &str, attempt_count: u32) {
        match &self.dlq {
            Some(dlq) if self.config.dlq_enabled => {
                let outcome = dlq.lock().await.add(entry, &target.name, reason, attempt_count);
                match outcome {
                    AddOutcome::Written => {}
                    AddOutcome::Disabled | AddOutcome::PendingFull => {
                        warn!(sink = %target.name, ?outcome, "dropping entry: dlq unavailable");
                        self.dropped_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                }
            }
            _ => {
                self.dropped_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }
    }

    /// Periodically drains items whose backoff has elapsed and resends
    /// them directly to their sink, bypassing the gating pipeline: a
    /// retried entry already passed self-guard/rate-limit/dedup/processing
    /// once, and re-running those steps would double-count rate limits
    /// and risk re-deduplicating a legitimate redelivery.
    async fn retry_drain_loop(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    info!("retry drain loop stopping on shutdown signal");
                    break;
                }
            }
            let ready = self.retry_queue.drain_ready();
            if ready.is_empty() {
                continue;
            }
            info!(count = ready.len(), "redelivering entries from retry queue");

            let mut by_sink: HashMap<String, (u32, Vec<LogEntry>)> = HashMap::new();
            for item in ready {
                let slot = by_sink.entry(item.sink_target.clone()).or_insert_with(|| (item.attempt_count, Vec::new()));
                slot.0 = slot.0.max(item.attempt_count);
                slot.1.push(item.entry);
            }
            for target in &self.sinks {
                if let Some((attempt_count, entries)) = by_sink.remove(&target.name) {
                    if entries.is_empty() {
                        continue;
                    }
                    let mut batch = Batch::new(target.name.clone(), entries);
                    batch.attempt_count = attempt_count;
                    self.dispatch_batch(target, batch, None).await;
                }
            }
        }
    }
}

fn clone_batcher_config(config: &AdaptiveBatcherConfig) -> AdaptiveBatcherConfig {
    AdaptiveBatcherConfig {
        min_size: config.min_size,
        max_size: config.max_size,
        initial_size: config.initial_size,
        min_flush_delay: config.min_flush_delay,
        max_flush_delay: config.max_flush_delay,
        initial_flush_delay: config.initial_flush_delay,
        latency_threshold: config.latency_threshold,
        throughput_target: config.throughput_target,
        adaptation_interval: config.adaptation_interval,
        shrink_factor: config.shrink_factor,
        grow_factor: config.grow_factor,
        window_capacity: config.window_capacity,
    }
}

fn backoff_millis(base_ms: u64, attempt: u32) -> u64 {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(16));
    let jitter = rand::thread_rng().gen_range(0..=(exp / 4).max(1));
    exp + jitter
}
