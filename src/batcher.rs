//! Adaptive batcher (spec.md §4.D): per-sink size+time flushing whose
//! size and delay are tuned from observed send latency and throughput.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use logbeam_core::LogEntry;
use tracing::debug;

pub struct AdaptiveBatcherConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub initial_size: usize,
    pub min_flush_delay: Duration,
    pub max_flush_delay: Duration,
    pub initial_flush_delay: Duration,
    pub latency_threshold: Duration,
    pub throughput_target: f64,
    pub adaptation_interval: Duration,
    pub shrink_factor: f64,
    pub grow_factor: f64,
    pub window_capacity: usize,
}

impl Default for AdaptiveBatcherConfig {
    fn default() -> Self {
        Self {
            min_size: 10,
            max_size: 1000,
            initial_size: 100,
            min_flush_delay: Duration::from_millis(100),
            max_flush_delay: Duration::from_secs(10),
            initial_flush_delay: Duration::from_secs(1),
            latency_threshold: Duration::from_secs(1),
            throughput_target: 100.0,
            adaptation_interval: Duration::from_secs(10),
            shrink_factor: 0.75,
            grow_factor: 1.25,
            window_capacity: 20,
        }
    }
}

pub struct AdaptiveBatcher {
    config: AdaptiveBatcherConfig,
    buffer: Vec<LogEntry>,
    current_size: usize,
    current_flush_delay: Duration,
    last_flush: Instant,
    latency_window: VecDeque<Duration>,
    throughput_window: VecDeque<f64>,
    last_adaptation: Instant,
    pub dropped_batches: u64,
}

impl AdaptiveBatcher {
    pub fn new(config: AdaptiveBatcherConfig) -> Self {
        let now = Instant::now();
        let current_size = config.initial_size;
        let current_flush_delay = config.initial_flush_delay;
        Self {
            config,
            buffer: Vec::new(),
            current_size,
            current_flush_delay,
            last_flush: now,
            latency_window: VecDeque::new(),
            throughput_window: VecDeque::new(),
            last_adaptation: now,
            dropped_batches: 0,
        }
    }

    pub fn current_size(&self) -> usize {
        self.current_size
    }

    pub fn current_flush_delay(&self) -> Duration {
        self.current_flush_delay
    }

    /// Appends `entry`; returns `Some(batch)` if the size or time
    /// threshold was crossed and the buffer should be flushed now.
    pub fn add(&mut self, entry: LogEntry, now: Instant) -> Option<Vec<LogEntry>> {
        self.buffer.push(entry);
        if self.buffer.len() >= self.current_size
            || now.duration_since(self.last_flush) >= self.current_flush_delay
        {
            return Some(self.take(now));
        }
        None
    }

    /// Forces a flush regardless of thresholds (used on shutdown or an
    /// explicit flush request).
    pub fn take(&mut self, now: Instant) -> Vec<LogEntry> {
        self.last_flush = now;
        std::mem::take(&mut self.buffer)
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn record_send(&mut self, latency: Duration, entries_sent: usize, elapsed: Duration) {
        if self.latency_window.len() >= self.config.window_capacity {
            self.latency_window.pop_front();
        }
        self.latency_window.push_back(latency);

        let throughput = if elapsed.as_secs_f64() > 0.0 {
            entries_sent as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        if self.throughput_window.len() >= self.config.window_capacity {
            self.throughput_window.pop_front();
        }
        self.throughput_window.push_back(throughput);
    }

    pub fn record_drop(&mut self) {
        self.dropped_batches += 1;
    }

    fn mean(window: &VecDeque<Duration>) -> Duration {
        if window.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = window.iter().sum();
        total / window.len() as u32
    }

    fn mean_throughput(window: &VecDeque<f64>) -> f64 {
        if window.is_empty() {
            return 0.0;
        }
        window.iter().sum::<f64>() / window.len() as f64
    }

    /// Runs one adaptation tick if `adaptation_interval` has elapsed since
    /// the last one. Latency always wins over throughput when both
    /// conditions could fire.
    pub fn maybe_adapt(&mut self, now: Instant) {
        if now.duration_since(self.last_adaptation) < self.config.adaptation_interval {
            return;
        }
        self.last_adaptation = now;
        self.adapt();
    }

    fn adapt(&mut self) {
        let mean_latency = Self::mean(&self.latency_window);
        let mean_throughput = Self::mean_throughput(&self.throughput_window);

        if mean_latency > self.config.latency_threshold {
            self.shrink();
        } else if mean_throughput < self.config.throughput_target
            && mean_latency < self.config.latency_threshold / 2
        {
            self.grow();
        }
        debug!(
            current_size = self.current_size,
            current_flush_delay_ms = self.current_flush_delay.as_millis() as u64,
            mean_latency_ms = mean_latency.as_millis() as u64,
            mean_throughput,
            "adaptive batcher tick"
        );
    }

    fn shrink(&mut self) {
        let new_size = ((self.current_size as f64) * self.config.shrink_factor) as usize;
        self.current_size = new_size.clamp(self.config.min_size, self.config.max_size);
        let new_delay = self.current_flush_delay.mul_f64(self.config.shrink_factor);
        self.current_flush_delay = new_delay.clamp(self.config.min_flush_delay, self.config.max_flush_delay);
    }

    fn grow(&mut self) {
        let new_size = ((self.current_size as f64) * self.config.grow_factor) as usize;
        self.current_size = new_size.clamp(self.config.min_size, self.config.max_size);
        let new_delay = self.current_flush_delay.mul_f64(self.config.grow_factor);
        self.current_flush_delay = new_delay.clamp(self.config.min_flush_delay, self.config.max_flush_delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use logbeam_core::entry::SourceKind;

    fn entry() -> LogEntry {
        LogEntry::new(SourceKind::File, "a", "x").unwrap()
    }

    #[test]
    fn flushes_on_size_threshold() {
        let config = AdaptiveBatcherConfig {
            initial_size: 2,
            initial_flush_delay: Duration::from_secs(100),
            ..Default::default()
        };
        let mut batcher = AdaptiveBatcher::new(config);
        let now = Instant::now();
        assert!(batcher.add(entry(), now).is_none());
        assert!(batcher.add(entry(), now).is_some());
    }

    #[test]
    fn flushes_on_time_threshold() {
        let config = AdaptiveBatcherConfig {
            initial_size: 1000,
            initial_flush_delay: Duration::from_millis(10),
            ..Default::default()
        };
        let mut batcher = AdaptiveBatcher::new(config);
        let t0 = Instant::now();
        assert!(batcher.add(entry(), t0).is_none());
        assert!(batcher.add(entry(), t0 + Duration::from_millis(20)).is_some());
    }

    #[test]
    fn shrinks_on_high_latency_and_stays_within_bounds() {
        let config = AdaptiveBatcherConfig {
            min_size: 10,
            max_size: 1000,
            initial_size: 100,
            latency_threshold: Duration::from_millis(100),
            adaptation_interval: Duration::ZERO,
            ..Default::default()
        };
        let mut batcher = AdaptiveBatcher::new(config);
        batcher.record_send(Duration::from_millis(500), 10, Duration::from_secs(1));
        batcher.maybe_adapt(Instant::now());
        assert!(batcher.current_size() < 100);
        assert!(batcher.current_size() >= 10);
    }

    #[test]
    fn grows_on_low_latency_and_low_throughput() {
        let config = AdaptiveBatcherConfig {
            min_size: 10,
            max_size: 1000,
            initial_size: 100,
            latency_threshold: Duration::from_millis(1000),
            throughput_target: 1000.0,
            adaptation_interval: Duration::ZERO,
            ..Default::default()
        };
        let mut batcher = AdaptiveBatcher::new(config);
        batcher.record_send(Duration::from_millis(10), 1, Duration::from_secs(1));
        batcher.maybe_adapt(Instant::now());
        assert!(batcher.current_size() > 100);
    }

    #[test]
    fn latency_wins_over_throughput_tie_break() {
        let config = AdaptiveBatcherConfig {
            min_size: 10,
            max_size: 1000,
            initial_size: 100,
            latency_threshold: Duration::from_millis(100),
            throughput_target: 1000.0,
            adaptation_interval: Duration::ZERO,
            ..Default::default()
        };
        let mut batcher = AdaptiveBatcher::new(config);
        // Both high latency (should shrink) and low throughput (would grow)
        // are true; latency must win.
        batcher.record_send(Duration::from_millis(500), 1, Duration::from_secs(1));
        batcher.maybe_adapt(Instant::now());
        assert!(batcher.current_size() < 100);
    }

    #[test]
    fn size_and_delay_always_within_configured_bounds() {
        let config = AdaptiveBatcherConfig {
            min_size: 10,
            max_size: 50,
            initial_size: 45,
            min_flush_delay: Duration::from_millis(100),
            max_flush_delay: Duration::from_millis(500),
            initial_flush_delay: Duration::from_millis(450),
            latency_threshold: Duration::from_millis(10),
            adaptation_interval: Duration::ZERO,
            ..Default::default()
        };
        let mut batcher = AdaptiveBatcher::new(config);
        for _ in 0..10 {
            batcher.record_send(Duration::from_millis(500), 1, Duration::from_secs(1));
            batcher.maybe_adapt(Instant::now());
        }
        assert!(batcher.current_size() >= 10 && batcher.current_size() <= 50);
        assert!(
            batcher.current_flush_delay() >= Duration::from_millis(100)
                && batcher.current_flush_delay() <= Duration::from_millis(500)
        );
    }
}
