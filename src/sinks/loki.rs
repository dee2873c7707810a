//! Loki-style remote sink (spec.md §4.M): groups a batch's entries into
//! per-label-set streams, builds a Loki push payload, compresses it, and
//! sends it through a circuit breaker.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use logbeam_core::batch::Batch;
use logbeam_core::labels::stream_key;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::breaker::{BreakerError, CircuitBreaker, CircuitBreakerConfig};
use crate::compressor::{Algorithm, Compressor, CompressorConfig};
use crate::config::LokiSinkConfig;
use crate::sinks::{Sink, SinkError, SinkStats};

#[derive(Serialize)]
struct LokiStream {
    stream: BTreeMap<String, String>,
    values: Vec<[String; 2]>,
}

#[derive(Serialize)]
struct LokiPushRequest {
    streams: Vec<LokiStream>,
}

fn group_into_streams(batch: &Batch, default_labels: &BTreeMap<String, String>) -> Vec<LokiStream> {
    let mut grouped: BTreeMap<u64, (BTreeMap<String, String>, Vec<[String; 2]>)> = BTreeMap::new();

    for entry in &batch.entries {
        let mut labels = default_labels.clone();
        labels.extend(entry.labels.clone());
        labels.insert("source_kind".to_string(), format!("{:?}", entry.source_kind).to_lowercase());
        labels.insert("level".to_string(), format!("{:?}", entry.level).to_lowercase());

        let key = stream_key(&labels);
        let line = serde_json::to_string(&json!({
            "message": entry.message,
            "fields": entry.fields,
        }))
        .unwrap_or_else(|_| entry.message.clone());

        let ns = entry.event_timestamp.timestamp_nanos_opt().unwrap_or(0);
        grouped
            .entry(key)
            .or_insert_with(|| (labels, Vec::new()))
            .1
            .push([ns.to_string(), line]);
    }

    grouped
        .into_values()
        .map(|(stream, values)| LokiStream { stream, values })
        .collect()
}

pub struct LokiSink {
    config: LokiSinkConfig,
    client: Client,
    breaker: CircuitBreaker,
    compressor: Mutex<Compressor>,
    batches_sent: AtomicU64,
    batches_failed: AtomicU64,
    entries_sent: AtomicU64,
    bytes_sent: AtomicU64,
    last_error: Mutex<Option<String>>,
    /// Pushed in by the backpressure-sampling task; consulted by
    /// `Compressor::adapt_algorithm` to trade ratio for CPU under load.
    backpressure_reduction: Mutex<f64>,
    /// Set when the degradation manager disables `Feature::HeavyCompression`;
    /// forces the cheapest algorithm regardless of the configured one.
    heavy_compression_disabled: std::sync::atomic::AtomicBool,
}

impl LokiSink {
    pub fn new(config: LokiSinkConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("reqwest client build should not fail with default TLS config");
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: config.circuit_breaker.failure_threshold,
            success_threshold: config.circuit_breaker.success_threshold,
            timeout: config.circuit_breaker.timeout,
            half_open_max_calls: config.circuit_breaker.half_open_max_calls,
        });
        let compressor = Compressor::new(CompressorConfig {
            min_bytes: 512,
            level: config.compression.level,
            adaptive_enabled: true,
        });
        Self {
            config,
            client,
            breaker,
            compressor: Mutex::new(compressor),
            batches_sent: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
            entries_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            last_error: Mutex::new(None),
            backpressure_reduction: Mutex::new(0.0),
            heavy_compression_disabled: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Updates the load factor fed to `Compressor::adapt_algorithm`.
    pub fn set_backpressure_reduction(&self, reduction: f64) {
        *self.backpressure_reduction.lock() = reduction;
    }

    /// Forces the cheapest compression algorithm while `disabled`, per the
    /// degradation manager's `Feature::HeavyCompression` coupling.
    pub fn set_heavy_compression_disabled(&self, disabled: bool) {
        self.heavy_compression_disabled.store(disabled, Ordering::Relaxed);
    }

    fn classify_status(status: StatusCode) -> SinkError {
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            SinkError::Retryable { message: format!("loki responded {status}") }
        } else {
            SinkError::Permanent { message: format!("loki responded {status}") }
        }
    }

    async fn do_send(&self, body: Vec<u8>, content_encoding: &'static str) -> Result<(), SinkError> {
        let mut request = self
            .client
            .post(&self.config.url)
            .header("Content-Type", "application/json")
            .body(body);

        if content_encoding != "identity" {
            request = request.header("Content-Encoding", content_encoding);
        }
        if let Some(tenant_id) = &self.config.tenant_id {
            request = request.header("X-Scope-OrgID", tenant_id);
        }
        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SinkError::Retryable { message: e.to_string() })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::classify_status(response.status()))
        }
    }
}

#[async_trait]
impl Sink for LokiSink {
    async fn start(&self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn send(&self, batch: &Batch) -> Result<(), SinkError> {
        let streams = group_into_streams(batch, &self.config.default_labels);
        let payload = LokiPushRequest { streams };
        let body = serde_json::to_vec(&payload)
            .map_err(|e| SinkError::Permanent { message: e.to_string() })?;

        let (compressed, encoding) = if self.config.compression.enabled {
            let mut compressor = self.compressor.lock();
            let algorithm = if self.heavy_compression_disabled.load(Ordering::Relaxed) {
                Algorithm::Lz4
            } else {
                let configured = Algorithm::parse(&self.config.compression.algorithm).unwrap_or(Algorithm::Gzip);
                let reduction = *self.backpressure_reduction.lock();
                compressor.adapt_algorithm(configured, reduction)
            };
            let payload = compressor
                .compress(&body, algorithm)
                .map_err(|e| SinkError::Permanent { message: e.to_string() })?;
            (payload.data, payload.algorithm.content_encoding())
        } else {
            (body, "identity")
        };

        debug!(entries = batch.len(), bytes = compressed.len(), "sending loki batch");

        let result = self.breaker.call(|| self.do_send(compressed.clone(), encoding)).await;
        match result {
            Ok(()) => {
                self.batches_sent.fetch_add(1, Ordering::Relaxed);
                self.entries_sent.fetch_add(batch.len() as u64, Ordering::Relaxed);
                self.bytes_sent.fetch_add(compressed.len() as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(BreakerError::CircuitOpen) => {
                self.batches_failed.fetch_add(1, Ordering::Relaxed);
                *self.last_error.lock() = Some("circuit breaker open".to_string());
                Err(SinkError::CircuitOpen)
            }
            Err(BreakerError::Inner { source }) => {
                self.batches_failed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %source, "loki sink send failed");
                *self.last_error.lock() = Some(source.to_string());
                Err(source)
            }
        }
    }

    async fn is_healthy(&self) -> bool {
        !matches!(self.breaker.state(), crate::breaker::State::Open)
    }

    fn stats(&self) -> SinkStats {
        SinkStats {
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            entries_sent: self.entries_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
        }
    }
}

#[allow(dead_code)]
fn default_retry_backoff(attempt: u32) -> Duration {
    Duration::from_millis(500 * 2u64.saturating_pow(attempt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use logbeam_core::entry::SourceKind;
    use logbeam_core::LogEntry;

    fn entry(source: &str, message: &str) -> LogEntry {
        LogEntry::new(SourceKind::File, source, message).unwrap()
    }

    #[test]
    fn groups_entries_by_label_set() {
        let mut e1 = entry("a", "one");
        e1.labels.insert("app".to_string(), "web".to_string());
        let mut e2 = entry("a", "two");
        e2.labels.insert("app".to_string(), "web".to_string());
        let mut e3 = entry("a", "three");
        e3.labels.insert("app".to_string(), "db".to_string());

        let batch = Batch::new("loki", vec![e1, e2, e3]);
        let streams = group_into_streams(&batch, &BTreeMap::new());
        assert_eq!(streams.len(), 2);
        let total: usize = streams.iter().map(|s| s.values.len()).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn classify_status_routes_429_and_5xx_as_retryable() {
        assert!(matches!(
            LokiSink::classify_status(StatusCode::TOO_MANY_REQUESTS),
            SinkError::Retryable { .. }
        ));
        assert!(matches!(
            LokiSink::classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            SinkError::Retryable { .. }
        ));
    }

    #[test]
    fn classify_status_routes_4xx_as_permanent() {
        assert!(matches!(
            LokiSink::classify_status(StatusCode::BAD_REQUEST),
            SinkError::Permanent { .. }
        ));
        assert!(matches!(
            LokiSink::classify_status(StatusCode::UNAUTHORIZED),
            SinkError::Permanent { .. }
        ));
    }
}
