//! Sinks (spec.md §4.M): a common async interface implemented by each
//! delivery target, plus the two concrete sinks the agent ships with.

pub mod local_file;
pub mod loki;

use async_trait::async_trait;
use logbeam_core::batch::Batch;
use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum SinkError {
    #[snafu(display("sink rejected batch (retryable): {message}"))]
    Retryable { message: String },
    #[snafu(display("sink rejected batch (permanent): {message}"))]
    Permanent { message: String },
    #[snafu(display("circuit breaker open"))]
    CircuitOpen,
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Retryable { .. } | SinkError::CircuitOpen)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SinkStats {
    pub batches_sent: u64,
    pub batches_failed: u64,
    pub entries_sent: u64,
    pub bytes_sent: u64,
    pub last_error: Option<String>,
}

/// Common contract every delivery target implements: start/stop lifecycle,
/// batch send, and a health/stats surface for the admin API.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn start(&self) -> Result<(), SinkError>;
    async fn stop(&self) -> Result<(), SinkError>;
    async fn send(&self, batch: &Batch) -> Result<(), SinkError>;
    async fn is_healthy(&self) -> bool;
    fn stats(&self) -> SinkStats;
}
