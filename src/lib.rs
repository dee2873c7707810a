//! `logbeam`: discovers, tails, transforms, and ships logs to remote and
//! local sinks with at-least-once delivery (spec.md §1-§2).

pub mod admin;
pub mod backpressure;
pub mod batcher;
pub mod breaker;
pub mod compressor;
pub mod config;
pub mod container_monitor;
pub mod dedup;
pub mod dispatcher;
pub mod processing;
pub mod selfguard;
pub mod sinks;

pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
