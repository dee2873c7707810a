use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AgentError, ErrorKind};

/// Normalized log level. Unrecognized input levels are mapped to `Info`
/// by the `log_level_extract` processing step rather than rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Unknown,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Unknown
    }
}

impl LogLevel {
    /// Best-effort normalization of a free-text level string, case-insensitive.
    pub fn parse_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" | "dbg" => LogLevel::Debug,
            "info" | "information" | "notice" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" | "err" => LogLevel::Error,
            "fatal" | "critical" | "crit" | "panic" => LogLevel::Fatal,
            _ => LogLevel::Unknown,
        }
    }
}

/// Where a `LogEntry` originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    File,
    Container,
    Network,
}

/// Outcome of a single processing step, recorded on the entry's trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Applied,
    Skipped,
    Errored,
}

/// One entry in a `LogEntry`'s processing trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingStepRecord {
    pub step_name: String,
    pub duration_micros: u64,
    pub outcome: StepOutcome,
}

/// The central record flowing through the agent: ingestion timestamp,
/// event timestamp, level, message, routing metadata, and arbitrary
/// structured fields.
///
/// Instances are owned by the monitor that created them until they are
/// handed to the dispatcher; after that point they are treated as
/// immutable (see module docs on `labels`/`fields` copy-on-write).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub ingested_at: DateTime<Utc>,
    pub event_timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub source_kind: SourceKind,
    pub source_id: String,
    pub tags: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub fields: BTreeMap<String, Value>,
    pub trace: Vec<ProcessingStepRecord>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
}

impl LogEntry {
    /// Builds a new entry from a monitor read. `message` must be non-empty;
    /// callers should reject empty lines before calling this (see
    /// `ErrorKind::ParseError` in spec boundary behaviors).
    pub fn new(
        source_kind: SourceKind,
        source_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<Self, AgentError> {
        let message = message.into();
        if message.is_empty() {
            return Err(AgentError::new(
                ErrorKind::ParseError,
                "log_entry",
                "new",
                "message must not be empty",
            ));
        }
        let now = Utc::now();
        Ok(Self {
            ingested_at: now,
            event_timestamp: now,
            level: LogLevel::Unknown,
            message,
            source_kind,
            source_id: source_id.into(),
            tags: Vec::new(),
            labels: BTreeMap::new(),
            fields: BTreeMap::new(),
            trace: Vec::new(),
            trace_id: None,
            span_id: None,
        })
    }

    /// Returns `true` if any label value or key contains a control character,
    /// violating the label invariant in spec.md §3.
    pub fn has_invalid_labels(&self) -> bool {
        self.labels
            .iter()
            .any(|(k, v)| contains_control_char(k) || contains_control_char(v))
    }

    pub fn record_step(&mut self, step_name: &str, duration_micros: u64, outcome: StepOutcome) {
        self.trace.push(ProcessingStepRecord {
            step_name: step_name.to_string(),
            duration_micros,
            outcome,
        });
    }
}

fn contains_control_char(s: &str) -> bool {
    s.chars().any(|c| c.is_control())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_message() {
        let err = LogEntry::new(SourceKind::File, "/var/log/a.log", "").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ParseError);
    }

    #[test]
    fn accepts_nonempty_message() {
        let entry = LogEntry::new(SourceKind::File, "/var/log/a.log", "hello").unwrap();
        assert_eq!(entry.message, "hello");
        assert_eq!(entry.level, LogLevel::Unknown);
    }

    #[test]
    fn detects_control_chars_in_labels() {
        let mut entry = LogEntry::new(SourceKind::File, "a", "hello").unwrap();
        entry.labels.insert("bad".into(), "x\u{0007}y".into());
        assert!(entry.has_invalid_labels());
    }

    #[test]
    fn level_parse_loose_is_case_insensitive() {
        assert_eq!(LogLevel::parse_loose("WARN"), LogLevel::Warn);
        assert_eq!(LogLevel::parse_loose("  Error "), LogLevel::Error);
        assert_eq!(LogLevel::parse_loose("bogus"), LogLevel::Unknown);
    }
}
