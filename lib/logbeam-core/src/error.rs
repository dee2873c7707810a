use std::fmt;

/// Error kind taxonomy from spec.md §7. Classified by kind, not by Rust
/// type, so that a single `AgentError` can carry any of them along with
/// component/operation context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigInvalid,
    IoTransient,
    IoPermanent,
    NetworkTimeout,
    NetworkRefused,
    HttpRetryable,
    HttpPermanent,
    ParseError,
    TimestampOutOfWindow,
    CircuitOpen,
    BackpressureRejected,
    RateLimited,
    QueueFull,
    DuplicateDropped,
    SelfLogDropped,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConfigInvalid => "config_invalid",
            ErrorKind::IoTransient => "io_transient",
            ErrorKind::IoPermanent => "io_permanent",
            ErrorKind::NetworkTimeout => "network_timeout",
            ErrorKind::NetworkRefused => "network_refused",
            ErrorKind::HttpRetryable => "http_retryable",
            ErrorKind::HttpPermanent => "http_permanent",
            ErrorKind::ParseError => "parse_error",
            ErrorKind::TimestampOutOfWindow => "timestamp_out_of_window",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::BackpressureRejected => "backpressure_rejected",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::QueueFull => "queue_full",
            ErrorKind::DuplicateDropped => "duplicate_dropped",
            ErrorKind::SelfLogDropped => "self_log_dropped",
        }
    }

    /// Whether the dispatcher's retry path should be used for this kind,
    /// as opposed to an immediate drop or DLQ write.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::IoTransient | ErrorKind::NetworkTimeout | ErrorKind::HttpRetryable
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

/// A single error instance, carrying the kind plus enough context to log
/// and to route (component+operation), matching spec.md §7's error shape.
#[derive(Debug, Clone)]
pub struct AgentError {
    pub kind: ErrorKind,
    pub component: String,
    pub operation: String,
    pub message: String,
    pub severity: Severity,
}

impl AgentError {
    pub fn new(
        kind: ErrorKind,
        component: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let severity = match kind {
            ErrorKind::ConfigInvalid | ErrorKind::IoPermanent => Severity::Critical,
            ErrorKind::HttpPermanent | ErrorKind::CircuitOpen => Severity::High,
            ErrorKind::NetworkTimeout | ErrorKind::NetworkRefused | ErrorKind::HttpRetryable => {
                Severity::Medium
            }
            ErrorKind::ParseError | ErrorKind::TimestampOutOfWindow => Severity::Low,
            _ => Severity::Info,
        };
        Self {
            kind,
            component: component.into(),
            operation: operation.into(),
            message: message.into(),
            severity,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}.{}: {}",
            self.kind.as_str(),
            self.component,
            self.operation,
            self.message
        )
    }
}

impl std::error::Error for AgentError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::HttpRetryable.is_retryable());
        assert!(!ErrorKind::HttpPermanent.is_retryable());
        assert!(!ErrorKind::DuplicateDropped.is_retryable());
    }

    #[test]
    fn default_severity_assignment() {
        let e = AgentError::new(ErrorKind::ConfigInvalid, "config", "load", "bad yaml");
        assert_eq!(e.severity, Severity::Critical);
    }
}
