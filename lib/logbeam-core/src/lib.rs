//! Core data model shared by every component of the agent: the `LogEntry`
//! record, position tracking structs, dispatch/batch wrappers, and the
//! error taxonomy.

pub mod batch;
pub mod entry;
pub mod error;
pub mod labels;
pub mod position;
pub mod time;

pub use batch::{Batch, DispatchItem};
pub use entry::{LogEntry, LogLevel, ProcessingStepRecord, SourceKind, StepOutcome};
pub use error::{AgentError, ErrorKind, Severity};
pub use position::{ContainerPosition, FilePosition, SourceStatus};
