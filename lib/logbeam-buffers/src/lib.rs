//! Durable, checksummed on-disk storage shared by the dispatcher's overflow
//! buffer (§4.B) and the dead-letter queue (§4.C). Both are built on the
//! same length-prefixed record framing in `record`.

pub mod disk_buffer;
pub mod dlq;
pub mod record;

pub use disk_buffer::{DiskBuffer, DiskBufferConfig, DiskBufferError};
pub use dlq::{AddOutcome, DeadLetterQueue, DlqConfig, DlqEntry, ReprocessStats};
