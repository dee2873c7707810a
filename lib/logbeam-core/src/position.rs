use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Active,
    Idle,
    Removed,
    Errored,
}

/// Per-file read position. `offset` must never exceed `size` of the file
/// identified by `(inode, device)`; see `Self::observe` for the rotation
/// contract from spec.md §4.A.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilePosition {
    pub offset: u64,
    pub size: u64,
    pub inode: u64,
    pub device: u64,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub last_modified: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub last_read: DateTime<Utc>,
    pub bytes_read: u64,
    pub log_count: u64,
    pub status: SourceStatus,
}

impl FilePosition {
    pub fn new(inode: u64, device: u64) -> Self {
        let now = Utc::now();
        Self {
            offset: 0,
            size: 0,
            inode,
            device,
            last_modified: now,
            last_read: now,
            bytes_read: 0,
            log_count: 0,
            status: SourceStatus::Active,
        }
    }

    /// Applies a freshly-observed `(inode, device, size)` triple to this
    /// position. Returns `true` if rotation was detected and the offset was
    /// reset to 0, per spec.md invariant 1.
    pub fn observe(&mut self, inode: u64, device: u64, size: u64) -> bool {
        let identity_changed = inode != self.inode || device != self.device;
        let truncated = size < self.offset;
        self.inode = inode;
        self.device = device;
        self.size = size;
        if identity_changed || truncated {
            self.offset = 0;
            true
        } else {
            false
        }
    }

    pub fn advance(&mut self, n: u64) {
        self.offset += n;
        self.bytes_read += n;
        self.log_count += 1;
        self.last_read = Utc::now();
    }
}

/// Per-container read position. `since_timestamp` is the exclusive lower
/// bound passed to the next container log stream request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerPosition {
    pub container_id: String,
    pub name: String,
    pub image: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub since_timestamp: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub last_read: DateTime<Utc>,
    pub bytes_read: u64,
    pub log_count: u64,
    pub status: SourceStatus,
}

impl ContainerPosition {
    pub fn new(container_id: impl Into<String>, name: impl Into<String>, image: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            container_id: container_id.into(),
            name: name.into(),
            image: image.into(),
            since_timestamp: now,
            last_read: now,
            bytes_read: 0,
            log_count: 0,
            status: SourceStatus::Active,
        }
    }

    pub fn advance(&mut self, new_since: DateTime<Utc>, bytes: u64) {
        self.since_timestamp = new_since;
        self.bytes_read += bytes;
        self.log_count += 1;
        self.last_read = Utc::now();
    }
}
