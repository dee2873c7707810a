//! Append-only, rotated, checksummed disk buffer (spec.md §4.B).
//!
//! Records are packed sequentially into `buffer-data-{seq}.dat` files under
//! a configured directory; a file is rotated once it reaches
//! `max_file_size`. A retention loop removes files older than
//! `retention_period`, or the oldest files once the directory exceeds
//! `max_total_size`. On startup, `recover` scans the directory in sequence
//! order and yields every valid record, skipping (and counting) any with a
//! bad checksum.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use snafu::{ResultExt, Snafu};
use tracing::{info, warn};

use crate::record::{read_record, write_record, RecordStatus};

const FILE_PREFIX: &str = "buffer-data-";
const FILE_SUFFIX: &str = ".dat";

#[derive(Debug, Snafu)]
pub enum DiskBufferError {
    #[snafu(display("failed to create disk buffer directory {}: {}", path.display(), source))]
    CreateDir { path: PathBuf, source: std::io::Error },
    #[snafu(display("failed to open disk buffer file {}: {}", path.display(), source))]
    OpenFile { path: PathBuf, source: std::io::Error },
    #[snafu(display("failed to write to disk buffer file {}: {}", path.display(), source))]
    Write { path: PathBuf, source: std::io::Error },
}

pub struct DiskBufferConfig {
    pub directory: PathBuf,
    pub max_file_size: u64,
    pub max_total_size: u64,
    pub retention_period: Duration,
}

/// A single rotated, append-only disk buffer instance.
pub struct DiskBuffer {
    config: DiskBufferConfig,
    current_seq: u64,
    current_file: Option<BufWriter<File>>,
    current_size: u64,
}

impl DiskBuffer {
    pub fn open(config: DiskBufferConfig) -> Result<Self, DiskBufferError> {
        fs::create_dir_all(&config.directory).context(CreateDirSnafu {
            path: config.directory.clone(),
        })?;
        let current_seq = highest_sequence(&config.directory).map(|s| s + 1).unwrap_or(0);
        Ok(Self {
            config,
            current_seq,
            current_file: None,
            current_size: 0,
        })
    }

    fn file_path(&self, seq: u64) -> PathBuf {
        self.config.directory.join(format!("{FILE_PREFIX}{seq:020}{FILE_SUFFIX}"))
    }

    fn ensure_open(&mut self) -> Result<(), DiskBufferError> {
        if self.current_file.is_some() {
            return Ok(());
        }
        let path = self.file_path(self.current_seq);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context(OpenFileSnafu { path: path.clone() })?;
        self.current_size = file.metadata().map(|m| m.len()).unwrap_or(0);
        self.current_file = Some(BufWriter::new(file));
        Ok(())
    }

    /// Appends `payload` as one record, rotating to a new file first if the
    /// current file has reached `max_file_size`.
    pub fn append(&mut self, payload: &[u8]) -> Result<(), DiskBufferError> {
        self.ensure_open()?;
        if self.current_size >= self.config.max_file_size {
            self.rotate()?;
        }
        let path = self.file_path(self.current_seq);
        let writer = self.current_file.as_mut().expect("ensured open");
        let before = writer.get_ref().metadata().map(|m| m.len()).unwrap_or(0);
        write_record(writer, payload).context(WriteSnafu { path: path.clone() })?;
        writer.flush().context(WriteSnafu { path })?;
        let written = payload.len() as u64 + 8;
        self.current_size = before + written;
        Ok(())
    }

    fn rotate(&mut self) -> Result<(), DiskBufferError> {
        if let Some(mut writer) = self.current_file.take() {
            let path = self.file_path(self.current_seq);
            writer.flush().context(WriteSnafu { path })?;
        }
        self.current_seq += 1;
        self.current_size = 0;
        self.ensure_open()
    }

    /// Scans every rotated file in sequence order, yielding each valid
    /// record's payload. Bad-CRC records are skipped and logged, matching
    /// spec.md's `on startup, scan the directory, validate records` contract.
    pub fn recover(directory: &Path) -> Result<Vec<Vec<u8>>, DiskBufferError> {
        let mut out = Vec::new();
        for path in list_files(directory) {
            let file = File::open(&path).context(OpenFileSnafu { path: path.clone() })?;
            let mut reader = BufReader::new(file);
            let mut skipped = 0u64;
            loop {
                match read_record(&mut reader) {
                    Ok(Some((RecordStatus::Valid, payload))) => out.push(payload),
                    Ok(Some((RecordStatus::Corrupted { .. }, _))) => skipped += 1,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(file = %path.display(), error = %e, "disk buffer recovery stopped early on I/O error");
                        break;
                    }
                }
            }
            if skipped > 0 {
                warn!(file = %path.display(), skipped, "skipped corrupted disk buffer records");
            }
        }
        Ok(out)
    }

    /// Removes files older than `retention_period`, then, if the directory
    /// still exceeds `max_total_size`, removes the oldest remaining files
    /// until it doesn't.
    pub fn cleanup(&self) -> std::io::Result<u64> {
        let mut removed = 0u64;
        let now = SystemTime::now();
        let mut remaining: Vec<(PathBuf, SystemTime, u64)> = Vec::new();

        for path in list_files(&self.config.directory) {
            let meta = fs::metadata(&path)?;
            let modified = meta.modified().unwrap_or(now);
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age >= self.config.retention_period {
                fs::remove_file(&path)?;
                removed += 1;
                continue;
            }
            remaining.push((path, modified, meta.len()));
        }

        let mut total: u64 = remaining.iter().map(|(_, _, len)| len).sum();
        if total > self.config.max_total_size {
            remaining.sort_by_key(|(_, modified, _)| *modified);
            for (path, _, len) in remaining {
                if total <= self.config.max_total_size {
                    break;
                }
                fs::remove_file(&path)?;
                total = total.saturating_sub(len);
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "disk buffer retention cleanup removed files");
        }
        Ok(removed)
    }
}

fn list_files(directory: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(directory)
        .into_iter()
        .flatten()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(FILE_PREFIX) && n.ends_with(FILE_SUFFIX))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    files
}

fn highest_sequence(directory: &Path) -> Option<u64> {
    list_files(directory)
        .iter()
        .filter_map(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(FILE_PREFIX))
                .and_then(|n| n.strip_suffix(FILE_SUFFIX))
                .and_then(|n| n.parse::<u64>().ok())
        })
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cfg(dir: &Path) -> DiskBufferConfig {
        DiskBufferConfig {
            directory: dir.to_path_buf(),
            max_file_size: 64,
            max_total_size: 10_000,
            retention_period: Duration::from_secs(3600),
        }
    }

    #[test]
    fn append_and_recover_round_trip() {
        let dir = tempdir().unwrap();
        let mut buf = DiskBuffer::open(cfg(dir.path())).unwrap();
        buf.append(b"entry-one").unwrap();
        buf.append(b"entry-two").unwrap();

        let recovered = DiskBuffer::recover(dir.path()).unwrap();
        assert_eq!(recovered, vec![b"entry-one".to_vec(), b"entry-two".to_vec()]);
    }

    #[test]
    fn rotates_when_file_exceeds_max_size() {
        let dir = tempdir().unwrap();
        let mut buf = DiskBuffer::open(cfg(dir.path())).unwrap();
        for i in 0..20 {
            buf.append(format!("payload-{i}").as_bytes()).unwrap();
        }
        let files = list_files(dir.path());
        assert!(files.len() > 1, "expected rotation to produce multiple files");
    }

    #[test]
    fn corrupted_record_is_skipped_on_recovery() {
        let dir = tempdir().unwrap();
        {
            let mut buf = DiskBuffer::open(cfg(dir.path())).unwrap();
            buf.append(b"good-one").unwrap();
        }
        let files = list_files(dir.path());
        let path = &files[0];
        let mut bytes = fs::read(path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(path, bytes).unwrap();

        let recovered = DiskBuffer::recover(dir.path()).unwrap();
        assert!(recovered.is_empty());
    }

    #[test]
    fn cleanup_removes_oldest_when_over_total_size() {
        let dir = tempdir().unwrap();
        let mut config = cfg(dir.path());
        config.max_total_size = 1;
        config.retention_period = Duration::from_secs(3600);
        let mut writer = DiskBuffer::open(config).unwrap();
        writer.append(b"one").unwrap();
        writer.append(b"two").unwrap();
        let removed = writer.cleanup().unwrap();
        assert!(removed > 0);
    }
}
