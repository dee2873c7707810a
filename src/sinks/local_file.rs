//! Local-file sink (spec.md §4.M): writes each label-set stream to its
//! own file, with an LRU-bounded pool of open handles, size/count-based
//! rotation, age-based retention, and a total-disk-size guard.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use logbeam_core::batch::Batch;
use logbeam_core::entry::LogEntry;
use logbeam_core::labels::stream_key;
use parking_lot::Mutex;
use snafu::{ResultExt, Snafu};
use tracing::{debug, warn};

use crate::config::{LocalFileSinkConfig, OutputFormat};
use crate::sinks::{Sink, SinkError, SinkStats};

#[derive(Debug, Snafu)]
pub enum LocalFileSinkError {
    #[snafu(display("failed to create sink directory {}: {}", dir, source))]
    CreateDir { dir: String, source: std::io::Error },
    #[snafu(display("failed to open stream file {}: {}", path.display(), source))]
    Open { path: PathBuf, source: std::io::Error },
    #[snafu(display("failed to write stream file {}: {}", path.display(), source))]
    Write { path: PathBuf, source: std::io::Error },
}

struct OpenHandle {
    file: File,
    path: PathBuf,
    bytes_written: u64,
    last_used: u64,
}

/// An LRU-bounded pool of open file handles, one per stream key.
struct HandlePool {
    max_open: usize,
    clock: u64,
    handles: HashMap<u64, OpenHandle>,
}

impl HandlePool {
    fn new(max_open: usize) -> Self {
        Self { max_open, clock: 0, handles: HashMap::new() }
    }

    fn evict_one(&mut self) {
        if let Some((&key, _)) = self.handles.iter().min_by_key(|(_, h)| h.last_used) {
            self.handles.remove(&key);
        }
    }

    fn get_or_open(
        &mut self,
        key: u64,
        path_fn: impl FnOnce() -> PathBuf,
    ) -> Result<&mut OpenHandle, LocalFileSinkError> {
        self.clock += 1;
        let clock = self.clock;
        if !self.handles.contains_key(&key) {
            if self.handles.len() >= self.max_open {
                self.evict_one();
            }
            let path = path_fn();
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .context(OpenSnafu { path: path.clone() })?;
            let bytes_written = file.metadata().map(|m| m.len()).unwrap_or(0);
            self.handles.insert(key, OpenHandle { file, path, bytes_written, last_used: clock });
        }
        let handle = self.handles.get_mut(&key).expect("just inserted or present");
        handle.last_used = clock;
        Ok(handle)
    }

    fn close(&mut self, key: u64) {
        self.handles.remove(&key);
    }
}

fn stream_directory(base: &Path, labels: &std::collections::BTreeMap<String, String>) -> PathBuf {
    let key = stream_key(labels);
    base.join(format!("stream-{key:016x}"))
}

fn render_line(entry: &LogEntry, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => serde_json::to_string(entry).unwrap_or_else(|_| entry.message.clone()),
        OutputFormat::Text => format!(
            "{} [{:?}] {}: {}",
            entry.event_timestamp.to_rfc3339(),
            entry.level,
            entry.source_id,
            entry.message
        ),
    }
}

pub struct LocalFileSink {
    config: LocalFileSinkConfig,
    pool: Mutex<HandlePool>,
    batches_sent: AtomicU64,
    batches_failed: AtomicU64,
    entries_sent: AtomicU64,
    bytes_sent: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl LocalFileSink {
    pub fn new(config: LocalFileSinkConfig) -> Self {
        let max_open = config.max_open_files;
        Self {
            config,
            pool: Mutex::new(HandlePool::new(max_open)),
            batches_sent: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
            entries_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    fn total_disk_bytes(&self) -> u64 {
        walk_size(Path::new(&self.config.directory)).unwrap_or(0)
    }

    fn over_disk_budget(&self) -> bool {
        self.total_disk_bytes() >= self.config.max_total_disk_gb * 1024 * 1024 * 1024
    }

    /// Removes the oldest rotated file under the sink directory; used when
    /// the total-disk-size guard trips.
    fn emergency_cleanup(&self) {
        let dir = Path::new(&self.config.directory);
        let mut entries: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
        if let Ok(read_dir) = fs::read_dir(dir) {
            for entry in read_dir.flatten() {
                if let Ok(meta) = entry.metadata() {
                    if let Ok(modified) = meta.modified() {
                        entries.push((entry.path(), modified));
                    }
                }
            }
        }
        entries.sort_by_key(|(_, modified)| *modified);
        if let Some((path, _)) = entries.first() {
            warn!(path = %path.display(), "local file sink over disk budget, removing oldest file");
            let _ = fs::remove_file(path);
        }
    }

    fn maybe_rotate(&self, pool: &mut HandlePool, key: u64, path: &Path) -> Result<(), LocalFileSinkError> {
        let max_bytes = self.config.rotation.max_size_mb * 1024 * 1024;
        let needs_rotation = pool.handles.get(&key).map(|h| h.bytes_written >= max_bytes).unwrap_or(false);
        if !needs_rotation {
            return Ok(());
        }
        pool.close(key);
        let rotated_name = format!("{}.{}", path.display(), Utc::now().format("%Y%m%d%H%M%S"));
        let _ = fs::rename(path, &rotated_name);
        self.enforce_file_count(path);
        Ok(())
    }

    fn enforce_file_count(&self, path: &Path) {
        let dir = match path.parent() {
            Some(dir) => dir,
            None => return,
        };
        let stem = path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
        let mut rotated: Vec<PathBuf> = fs::read_dir(dir)
            .into_iter()
            .flatten()
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&stem) && n != stem)
                    .unwrap_or(false)
            })
            .collect();
        rotated.sort();
        while rotated.len() as u32 > self.config.rotation.max_files {
            let oldest = rotated.remove(0);
            let _ = fs::remove_file(oldest);
        }
    }
}

fn walk_size(dir: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    if !dir.exists() {
        return Ok(0);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_file() {
            total += meta.len();
        } else if meta.is_dir() {
            total += walk_size(&entry.path())?;
        }
    }
    Ok(total)
}

#[async_trait]
impl Sink for LocalFileSink {
    async fn start(&self) -> Result<(), SinkError> {
        fs::create_dir_all(&self.config.directory)
            .context(CreateDirSnafu { dir: self.config.directory.clone() })
            .map_err(|e| SinkError::Permanent { message: e.to_string() })
    }

    async fn stop(&self) -> Result<(), SinkError> {
        self.pool.lock().handles.clear();
        Ok(())
    }

    async fn send(&self, batch: &Batch) -> Result<(), SinkError> {
        if self.over_disk_budget() {
            self.emergency_cleanup();
        }

        let base = Path::new(&self.config.directory);
        let mut grouped: HashMap<u64, (std::collections::BTreeMap<String, String>, Vec<&LogEntry>)> = HashMap::new();
        for entry in &batch.entries {
            let key = stream_key(&entry.labels);
            grouped.entry(key).or_insert_with(|| (entry.labels.clone(), Vec::new())).1.push(entry);
        }

        let mut pool = self.pool.lock();
        let mut total_bytes = 0u64;
        for (key, (labels, entries)) in grouped {
            let dir = stream_directory(base, &labels);
            if let Err(err) = fs::create_dir_all(&dir) {
                warn!(error = %err, "failed to create stream directory");
                continue;
            }
            let path = dir.join("current.log");

            if let Err(err) = self.maybe_rotate(&mut pool, key, &path) {
                warn!(error = %err, "rotation failed");
            }

            let handle = match pool.get_or_open(key, || path.clone()) {
                Ok(handle) => handle,
                Err(err) => {
                    *self.last_error.lock() = Some(err.to_string());
                    self.batches_failed.fetch_add(1, Ordering::Relaxed);
                    return Err(SinkError::Retryable { message: err.to_string() });
                }
            };

            for entry in entries {
                let mut line = render_line(entry, self.config.output_format);
                line.push('\n');
                if let Err(err) = handle.file.write_all(line.as_bytes()) {
                    *self.last_error.lock() = Some(err.to_string());
                    self.batches_failed.fetch_add(1, Ordering::Relaxed);
                    return Err(SinkError::Retryable { message: err.to_string() });
                }
                handle.bytes_written += line.len() as u64;
                total_bytes += line.len() as u64;
            }
        }

        debug!(entries = batch.len(), bytes = total_bytes, "wrote local file batch");
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.entries_sent.fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.bytes_sent.fetch_add(total_bytes, Ordering::Relaxed);
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        !self.over_disk_budget()
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

#[cfg(test)]
mod tests {
    use super::*;
    use logbeam_core::entry::SourceKind;
    use tempfile::tempdir;

    fn entry(message: &str) -> LogEntry {
        LogEntry::new(SourceKind::File, "a", message).unwrap()
    }

    #[tokio::test]
    async fn writes_batch_to_stream_file() {
        let dir = tempdir().unwrap();
        let mut config = LocalFileSinkConfig::default();
        config.directory = dir.path().to_string_lossy().to_string();
        config.max_open_files = 10;
        let sink = LocalFileSink::new(config);
        sink.start().await.unwrap();

        let batch = Batch::new("local", vec![entry("one"), entry("two")]);
        sink.send(&batch).await.unwrap();

        assert_eq!(sink.stats().entries_sent, 2);
        assert!(sink.total_disk_bytes() > 0);
    }

    #[tokio::test]
    async fn separate_label_sets_go_to_separate_streams() {
        let dir = tempdir().unwrap();
        let mut config = LocalFileSinkConfig::default();
        config.directory = dir.path().to_string_lossy().to_string();
        let sink = LocalFileSink::new(config);
        sink.start().await.unwrap();

        let mut e1 = entry("one");
        e1.labels.insert("app".into(), "a".into());
        let mut e2 = entry("two");
        e2.labels.insert("app".into(), "b".into());
        let batch = Batch::new("local", vec![e1, e2]);
        sink.send(&batch).await.unwrap();

        let stream_dirs: Vec<_> = fs::read_dir(dir.path()).unwrap().flatten().collect();
        assert_eq!(stream_dirs.len(), 2);
    }

    #[test]
    fn handle_pool_evicts_least_recently_used() {
        let mut pool = HandlePool::new(1);
        let dir = tempdir().unwrap();
        let path_a = dir.path().join("a.log");
        let path_b = dir.path().join("b.log");
        pool.get_or_open(1, || path_a.clone()).unwrap();
        pool.get_or_open(2, || path_b.clone()).unwrap();
        assert_eq!(pool.handles.len(), 1);
        assert!(!pool.handles.contains_key(&1));
    }
}
