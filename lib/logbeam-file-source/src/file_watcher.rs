//! Tails a single file from a stored offset, detecting rotation and
//! rate-limiting reads (spec.md §4.I).

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use logbeam_core::entry::SourceKind;
use logbeam_core::{FilePosition, LogEntry};
use tracing::warn;

use crate::fingerprint::fingerprint_path;

pub struct RateLimiter {
    max_lines_per_second: u32,
    quiet_period: Duration,
    window_start: Instant,
    window_count: u32,
    last_warning: Option<Instant>,
    pub dropped_total: u64,
}

impl RateLimiter {
    pub fn new(max_lines_per_second: u32, quiet_period: Duration) -> Self {
        Self {
            max_lines_per_second,
            quiet_period,
            window_start: Instant::now(),
            window_count: 0,
            last_warning: None,
            dropped_total: 0,
        }
    }

    /// Returns `true` if a newly-read line should be kept, `false` if it
    /// should be dropped for exceeding the per-second rate. Emits a
    /// throttle warning at most once per `quiet_period`.
    pub fn allow(&mut self, path: &Path) -> bool {
        if self.max_lines_per_second == 0 {
            return true;
        }
        let now = Instant::now();
        if now.duration_since(self.window_start) >= Duration::from_secs(1) {
            self.window_start = now;
            self.window_count = 0;
        }
        self.window_count += 1;
        if self.window_count <= self.max_lines_per_second {
            return true;
        }
        self.dropped_total += 1;
        let should_warn = self
            .last_warning
            .map(|t| now.duration_since(t) >= self.quiet_period)
            .unwrap_or(true);
        if should_warn {
            warn!(
                path = %path.display(),
                dropped_total = self.dropped_total,
                "file read rate limit exceeded, dropping lines"
            );
            self.last_warning = Some(now);
        }
        false
    }
}

pub struct FileWatcher {
    path: PathBuf,
    reader: BufReader<File>,
    pub position: FilePosition,
    pub labels: BTreeMap<String, String>,
}

impl FileWatcher {
    /// Opens `path` and seeks to `position.offset`, first reconciling the
    /// stored position against the file's current `(inode, device, size)`
    /// — resetting to 0 if rotation is detected.
    pub fn open(
        path: PathBuf,
        mut position: FilePosition,
        labels: BTreeMap<String, String>,
    ) -> std::io::Result<Self> {
        let (dev, ino, size) = fingerprint_path(&path)?;
        position.observe(ino, dev, size);

        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(position.offset))?;
        Ok(Self {
            path,
            reader: BufReader::new(file),
            position,
            labels,
        })
    }

    /// Re-checks the file's current identity/size against the stored
    /// position; if rotation is detected, reopens the file from the start.
    /// Returns `true` if a reopen occurred.
    pub fn reconcile_rotation(&mut self) -> std::io::Result<bool> {
        let (dev, ino, size) = fingerprint_path(&self.path)?;
        let rotated = self.position.observe(ino, dev, size);
        if rotated {
            let mut file = File::open(&self.path)?;
            file.seek(SeekFrom::Start(0))?;
            self.reader = BufReader::new(file);
        }
        Ok(rotated)
    }

    /// Reads all complete lines currently available, advancing the stored
    /// position and tagging each with `path`/`source_type=file`/the
    /// watcher's labels. Returns the entries it produced (after
    /// rate-limiting) and the count of lines dropped for exceeding the
    /// rate limit this call.
    pub fn read_available(
        &mut self,
        limiter: &mut RateLimiter,
    ) -> std::io::Result<Vec<LogEntry>> {
        let mut out = Vec::new();
        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line)?;
            if n == 0 {
                break;
            }
            if !line.ends_with('\n') {
                // Partial line at EOF; rewind so the next call re-reads it
                // once the writer flushes the rest.
                let pos = self.reader.stream_position()?;
                self.reader.seek(SeekFrom::Start(pos - n as u64))?;
                break;
            }
            let trimmed = line.trim_end_matches(['\n', '\r']);
            self.position.advance(n as u64);
            if trimmed.is_empty() {
                continue;
            }
            if !limiter.allow(&self.path) {
                continue;
            }
            let mut entry = match LogEntry::new(SourceKind::File, self.path.to_string_lossy(), trimmed) {
                Ok(e) => e,
                Err(_) => continue,
            };
            entry.labels.insert("path".to_string(), self.path.to_string_lossy().to_string());
            entry.labels.insert("source_type".to_string(), "file".to_string());
            for (k, v) in &self.labels {
                entry.labels.insert(k.clone(), v.clone());
            }
            out.push(entry);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_lines(path: &Path, lines: &[&str]) {
        let mut f = OpenOptions::new().create(true).append(true).open(path).unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
    }

    #[test]
    fn reads_lines_from_start() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.log");
        write_lines(&path, &["one", "two"]);

        let mut watcher = FileWatcher::open(path.clone(), FilePosition::new(0, 0), BTreeMap::new()).unwrap();
        let mut limiter = RateLimiter::new(0, Duration::from_secs(1));
        let entries = watcher.read_available(&mut limiter).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "one");
        assert_eq!(entries[0].labels.get("source_type").unwrap(), "file");
    }

    #[test]
    fn resumes_from_stored_offset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.log");
        write_lines(&path, &["one", "two"]);

        let mut first = FileWatcher::open(path.clone(), FilePosition::new(0, 0), BTreeMap::new()).unwrap();
        let mut limiter = RateLimiter::new(0, Duration::from_secs(1));
        first.read_available(&mut limiter).unwrap();
        let saved_position = first.position;

        write_lines(&path, &["three"]);
        let mut second = FileWatcher::open(path, saved_position, BTreeMap::new()).unwrap();
        let entries = second.read_available(&mut limiter).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "three");
    }

    #[test]
    fn rotation_detected_on_truncate_and_rewrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.log");
        write_lines(&path, &["one", "two", "three"]);

        let mut watcher = FileWatcher::open(path.clone(), FilePosition::new(0, 0), BTreeMap::new()).unwrap();
        let mut limiter = RateLimiter::new(0, Duration::from_secs(1));
        watcher.read_available(&mut limiter).unwrap();

        std::fs::write(&path, b"").unwrap();
        write_lines(&path, &["restarted"]);

        let rotated = watcher.reconcile_rotation().unwrap();
        assert!(rotated);
        assert_eq!(watcher.position.offset, 0);

        let entries = watcher.read_available(&mut limiter).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "restarted");
    }

    #[test]
    fn rate_limiter_drops_beyond_threshold_and_counts() {
        let path = PathBuf::from("/tmp/fake.log");
        let mut limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.allow(&path));
        assert!(limiter.allow(&path));
        assert!(!limiter.allow(&path));
        assert_eq!(limiter.dropped_total, 1);
    }

    #[test]
    fn partial_trailing_line_is_not_emitted_until_newline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.log");
        {
            let mut f = File::create(&path).unwrap();
            write!(f, "complete\nincomplete").unwrap();
        }
        let mut watcher = FileWatcher::open(path, FilePosition::new(0, 0), BTreeMap::new()).unwrap();
        let mut limiter = RateLimiter::new(0, Duration::from_secs(1));
        let entries = watcher.read_available(&mut limiter).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "complete");
    }
}
