//! The file half of the position store (spec.md §4.A): a concurrent map of
//! path -> `FilePosition`, flushed to disk on a timer and on shutdown via
//! write-temp-fsync-rename, with an optional backup copy.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use dashmap::DashMap;
use logbeam_core::FilePosition;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tracing::{error, info, warn};

const STABLE_FILE_NAME: &str = "file_positions.json";
const TMP_FILE_NAME: &str = "file_positions.json.tmp";
const BACKUP_FILE_NAME: &str = "file_positions.json.bak";

#[derive(Debug, Snafu)]
pub enum PositionStoreError {
    #[snafu(display("failed to create position store directory {}: {}", path.display(), source))]
    CreateDir { path: PathBuf, source: std::io::Error },
    #[snafu(display("failed to write position store file {}: {}", path.display(), source))]
    Write { path: PathBuf, source: std::io::Error },
    #[snafu(display("failed to rename position store file into place: {}", source))]
    Rename { source: std::io::Error },
}

#[derive(Debug, Serialize, Deserialize)]
struct OnDisk {
    positions: Vec<(String, FilePosition)>,
}

pub struct FilePositionStore {
    directory: PathBuf,
    positions: DashMap<String, FilePosition>,
    emit_backup: bool,
}

impl FilePositionStore {
    pub fn new(directory: impl Into<PathBuf>, emit_backup: bool) -> Result<Self, PositionStoreError> {
        let directory = directory.into();
        fs::create_dir_all(&directory).context(CreateDirSnafu {
            path: directory.clone(),
        })?;
        Ok(Self {
            directory,
            positions: DashMap::new(),
            emit_backup,
        })
    }

    /// Loads the stable file; on checksum/parse failure, falls back to the
    /// backup; if that too is unusable, resets to empty, per spec.md §4.A.
    pub fn load(&self) {
        let stable = self.directory.join(STABLE_FILE_NAME);
        if self.try_load(&stable) {
            return;
        }
        let backup = self.directory.join(BACKUP_FILE_NAME);
        if self.try_load(&backup) {
            warn!("loaded file positions from backup after stable file failed to parse");
            return;
        }
        error!("file position store unreadable; resetting to empty (critical)");
    }

    fn try_load(&self, path: &Path) -> bool {
        let Ok(bytes) = fs::read(path) else {
            return false;
        };
        let Ok(on_disk) = serde_json::from_slice::<OnDisk>(&bytes) else {
            return false;
        };
        for (key, pos) in on_disk.positions {
            self.positions.insert(key, pos);
        }
        true
    }

    pub fn get(&self, key: &str) -> Option<FilePosition> {
        self.positions.get(key).map(|r| *r.value())
    }

    pub fn update(&self, key: impl Into<String>, pos: FilePosition) {
        self.positions.insert(key.into(), pos);
    }

    pub fn list_active(&self) -> Vec<(String, FilePosition)> {
        self.positions
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    /// Serializes the whole map to a temp file, fsyncs, and atomically
    /// renames over the stable file. Emits a backup copy first if
    /// `emit_backup` is set, matching spec.md's flush contract.
    pub fn flush(&self) -> Result<(), PositionStoreError> {
        let stable = self.directory.join(STABLE_FILE_NAME);
        let tmp = self.directory.join(TMP_FILE_NAME);

        if self.emit_backup && stable.exists() {
            let backup = self.directory.join(BACKUP_FILE_NAME);
            if let Err(e) = fs::copy(&stable, &backup) {
                warn!(error = %e, "failed to write position store backup copy");
            }
        }

        let on_disk = OnDisk {
            positions: self.list_active(),
        };
        let bytes = serde_json::to_vec_pretty(&on_disk).unwrap_or_default();

        {
            let mut file = File::create(&tmp).context(WriteSnafu { path: tmp.clone() })?;
            file.write_all(&bytes).context(WriteSnafu { path: tmp.clone() })?;
            file.sync_all().context(WriteSnafu { path: tmp.clone() })?;
        }
        fs::rename(&tmp, &stable).context(RenameSnafu)?;
        Ok(())
    }

    /// Removes entries whose `last_read` is older than `max_age`.
    pub fn cleanup(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let expired: Vec<String> = self
            .positions
            .iter()
            .filter(|e| e.value().last_read < cutoff)
            .map(|e| e.key().clone())
            .collect();
        for key in &expired {
            self.positions.remove(key);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "position store cleanup removed stale entries");
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn flush_then_load_round_trips_positions() {
        let dir = tempdir().unwrap();
        let store = FilePositionStore::new(dir.path(), true).unwrap();
        store.update("/var/log/a.log", FilePosition::new(1, 1));
        store.flush().unwrap();

        let store2 = FilePositionStore::new(dir.path(), true).unwrap();
        store2.load();
        assert_eq!(store2.get("/var/log/a.log").unwrap().inode, 1);
    }

    #[test]
    fn flush_emits_backup_on_second_flush() {
        let dir = tempdir().unwrap();
        let store = FilePositionStore::new(dir.path(), true).unwrap();
        store.update("/a", FilePosition::new(1, 1));
        store.flush().unwrap();
        store.update("/a", FilePosition::new(2, 2));
        store.flush().unwrap();
        assert!(dir.path().join(BACKUP_FILE_NAME).exists());
    }

    #[test]
    fn corrupted_stable_file_falls_back_to_backup() {
        let dir = tempdir().unwrap();
        let store = FilePositionStore::new(dir.path(), true).unwrap();
        store.update("/a", FilePosition::new(1, 1));
        store.flush().unwrap();
        store.update("/a", FilePosition::new(2, 2));
        store.flush().unwrap(); // now backup has inode=1, stable has inode=2

        fs::write(dir.path().join(STABLE_FILE_NAME), b"not json").unwrap();

        let store2 = FilePositionStore::new(dir.path(), true).unwrap();
        store2.load();
        assert_eq!(store2.get("/a").unwrap().inode, 1);
    }

    #[test]
    fn cleanup_removes_entries_older_than_max_age() {
        let dir = tempdir().unwrap();
        let store = FilePositionStore::new(dir.path(), false).unwrap();
        let mut old = FilePosition::new(1, 1);
        old.last_read = Utc::now() - chrono::Duration::days(2);
        store.update("/old", old);
        store.update("/new", FilePosition::new(2, 2));

        let removed = store.cleanup(chrono::Duration::hours(1));
        assert_eq!(removed, 1);
        assert!(store.get("/old").is_none());
        assert!(store.get("/new").is_some());
    }
}
