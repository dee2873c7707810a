//! Identifies a file by `(device, inode)` so that rotation (rename,
//! truncate-and-recreate) can be distinguished from ordinary growth, per
//! spec.md §3's `FilePosition` invariant.

use std::fs::Metadata;
use std::path::Path;

#[cfg(unix)]
pub fn fingerprint(metadata: &Metadata) -> (u64, u64) {
    use std::os::unix::fs::MetadataExt;
    (metadata.dev(), metadata.ino())
}

#[cfg(not(unix))]
pub fn fingerprint(_metadata: &Metadata) -> (u64, u64) {
    // Non-unix platforms have no stable inode; callers fall back to
    // size-only rotation detection (still correct, just less precise).
    (0, 0)
}

pub fn fingerprint_path(path: &Path) -> std::io::Result<(u64, u64, u64)> {
    let meta = std::fs::metadata(path)?;
    let (dev, ino) = fingerprint(&meta);
    Ok((dev, ino, meta.len()))
}
