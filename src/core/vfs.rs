//! core::vfs
//!
//! File helpers shared by the stores, the journal and the caches.
//!
//! - [`FileStamp`] - cheap stat signature (length, mtime, inode)
//! - [`atomic_write`] - temp file + fsync + rename + directory fsync
//!
//! # Invariants
//!
//! - Readers never observe a half-written small file
//! - After [`atomic_write`] the new stat signature differs from the old one,
//!   even when the rewrite lands within the filesystem's mtime granularity

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Stat signature of a file used to detect out-of-process changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileStamp {
    Missing,
    Present { len: u64, mtime_ns: u128, ino: u64 },
}

impl FileStamp {
    /// Stat `path`. A missing file is a valid signature, not an error.
    pub fn of(path: &Path) -> io::Result<Self> {
        match fs::metadata(path) {
            Ok(meta) => {
                let mtime_ns = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_nanos())
                    .unwrap_or_default();
                Ok(FileStamp::Present {
                    len: meta.len(),
                    mtime_ns,
                    ino: inode(&meta),
                })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(FileStamp::Missing),
            Err(e) => Err(e),
        }
    }

    pub fn exists(&self) -> bool {
        matches!(self, FileStamp::Present { .. })
    }
}

impl std::fmt::Display for FileStamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileStamp::Missing => f.write_str("-"),
            FileStamp::Present { len, mtime_ns, ino } => write!(f, "{}:{}:{}", len, mtime_ns, ino),
        }
    }
}

#[cfg(unix)]
fn inode(meta: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn inode(_meta: &fs::Metadata) -> u64 {
    0
}

/// Read a file, mapping "not found" to `None`.
pub fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Remove a file, ignoring "not found".
pub fn remove_optional(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Fsync a directory so a rename inside it is durable.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

/// Atomically replace `path` with `data`.
///
/// Writes a sibling temp file, fsyncs it, renames it over `path` and fsyncs
/// the parent directory. If the resulting stat signature is identical to the
/// previous one, the mtime is advanced so stat-keyed caches notice.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    let before = FileStamp::of(path)?;
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{}.tmp", file_name));
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    sync_dir(parent)?;

    let after = FileStamp::of(path)?;
    if before == after {
        avoid_ambiguity(path, after)?;
    }
    Ok(())
}

/// Bump the mtime of `path` by one millisecond past `stamp`.
fn avoid_ambiguity(path: &Path, stamp: FileStamp) -> io::Result<()> {
    if let FileStamp::Present { mtime_ns, .. } = stamp {
        let bumped = UNIX_EPOCH
            + Duration::from_nanos(u64::try_from(mtime_ns).unwrap_or(u64::MAX))
            + Duration::from_millis(1);
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_modified(bumped.max(SystemTime::now()))?;
    }
    Ok(())
}

/// Copy `from` over `to` and fsync the result.
pub fn copy_synced(from: &Path, to: &Path) -> io::Result<()> {
    let data = fs::read(from)?;
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(to)?;
    file.write_all(&data)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn stamp_of_missing_file() {
        let temp = TempDir::new().expect("temp dir");
        let stamp = FileStamp::of(&temp.path().join("nope")).expect("stat");
        assert_eq!(stamp, FileStamp::Missing);
        assert!(!stamp.exists());
    }

    #[test]
    fn atomic_write_creates_parent_and_content() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join("sub").join("file");
        atomic_write(&path, b"hello").expect("write");
        assert_eq!(fs::read(&path).expect("read"), b"hello");
        assert!(!temp.path().join("sub").join(".file.tmp").exists());
    }

    #[test]
    fn rewrite_with_same_content_changes_stamp() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join("file");
        atomic_write(&path, b"same").expect("first write");
        let first = FileStamp::of(&path).expect("stat");
        atomic_write(&path, b"same").expect("second write");
        let second = FileStamp::of(&path).expect("stat");
        assert_ne!(first, second);
    }

    #[test]
    fn read_and_remove_optional() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join("f");
        assert_eq!(read_optional(&path).expect("read"), None);
        remove_optional(&path).expect("remove missing is fine");
        fs::write(&path, b"x").expect("write");
        assert_eq!(read_optional(&path).expect("read"), Some(b"x".to_vec()));
        remove_optional(&path).expect("remove");
        assert!(!path.exists());
    }
}
