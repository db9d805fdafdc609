//! store::log
//!
//! Buffered append-only JSON-lines file.
//!
//! Entries pushed during a transaction stay in memory until [`AppendLog::flush`]
//! writes them (one JSON object per line) and fsyncs. The on-disk length
//! before the transaction is what the journal truncates back to.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::StoreError;
use crate::core::vfs::FileStamp;

#[derive(Debug)]
pub struct AppendLog<T> {
    path: PathBuf,
    entries: Vec<T>,
    flushed: usize,
    stamp: FileStamp,
}

impl<T> AppendLog<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Load every entry from `path`. A missing file is an empty log.
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let stamp = FileStamp::of(&path)?;
        let entries = Self::read_entries(&path)?;
        Ok(Self {
            flushed: entries.len(),
            path,
            entries,
            stamp,
        })
    }

    fn read_entries(path: &Path) -> Result<Vec<T>, StoreError> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if !data.is_empty() && data.last() != Some(&b'\n') {
            return Err(StoreError::Corrupt {
                file: path.display().to_string(),
                message: "truncated final entry".to_string(),
            });
        }

        let mut entries = Vec::new();
        for (lineno, line) in data.split(|b| *b == b'\n').enumerate() {
            if line.is_empty() {
                continue;
            }
            let entry = serde_json::from_slice(line).map_err(|e| StoreError::Corrupt {
                file: path.display().to_string(),
                message: format!("line {}: {}", lineno + 1, e),
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[T] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Buffer an entry; returns its index.
    pub fn push(&mut self, entry: T) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    /// Number of buffered entries not yet on disk.
    pub fn pending_len(&self) -> usize {
        self.entries.len() - self.flushed
    }

    /// Append buffered entries to the file and fsync.
    pub fn flush(&mut self) -> Result<usize, StoreError> {
        let pending = self.pending_len();
        if pending == 0 {
            return Ok(0);
        }
        let mut buf = Vec::new();
        for entry in &self.entries[self.flushed..] {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        self.flushed = self.entries.len();
        self.stamp = FileStamp::of(&self.path)?;
        Ok(pending)
    }

    /// Whether the file changed on disk since it was loaded or last flushed.
    pub fn is_stale(&self) -> Result<bool, StoreError> {
        Ok(FileStamp::of(&self.path)? != self.stamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        n: u32,
    }

    #[test]
    fn buffered_until_flush() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join("log");
        let mut log: AppendLog<Item> = AppendLog::open(path.clone()).expect("open");
        log.push(Item { n: 1 });
        log.push(Item { n: 2 });
        assert_eq!(log.pending_len(), 2);
        assert!(!path.exists());

        assert_eq!(log.flush().expect("flush"), 2);
        assert_eq!(log.pending_len(), 0);
        assert_eq!(fs::read_to_string(&path).expect("read"), "{\"n\":1}\n{\"n\":2}\n");

        let reopened: AppendLog<Item> = AppendLog::open(path).expect("reopen");
        assert_eq!(reopened.entries(), log.entries());
    }

    #[test]
    fn truncated_tail_is_corrupt() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join("log");
        fs::write(&path, "{\"n\":1}\n{\"n\":").expect("write");
        let result: Result<AppendLog<Item>, _> = AppendLog::open(path);
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn detects_external_writes() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join("log");
        let mut log: AppendLog<Item> = AppendLog::open(path.clone()).expect("open");
        log.push(Item { n: 1 });
        log.flush().expect("flush");
        assert!(!log.is_stale().expect("stale"));

        let mut other = OpenOptions::new().append(true).open(&path).expect("open");
        other.write_all(b"{\"n\":9}\n").expect("append");
        assert!(log.is_stale().expect("stale"));
    }
}
