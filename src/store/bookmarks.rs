//! store::bookmarks
//!
//! Named pointers to commits, stored as one JSON object in
//! `store/bookmarks`. Every change rewrites the file atomically.

use std::collections::BTreeMap;
use std::path::PathBuf;

use super::StoreError;
use crate::core::paths::RepoPaths;
use crate::core::types::{BookmarkName, Node};
use crate::core::vfs::{self, FileStamp};

#[derive(Debug)]
pub struct Bookmarks {
    path: PathBuf,
    marks: BTreeMap<BookmarkName, Node>,
    stamp: FileStamp,
}

impl Bookmarks {
    pub fn load(paths: &RepoPaths) -> Result<Self, StoreError> {
        let path = paths.store_file("bookmarks");
        let stamp = FileStamp::of(&path)?;
        let marks = match vfs::read_optional(&path)? {
            Some(data) => serde_json::from_slice(&data)?,
            None => BTreeMap::new(),
        };
        Ok(Self { path, marks, stamp })
    }

    pub fn write(&mut self) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(&self.marks)?;
        vfs::atomic_write(&self.path, &data)?;
        self.stamp = FileStamp::of(&self.path)?;
        Ok(())
    }

    pub fn is_stale(&self) -> Result<bool, StoreError> {
        Ok(FileStamp::of(&self.path)? != self.stamp)
    }

    pub fn get(&self, name: &BookmarkName) -> Option<&Node> {
        self.marks.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BookmarkName, &Node)> {
        self.marks.iter()
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    /// Point `name` at `node`. Returns the previous target.
    pub fn set(&mut self, name: BookmarkName, node: Node) -> Result<Option<Node>, StoreError> {
        let old = self.marks.insert(name, node.clone());
        if old.as_ref() != Some(&node) {
            self.write()?;
        }
        Ok(old)
    }

    /// Delete `name`. Returns its target if it existed.
    pub fn remove(&mut self, name: &BookmarkName) -> Result<Option<Node>, StoreError> {
        let old = self.marks.remove(name);
        if old.is_some() {
            self.write()?;
        }
        Ok(old)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn set_remove_and_reload() {
        let temp = TempDir::new().expect("temp dir");
        let paths = RepoPaths::new(temp.path());
        let mut marks = Bookmarks::load(&paths).expect("load");
        let main = BookmarkName::new("main").expect("name");
        let a = Node::hash(&[b"a"]);
        let b = Node::hash(&[b"b"]);

        assert_eq!(marks.set(main.clone(), a.clone()).expect("set"), None);
        assert_eq!(marks.set(main.clone(), b.clone()).expect("set"), Some(a));

        let reloaded = Bookmarks::load(&paths).expect("reload");
        assert_eq!(reloaded.get(&main), Some(&b));

        assert_eq!(marks.remove(&main).expect("remove"), Some(b));
        assert!(marks.is_empty());
        assert!(Bookmarks::load(&paths).expect("reload").is_empty());
    }

    #[test]
    fn external_write_makes_stale() {
        let temp = TempDir::new().expect("temp dir");
        let paths = RepoPaths::new(temp.path());
        let mut marks = Bookmarks::load(&paths).expect("load");
        marks.write().expect("write");
        assert!(!marks.is_stale().expect("stale"));

        let mut other = Bookmarks::load(&paths).expect("load");
        other
            .set(BookmarkName::new("x").expect("name"), Node::hash(&[b"x"]))
            .expect("set");
        assert!(marks.is_stale().expect("stale"));
    }
}
