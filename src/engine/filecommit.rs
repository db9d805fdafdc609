//! engine::filecommit
//!
//! The per-file decision of a commit: reuse a parent's revision or store a
//! new one.
//!
//! # Rules
//!
//! - A file whose content equals its first-parent revision, with no copy
//!   metadata and no second parent, reuses that revision as is.
//! - Copy metadata is re-resolved against the first parent's manifest. In a
//!   merge the second parent's manifest wins when the destination is absent
//!   there or the source is missing from the first. If the source is not
//!   found the copy information is dropped with a warning.
//! - For a merge, when one parent revision is an ancestor of the other, the
//!   descendant is authoritative and the revision gets a single parent.
//! - A flags-only change reuses the revision but still counts as touched.

use crate::core::types::{Node, RepoPath};
use crate::store::{CopySource, Filelog, Manifest, StoreError};

/// One file to commit.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FileInput<'a> {
    pub path: &'a RepoPath,
    pub data: &'a [u8],
    pub flags: &'a str,
    pub copy_source: Option<&'a RepoPath>,
}

/// Decide the revision of `input` and store it if new.
///
/// Paths that change are pushed onto `touched`.
pub(crate) fn commit_file(
    filelog: &mut Filelog,
    input: FileInput<'_>,
    m1: &Manifest,
    m2: &Manifest,
    touched: &mut Vec<RepoPath>,
) -> Result<Node, StoreError> {
    let path = input.path;
    let mut fparent1 = m1.get(path).map(|e| e.node.clone()).unwrap_or_else(Node::null);
    let mut fparent2 = m2.get(path).map(|e| e.node.clone()).unwrap_or_else(Node::null);
    let mut copy = None;

    match input.copy_source.filter(|source| *source != path) {
        Some(source) => {
            // The copy source as of the parent it was copied in
            let mut new_fparent = fparent2.clone();
            let mut source_node = m1.get(source).map(|e| e.node.clone());
            // Copied on the remote side of a merge
            if !m2.is_empty() && (fparent2.is_null() || source_node.is_none()) {
                if let Some(entry) = m2.get(source) {
                    source_node = Some(entry.node.clone());
                    new_fparent = fparent1.clone();
                }
            }
            match source_node {
                Some(node) => {
                    tracing::debug!(path = %path, source = %source, rev = node.short(12), "copy");
                    copy = Some(CopySource {
                        path: source.clone(),
                        node,
                    });
                    fparent1 = Node::null();
                    fparent2 = new_fparent;
                }
                None => {
                    tracing::warn!(
                        "warning: can't find ancestor for '{}' copied from '{}'!",
                        path,
                        source
                    );
                }
            }
        }
        None if fparent1.is_null() => {
            fparent1 = std::mem::replace(&mut fparent2, Node::null());
        }
        None if !fparent2.is_null() => {
            let ancestors = filelog.common_ancestor_heads(path, &fparent1, &fparent2);
            if ancestors.contains(&fparent1) {
                fparent1 = std::mem::replace(&mut fparent2, Node::null());
            } else if ancestors.contains(&fparent2) {
                fparent2 = Node::null();
            }
        }
        None => {}
    }

    let changed = !fparent2.is_null()
        || copy.is_some()
        || fparent1.is_null()
        || filelog.content_differs(path, &fparent1, input.data)?;
    if changed {
        touched.push(path.clone());
        return filelog.add(path, input.data, &fparent1, &fparent2, copy);
    }

    if m1.get(path).is_some_and(|entry| entry.flags != input.flags) {
        tracing::debug!(path = %path, "flags changed");
        touched.push(path.clone());
    } else {
        tracing::debug!(path = %path, rev = fparent1.short(12), "reusing file revision");
    }
    Ok(fparent1)
}
