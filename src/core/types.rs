//! core::types
//!
//! Strong types for repository identifiers.
//!
//! # Types
//!
//! - [`Node`] - 40-hex commit or file revision identifier
//! - [`TxnId`] - Transaction identifier (`TXN:` + 40 hex)
//! - [`RepoPath`] - Validated repository-relative path
//! - [`BookmarkName`] - Validated bookmark name
//! - [`Phase`] - public / draft / secret
//! - [`UtcTimestamp`] - RFC3339 timestamp
//!
//! # Validation
//!
//! These types enforce validity at construction time. Invalid values
//! cannot be represented.
//!
//! # Examples
//!
//! ```
//! use vcstore::core::types::{Node, Phase, RepoPath};
//!
//! let node = Node::new("abc123def4567890abc123def4567890abc12345").unwrap();
//! let path = RepoPath::new("src/main.rs").unwrap();
//!
//! assert!(Node::new("not-a-node").is_err());
//! assert!(RepoPath::new("../escape").is_err());
//! assert!(Phase::Secret > Phase::Draft);
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

/// Errors from type validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid node: {0}")]
    InvalidNode(String),

    #[error("invalid transaction id: {0}")]
    InvalidTxnId(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid bookmark name: {0}")]
    InvalidBookmark(String),

    #[error("invalid phase: {0}")]
    InvalidPhase(String),
}

/// A commit, manifest or file revision identifier.
///
/// Nodes are 20-byte identifiers rendered as 40 lowercase hex characters.
/// The all-zero node is the null parent.
///
/// # Example
///
/// ```
/// use vcstore::core::types::Node;
///
/// let null = Node::null();
/// assert!(null.is_null());
///
/// let a = Node::hash(&[b"a"]);
/// assert_eq!(a.as_str().len(), 40);
/// assert_eq!(a, Node::hash(&[b"a"]));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Node(String);

impl Node {
    const NULL: &'static str = "0000000000000000000000000000000000000000";

    /// Create a validated node, normalized to lowercase.
    ///
    /// # Errors
    ///
    /// Returns `TypeError::InvalidNode` if the string is not 40 hex characters.
    pub fn new(node: impl Into<String>) -> Result<Self, TypeError> {
        let node = node.into().to_ascii_lowercase();
        if node.len() != 40 {
            return Err(TypeError::InvalidNode(format!(
                "expected 40 hex characters, got {}",
                node.len()
            )));
        }
        if !node.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(TypeError::InvalidNode(format!(
                "'{}' contains non-hex characters",
                node
            )));
        }
        Ok(Self(node))
    }

    /// The null node.
    pub fn null() -> Self {
        Self(Self::NULL.to_string())
    }

    /// Check if this is the null node.
    pub fn is_null(&self) -> bool {
        self.0 == Self::NULL
    }

    /// Derive a node from a sequence of byte chunks.
    ///
    /// Each chunk is length-prefixed so that `["ab", "c"]` and `["a", "bc"]`
    /// hash differently.
    pub fn hash(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..20]))
    }

    /// The first `len` characters.
    pub fn short(&self, len: usize) -> &str {
        &self.0[..len.min(self.0.len())]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `None` for the null node.
    pub fn non_null(self) -> Option<Self> {
        if self.is_null() {
            None
        } else {
            Some(self)
        }
    }
}

impl TryFrom<String> for Node {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Node> for String {
    fn from(node: Node) -> Self {
        node.0
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a transaction.
///
/// The format is `TXN:` followed by 40 hex characters derived from random
/// bytes and the current time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TxnId(String);

impl TxnId {
    const PREFIX: &'static str = "TXN:";

    /// Generate a fresh transaction id.
    pub fn generate() -> Self {
        let random = Uuid::new_v4();
        let nanos = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(random.as_bytes());
        hasher.update(nanos.to_le_bytes());
        let digest = hasher.finalize();
        Self(format!("{}{}", Self::PREFIX, hex::encode(&digest[..20])))
    }

    /// Parse an id read back from disk.
    pub fn parse(s: impl Into<String>) -> Result<Self, TypeError> {
        let s = s.into();
        let valid = s
            .strip_prefix(Self::PREFIX)
            .map(|rest| rest.len() == 40 && rest.chars().all(|c| c.is_ascii_hexdigit()))
            .unwrap_or(false);
        if valid {
            Ok(Self(s))
        } else {
            Err(TypeError::InvalidTxnId(s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TxnId {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<TxnId> for String {
    fn from(id: TxnId) -> Self {
        id.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A repository-relative file path.
///
/// Components are separated by `/`. Absolute paths, empty components,
/// `.`/`..` components and anything under the metadata directory are
/// rejected.
///
/// # Example
///
/// ```
/// use vcstore::core::types::RepoPath;
///
/// let p = RepoPath::new("dir/file.txt").unwrap();
/// assert_eq!(p.parent_dirs().collect::<Vec<_>>(), vec!["dir"]);
/// assert!(RepoPath::new("/etc/passwd").is_err());
/// assert!(RepoPath::new(".vcs/dirstate").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepoPath(String);

impl RepoPath {
    pub fn new(path: impl Into<String>) -> Result<Self, TypeError> {
        let path = path.into();
        if path.is_empty() {
            return Err(TypeError::InvalidPath("path cannot be empty".into()));
        }
        if path.starts_with('/') || path.ends_with('/') {
            return Err(TypeError::InvalidPath(format!(
                "'{}' must be relative without trailing '/'",
                path
            )));
        }
        if path.contains('\\') || path.contains('\0') || path.contains('\n') {
            return Err(TypeError::InvalidPath(format!(
                "'{}' contains a forbidden character",
                path
            )));
        }
        for component in path.split('/') {
            if component.is_empty() || component == "." || component == ".." {
                return Err(TypeError::InvalidPath(format!(
                    "'{}' has an invalid component",
                    path
                )));
            }
        }
        if path == crate::core::paths::LOCAL_DIR
            || path.starts_with(&format!("{}/", crate::core::paths::LOCAL_DIR))
        {
            return Err(TypeError::InvalidPath(format!(
                "'{}' is inside the metadata directory",
                path
            )));
        }
        Ok(Self(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Ancestor directories, nearest last (`a/b/c` yields `a`, `a/b`).
    pub fn parent_dirs(&self) -> impl Iterator<Item = &str> {
        self.0
            .match_indices('/')
            .map(move |(idx, _)| &self.0[..idx])
    }

    /// Check whether this path lives under `dir`.
    pub fn is_under(&self, dir: &str) -> bool {
        self.0.len() > dir.len()
            && self.0.starts_with(dir)
            && self.0.as_bytes()[dir.len()] == b'/'
    }
}

impl TryFrom<String> for RepoPath {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RepoPath> for String {
    fn from(path: RepoPath) -> Self {
        path.0
    }
}

impl fmt::Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A bookmark name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BookmarkName(String);

impl BookmarkName {
    pub fn new(name: impl Into<String>) -> Result<Self, TypeError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(TypeError::InvalidBookmark("name cannot be empty".into()));
        }
        if name.chars().any(|c| c.is_control() || c == ':') {
            return Err(TypeError::InvalidBookmark(format!(
                "'{}' contains a forbidden character",
                name
            )));
        }
        if name.chars().all(|c| c.is_ascii_digit()) {
            return Err(TypeError::InvalidBookmark(format!(
                "'{}' cannot be an integer",
                name
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for BookmarkName {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BookmarkName> for String {
    fn from(name: BookmarkName) -> Self {
        name.0
    }
}

impl fmt::Display for BookmarkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Commit phase.
///
/// Phases are ordered: a commit can never be in a lower phase than its
/// parents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Public,
    Draft,
    Secret,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Public, Phase::Draft, Phase::Secret];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Public => "public",
            Phase::Draft => "draft",
            Phase::Secret => "secret",
        }
    }
}

impl FromStr for Phase {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Phase::Public),
            "draft" => Ok(Phase::Draft),
            "secret" => Ok(Phase::Secret),
            other => Err(TypeError::InvalidPhase(other.to_string())),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A UTC timestamp.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UtcTimestamp(chrono::DateTime<chrono::Utc>);

impl UtcTimestamp {
    pub fn now() -> Self {
        Self(chrono::Utc::now())
    }

    pub fn from_datetime(dt: chrono::DateTime<chrono::Utc>) -> Self {
        Self(dt)
    }

    pub fn as_datetime(&self) -> &chrono::DateTime<chrono::Utc> {
        &self.0
    }

    /// RFC3339 rendering used when hashing commit contents.
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339()
    }
}

impl fmt::Display for UtcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod node {
        use super::*;

        #[test]
        fn valid_node() {
            let node = Node::new("ABC123DEF4567890ABC123DEF4567890ABC12345").expect("valid");
            assert_eq!(node.as_str(), "abc123def4567890abc123def4567890abc12345");
            assert_eq!(node.short(6), "abc123");
        }

        #[test]
        fn rejects_bad_length_and_chars() {
            assert!(Node::new("abc").is_err());
            assert!(Node::new("g".repeat(40)).is_err());
        }

        #[test]
        fn null_node() {
            assert!(Node::null().is_null());
            assert_eq!(Node::null().non_null(), None);
        }

        #[test]
        fn hash_is_length_prefixed() {
            assert_ne!(Node::hash(&[b"ab", b"c"]), Node::hash(&[b"a", b"bc"]));
            assert!(!Node::hash(&[]).is_null());
        }

        #[test]
        fn serde_roundtrip_validates() {
            let node = Node::hash(&[b"x"]);
            let json = serde_json::to_string(&node).expect("serialize");
            let back: Node = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(node, back);
            assert!(serde_json::from_str::<Node>("\"zz\"").is_err());
        }
    }

    mod txn_id {
        use super::*;

        #[test]
        fn generated_ids_have_fixed_format() {
            let id = TxnId::generate();
            assert!(id.as_str().starts_with("TXN:"));
            assert_eq!(id.as_str().len(), 44);
            assert_eq!(TxnId::parse(id.as_str()).expect("parse"), id);
        }

        #[test]
        fn generated_ids_are_unique() {
            assert_ne!(TxnId::generate(), TxnId::generate());
        }

        #[test]
        fn parse_rejects_garbage() {
            assert!(TxnId::parse("TXN:xyz").is_err());
            assert!(TxnId::parse("abc").is_err());
        }
    }

    mod repo_path {
        use super::*;

        #[test]
        fn accepts_nested_paths() {
            let p = RepoPath::new("a/b/c.txt").expect("valid");
            assert_eq!(p.parent_dirs().collect::<Vec<_>>(), vec!["a", "a/b"]);
            assert!(p.is_under("a"));
            assert!(p.is_under("a/b"));
            assert!(!p.is_under("a/b/c"));
        }

        #[test]
        fn is_under_requires_separator() {
            let p = RepoPath::new("ab/c").expect("valid");
            assert!(!p.is_under("a"));
        }

        #[test]
        fn rejects_invalid_paths() {
            for bad in ["", "/abs", "dir/", "a//b", "./a", "a/../b", ".vcs", ".vcs/store"] {
                assert!(RepoPath::new(bad).is_err(), "{bad} should be rejected");
            }
        }
    }

    mod bookmark {
        use super::*;

        #[test]
        fn valid_and_invalid_names() {
            assert!(BookmarkName::new("main").is_ok());
            assert!(BookmarkName::new("").is_err());
            assert!(BookmarkName::new("a:b").is_err());
            assert!(BookmarkName::new("123").is_err());
        }
    }

    mod phase {
        use super::*;

        #[test]
        fn ordering_and_parsing() {
            assert!(Phase::Public < Phase::Draft);
            assert!(Phase::Draft < Phase::Secret);
            assert_eq!("draft".parse::<Phase>().expect("parse"), Phase::Draft);
            assert!("hidden".parse::<Phase>().is_err());
        }

        #[test]
        fn serializes_lowercase() {
            assert_eq!(
                serde_json::to_string(&Phase::Secret).expect("serialize"),
                "\"secret\""
            );
        }
    }
}
