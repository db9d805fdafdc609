//! Integration tests for crash recovery and rollback.
//!
//! A crash is simulated by dropping a repository instance while its
//! transaction is open: the lock files are unlocked by the OS-level drop,
//! the journal stays on disk, exactly as after a killed process.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};
use tempfile::TempDir;

use vcstore::core::config::Config;
use vcstore::core::ops::{BackupSet, Journal};
use vcstore::core::types::{Node, RepoPath, UtcTimestamp};
use vcstore::engine::{CommitContext, CommitRequest, FileChange, RepoError, Repository};
use vcstore::store::GraphStore;
use vcstore::workingcopy::Matcher;

// =============================================================================
// Test Helpers
// =============================================================================

struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    fn new() -> (Self, Repository) {
        let dir = TempDir::new().expect("create temp dir");
        let repo = Repository::init_with_config(dir.path(), config()).expect("init");
        (Self { dir }, repo)
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn reopen(&self) -> Repository {
        Repository::open_with_config(self.path(), config()).expect("reopen")
    }

    fn write(&self, name: &str, data: &str) {
        fs::write(self.path().join(name), data).expect("write working file");
    }

    /// SHA-256 of the store files proper: no lock, no undo generation.
    fn store_digest(&self) -> BTreeMap<String, String> {
        let store = self.path().join(".vcs").join("store");
        let mut digest = BTreeMap::new();
        for entry in fs::read_dir(store).expect("read store") {
            let entry = entry.expect("entry");
            let name = entry.file_name().to_string_lossy().to_string();
            if name == "lock" || name.starts_with("undo") {
                continue;
            }
            let data = fs::read(entry.path()).expect("read store file");
            digest.insert(name, hex::encode(Sha256::digest(&data)));
        }
        digest
    }
}

fn config() -> Config {
    Config::from_repo_toml("[ui]\nusername = \"test <test@example.com>\"\n").expect("config")
}

fn path(p: &str) -> RepoPath {
    RepoPath::new(p).expect("path")
}

fn commit_file(t: &TestRepo, repo: &mut Repository, data: &str) -> Node {
    t.write("a", data);
    repo.add(&[path("a")]).expect("add");
    repo.commit(CommitRequest::new(format!("set a to {}", data)))
        .expect("commit")
        .expect("something to commit")
}

/// Leave a transaction open with flushed data, then drop the instance.
fn crash_mid_transaction(mut repo: Repository, parent: &Node) {
    let guard = repo.lock(true).expect("lock");
    let handle = repo.transaction("crashing", false).expect("open");
    let ctx = CommitContext {
        parents: [parent.clone(), Node::null()],
        user: "test".to_string(),
        date: UtcTimestamp::now(),
        description: "never committed".to_string(),
        extra: BTreeMap::new(),
        files: vec![FileChange::memory(path("b"), "lost")],
        mutation: None,
    };
    // Nested into the open transaction, so nothing is promoted
    let node = repo.commitctx(ctx).expect("commitctx");
    assert!(repo.stores().changelog.contains(&node));
    repo.write_pending().expect("write pending");
    let _ = (guard, handle);
    drop(repo);
}

// =============================================================================
// Recovery
// =============================================================================

#[test]
fn open_recovers_abandoned_transaction() {
    let (t, mut repo) = TestRepo::new();
    let first = commit_file(&t, &mut repo, "1");
    let before = t.store_digest();

    crash_mid_transaction(repo, &first);
    assert!(t.path().join(".vcs/store/journal").exists());

    let repo = t.reopen();
    assert!(!Journal::exists(repo.paths(), BackupSet::Journal));
    assert_eq!(repo.tip(), Some(&first));
    assert_eq!(repo.heads().expect("heads"), vec![first]);
    assert_eq!(t.store_digest(), before);
    assert!(repo.paths().undo_path().exists());
}

#[test]
fn explicit_recover_reports_nothing_to_do() {
    let (_t, mut repo) = TestRepo::new();
    assert!(!repo.recover().expect("recover"));
}

#[test]
fn second_instance_recovers_on_lock() {
    let (t, mut repo) = TestRepo::new();
    let first = commit_file(&t, &mut repo, "1");
    let mut other = t.reopen();

    crash_mid_transaction(repo, &first);

    // The surviving instance replays the journal when it next takes the lock
    let second = commit_file(&t, &mut other, "2");
    assert_eq!(other.stores().changelog.entries().len(), 2);
    assert_eq!(other.heads().expect("heads"), vec![second]);
}

#[test]
fn lockfree_transaction_refuses_abandoned_journal() {
    let (t, mut repo) = TestRepo::new();
    let first = commit_file(&t, &mut repo, "1");
    let mut other = t.reopen();
    crash_mid_transaction(repo, &first);

    let err = other
        .with_lockfree_transaction("fast", |_| Ok(()))
        .expect_err("abandoned journal");
    assert!(err.to_string().contains("abandoned transaction found"));
    assert_eq!(err.hint(), Some("run recover"));

    assert!(other.recover().expect("recover"));
    other
        .with_lockfree_transaction("fast", |_| Ok(()))
        .expect("now clean");
}

// =============================================================================
// Rollback
// =============================================================================

#[test]
fn rollback_survives_reopen() {
    let (t, mut repo) = TestRepo::new();
    let first = commit_file(&t, &mut repo, "1");
    commit_file(&t, &mut repo, "2");
    drop(repo);

    let mut repo = t.reopen();
    let info = repo.rollback(false, false).expect("rollback");
    assert_eq!(info.desc, "commit");
    assert_eq!(info.changelog_len, 1);
    drop(repo);

    let repo = t.reopen();
    assert_eq!(repo.tip(), Some(&first));
    assert_eq!(repo.dirstate().p1(), &first);
    assert_eq!(
        repo.status(&Matcher::Always).expect("status").modified,
        vec![path("a")]
    );
}

#[test]
fn rollback_restores_store_bytes() {
    let (t, mut repo) = TestRepo::new();
    commit_file(&t, &mut repo, "1");
    Journal::discard(repo.paths(), BackupSet::Undo).expect("drop undo");
    let before = t.store_digest();

    commit_file(&t, &mut repo, "2");
    repo.rollback(false, false).expect("rollback");
    assert_eq!(t.store_digest(), before);
}

#[test]
fn rollback_of_bookmark_move() {
    let (t, mut repo) = TestRepo::new();
    let first = commit_file(&t, &mut repo, "1");
    let main = vcstore::core::types::BookmarkName::new("main").expect("name");
    repo.bookmark(&main, Some(first.clone())).expect("bookmark");
    assert_eq!(repo.stores().bookmarks.get(&main), Some(&first));

    let info = repo.rollback(false, false).expect("rollback");
    assert_eq!(info.desc, "bookmark");
    assert!(info.removed.is_empty());
    assert_eq!(repo.stores().bookmarks.get(&main), None);
    assert_eq!(repo.tip(), Some(&first));
}

#[test]
fn rollback_needs_force_when_not_at_tip() {
    let (t, mut repo) = TestRepo::new();
    let first = commit_file(&t, &mut repo, "1");
    commit_file(&t, &mut repo, "2");
    repo.set_parents(first, Node::null()).expect("set parents");

    let err = repo.rollback(false, false).expect_err("refused");
    assert!(matches!(err, RepoError::Abort { .. }));
    assert!(repo.rollback(true, true).expect("dry run").dry_run);
    assert_eq!(repo.rollback(false, true).expect("forced").removed.len(), 1);
}

// =============================================================================
// Fault injection
// =============================================================================

#[cfg(feature = "fault_injection")]
mod fault_injection {
    use super::*;
    use vcstore::core::ops::journal::fault_injection;

    #[test]
    fn crash_during_promotion_rolls_back() {
        let (t, mut repo) = TestRepo::new();
        let first = commit_file(&t, &mut repo, "1");
        let before = t.store_digest();

        // Step 1 is the journal write, step 2 the first promotion rename
        t.write("a", "2");
        fault_injection::set_crash_after(2);
        let result = repo.commit(CommitRequest::new("doomed"));
        fault_injection::reset();

        assert!(result.is_err());
        assert_eq!(repo.tip(), Some(&first));
        assert_eq!(t.store_digest(), before);
        assert_eq!(repo.dirstate().p1(), &first);
    }

    #[test]
    fn crash_writing_journal_changes_nothing() {
        let (t, mut repo) = TestRepo::new();
        commit_file(&t, &mut repo, "1");
        let before = t.store_digest();

        t.write("a", "2");
        fault_injection::set_crash_after(1);
        let result = repo.commit(CommitRequest::new("doomed"));
        fault_injection::reset();

        assert!(result.is_err());
        assert_eq!(t.store_digest(), before);
    }
}
