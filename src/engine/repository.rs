//! engine::repository
//!
//! Repository open/init, the two repository locks, and working-copy
//! operations.
//!
//! # Locks
//!
//! [`Repository::lock`] and [`Repository::wlock`] are reentrant per
//! instance. Newly acquiring the store lock rolls back an abandoned
//! journal and reloads stores changed by other processes; newly acquiring
//! the working-copy lock reloads the tracking state. The outermost release
//! flushes (store lock) or writes the tracking state (working-copy lock),
//! unlocks, then runs the callbacks scheduled with
//! [`Repository::after_lock`].
//!
//! Taking the working-copy lock while holding the store lock is a lock
//! order hazard. It is logged and recorded in
//! [`Repository::devel_warnings`], or refused with `devel.strict_lock_order`.

use std::fmt;
use std::fs;
use std::path::Path;

use crate::core::cache::CacheRegistry;
use crate::core::config::Config;
use crate::core::ops::{
    recover, BackupSet, FileLock, HeldLock, Journal, LockError, LockGuard, LockHandle, LockKind,
    LockWait, OwnerId,
};
use crate::core::paths::RepoPaths;
use crate::core::requirements::RequirementSet;
use crate::core::types::{BookmarkName, Node, Phase, RepoPath};
use crate::core::vfs;
use crate::store::{GraphStore, ManifestStore, Stores};
use crate::workingcopy::{Dirstate, Matcher, Status, WorkingCopyError};

use super::hooks::Hooks;
use super::transaction::Transaction;
use super::{caches, RepoError};

/// Callback run after the outermost release of a lock.
pub type PostRelease = Box<dyn FnOnce(&mut Repository) -> Result<(), RepoError>>;

/// One repository instance.
pub struct Repository {
    pub(crate) id: OwnerId,
    pub(crate) paths: RepoPaths,
    pub(crate) config: Config,
    pub(crate) requirements: RequirementSet,
    pub(crate) stores: Stores,
    pub(crate) dirstate: Dirstate,
    pub(crate) store_lock: Option<HeldLock<PostRelease>>,
    pub(crate) wlock: Option<HeldLock<PostRelease>>,
    pub(crate) txn: Option<Transaction>,
    pub(crate) caches: CacheRegistry<Repository, RepoError>,
    pub(crate) hooks: Hooks,
    pub(crate) devel_warnings: Vec<String>,
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("id", &self.id)
            .field("root", &self.paths.root)
            .field("store_lock", &self.store_lock.as_ref().map(|l| l.count()))
            .field("wlock", &self.wlock.as_ref().map(|l| l.count()))
            .field("txn", &self.txn)
            .field("caches", &self.caches)
            .finish_non_exhaustive()
    }
}

impl Repository {
    // =========================================================================
    // Open / init
    // =========================================================================

    /// Create a repository at `root` and open it.
    pub fn init(root: impl AsRef<Path>) -> Result<Self, RepoError> {
        let config = Config::load(None)?;
        Self::init_with_config(root, config)
    }

    /// Create a repository with an explicit configuration.
    pub fn init_with_config(root: impl AsRef<Path>, config: Config) -> Result<Self, RepoError> {
        let paths = RepoPaths::new(root.as_ref());
        if paths.requires_path().exists() {
            return Err(RepoError::abort(format!(
                "repository {} already exists",
                paths.root.display()
            )));
        }
        fs::create_dir_all(paths.store_dir())?;
        RequirementSet::default_set().write(&paths)?;
        Stores::create(&paths)?;
        tracing::info!(root = %paths.root.display(), "created repository");
        Self::open_with_config(root, config)
    }

    /// Open the repository at `root`, loading global and repository config.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, RepoError> {
        let config = Config::load(None)?;
        Self::open_with_config(root, config)
    }

    /// Open with an explicit configuration. The repository's own
    /// `config.toml` is layered on top only when `config` carries no
    /// repository layer of its own.
    pub fn open_with_config(root: impl AsRef<Path>, mut config: Config) -> Result<Self, RepoError> {
        let paths = RepoPaths::new(root.as_ref());
        if !paths.local_dir().is_dir() {
            return Err(RepoError::abort(format!(
                "repository {} not found",
                paths.root.display()
            )));
        }
        let requirements = RequirementSet::load(&paths)?;
        if config.repo.is_none() {
            config.load_repo(&paths.local_dir())?;
        }

        if Journal::exists(&paths, BackupSet::Journal) {
            match FileLock::try_acquire(&paths.store_lock_path(), &lock_holder())? {
                Some(mut lock) => {
                    recover(&paths)?;
                    lock.release()?;
                }
                None => {
                    tracing::debug!("journal present while the store is locked; leaving it");
                }
            }
        }

        let stores = Stores::load(&paths)?;
        let dirstate = Dirstate::load(&paths)?;
        let mut caches = CacheRegistry::new();
        caches::register(&mut caches, &paths);

        tracing::debug!(root = %paths.root.display(), "opened repository");
        Ok(Self {
            id: OwnerId::new(),
            paths,
            config,
            requirements,
            stores,
            dirstate,
            store_lock: None,
            wlock: None,
            txn: None,
            caches,
            hooks: Hooks::new(),
            devel_warnings: Vec::new(),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> &OwnerId {
        &self.id
    }

    pub fn paths(&self) -> &RepoPaths {
        &self.paths
    }

    pub fn root(&self) -> &Path {
        &self.paths.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn requirements(&self) -> &RequirementSet {
        &self.requirements
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn dirstate(&self) -> &Dirstate {
        &self.dirstate
    }

    pub fn hooks_mut(&mut self) -> &mut Hooks {
        &mut self.hooks
    }

    /// Lock-order hazards seen by this instance.
    pub fn devel_warnings(&self) -> &[String] {
        &self.devel_warnings
    }

    /// The most recent commit.
    pub fn tip(&self) -> Option<&Node> {
        self.stores.changelog.tip()
    }

    // =========================================================================
    // Locks
    // =========================================================================

    /// Number of references this instance holds on `kind`.
    pub fn lock_count(&self, kind: LockKind) -> usize {
        let held = match kind {
            LockKind::Store => self.store_lock.as_ref(),
            LockKind::WorkingCopy => self.wlock.as_ref(),
        };
        held.map_or(0, HeldLock::count)
    }

    pub fn holds_lock(&self, kind: LockKind) -> bool {
        self.lock_count(kind) > 0
    }

    fn in_lockfree_txn(&self) -> bool {
        self.txn.as_ref().is_some_and(Transaction::is_lock_free)
    }

    fn lock_wait(&self, wait: bool) -> LockWait {
        if wait {
            LockWait::Wait {
                timeout: self.config.timeout(),
                warn_after: self.config.timeout_warn(),
            }
        } else {
            LockWait::NoWait
        }
    }

    /// Acquire the store lock.
    ///
    /// With `wait`, blocks up to `ui.timeout`; otherwise fails at once with
    /// [`LockError::Busy`] on contention.
    pub fn lock(&mut self, wait: bool) -> Result<LockGuard, RepoError> {
        self.acquire_store_lock(wait, true)
    }

    pub(crate) fn acquire_store_lock(
        &mut self,
        wait: bool,
        run_recovery: bool,
    ) -> Result<LockGuard, RepoError> {
        if self.in_lockfree_txn() {
            return Ok(LockGuard::LockFree);
        }
        if let Some(held) = self.store_lock.as_mut() {
            held.enter();
            return Ok(LockGuard::Locked(self.handle(LockKind::Store)));
        }

        let file = FileLock::acquire(
            &self.paths.store_lock_path(),
            self.lock_wait(wait),
            &lock_holder(),
        )?;
        self.store_lock = Some(HeldLock::new(file));
        if let Err(err) = self.on_store_lock_acquired(run_recovery) {
            // Dropping the held lock unlocks the file
            self.store_lock = None;
            return Err(err);
        }
        Ok(LockGuard::Locked(self.handle(LockKind::Store)))
    }

    /// Without `run_recovery` the stores are left alone: the caller replays
    /// the journal itself and logs may hold a torn entry until then.
    fn on_store_lock_acquired(&mut self, run_recovery: bool) -> Result<(), RepoError> {
        if !run_recovery {
            return Ok(());
        }
        if recover(&self.paths)?.is_some() {
            self.stores = Stores::load(&self.paths)?;
            self.caches.invalidate_all();
            return Ok(());
        }
        let reloaded = self.stores.refresh(&self.paths)?;
        if !reloaded.is_empty() {
            tracing::debug!(stores = ?reloaded, "reloaded stores changed on disk");
            self.caches.invalidate_all();
        }
        Ok(())
    }

    /// Acquire the working-copy lock.
    pub fn wlock(&mut self, wait: bool) -> Result<LockGuard, RepoError> {
        if self.in_lockfree_txn() {
            return Ok(LockGuard::LockFree);
        }
        if let Some(held) = self.wlock.as_mut() {
            held.enter();
            return Ok(LockGuard::Locked(self.handle(LockKind::WorkingCopy)));
        }
        if self.store_lock.is_some() {
            if self.config.strict_lock_order() {
                return Err(LockError::OrderViolation.into());
            }
            let message = "\"wlock\" acquired after \"lock\"".to_string();
            tracing::warn!(devel = true, "{}", message);
            self.devel_warnings.push(message);
        }

        let file = FileLock::acquire(&self.paths.wlock_path(), self.lock_wait(wait), &lock_holder())?;
        self.wlock = Some(HeldLock::new(file));
        if let Err(err) = self.reload_dirstate_if_stale() {
            self.wlock = None;
            return Err(err.into());
        }
        Ok(LockGuard::Locked(self.handle(LockKind::WorkingCopy)))
    }

    fn reload_dirstate_if_stale(&mut self) -> Result<(), WorkingCopyError> {
        if self.dirstate.is_stale()? {
            tracing::debug!("reloading dirstate changed on disk");
            self.dirstate.discard()?;
        }
        Ok(())
    }

    fn handle(&self, kind: LockKind) -> LockHandle {
        LockHandle::new(kind, self.id.clone())
    }

    /// Release one lock reference.
    pub fn release_lock(&mut self, guard: LockGuard) -> Result<(), RepoError> {
        let handle = match guard {
            LockGuard::LockFree => return Ok(()),
            LockGuard::Locked(handle) => handle,
        };
        if handle.owner() != &self.id {
            return Err(RepoError::programming(
                "lock handle belongs to another repository instance",
            ));
        }
        match handle.kind() {
            LockKind::Store => self.release_store_lock(),
            LockKind::WorkingCopy => self.release_wlock(),
        }
    }

    fn release_store_lock(&mut self) -> Result<(), RepoError> {
        let outermost = match self.store_lock.as_mut() {
            Some(held) => held.exit(),
            None => return Err(RepoError::programming("store lock is not held")),
        };
        if !outermost {
            return Ok(());
        }
        let flushed = self.stores.flush();
        let Some(held) = self.store_lock.take() else {
            return Ok(());
        };
        let callbacks = held.unlock()?;
        tracing::debug!("store lock released");
        flushed?;
        self.run_postrelease(callbacks)
    }

    fn release_wlock(&mut self) -> Result<(), RepoError> {
        let outermost = match self.wlock.as_mut() {
            Some(held) => held.exit(),
            None => return Err(RepoError::programming("working-copy lock is not held")),
        };
        if !outermost {
            return Ok(());
        }
        let saved = if self.dirstate.has_pending_parent_change() {
            tracing::debug!("discarding dirstate with a pending parent change");
            self.dirstate.discard()
        } else {
            self.dirstate.write()
        };
        let Some(held) = self.wlock.take() else {
            return Ok(());
        };
        let callbacks = held.unlock()?;
        tracing::debug!("working-copy lock released");
        saved?;
        self.run_postrelease(callbacks)
    }

    fn run_postrelease(&mut self, callbacks: Vec<PostRelease>) -> Result<(), RepoError> {
        let mut first_error = None;
        for callback in callbacks {
            if let Err(err) = callback(self) {
                tracing::warn!(error = %err, "post-release callback failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Run `callback` when the outermost lock is released (the working-copy
    /// lock if held, else the store lock), or now if no lock is held.
    pub fn after_lock<F>(&mut self, callback: F) -> Result<(), RepoError>
    where
        F: FnOnce(&mut Repository) -> Result<(), RepoError> + 'static,
    {
        if let Some(held) = self.wlock.as_mut() {
            held.push_postrelease(Box::new(callback));
            return Ok(());
        }
        if let Some(held) = self.store_lock.as_mut() {
            held.push_postrelease(Box::new(callback));
            return Ok(());
        }
        callback(self)
    }

    /// Run `f` under the store lock, releasing it on every exit path.
    pub fn with_lock<T, F>(&mut self, f: F) -> Result<T, RepoError>
    where
        F: FnOnce(&mut Repository) -> Result<T, RepoError>,
    {
        let guard = self.lock(true)?;
        let result = f(self);
        finish_with_release(result, self.release_lock(guard))
    }

    /// Run `f` under the working-copy lock.
    pub fn with_wlock<T, F>(&mut self, f: F) -> Result<T, RepoError>
    where
        F: FnOnce(&mut Repository) -> Result<T, RepoError>,
    {
        let guard = self.wlock(true)?;
        let result = f(self);
        finish_with_release(result, self.release_lock(guard))
    }

    /// Run `f` under both locks, taken in order.
    pub fn with_locks<T, F>(&mut self, f: F) -> Result<T, RepoError>
    where
        F: FnOnce(&mut Repository) -> Result<T, RepoError>,
    {
        self.with_wlock(|repo| repo.with_lock(f))
    }

    // =========================================================================
    // Working copy
    // =========================================================================

    /// Start tracking `files`.
    pub fn add(&mut self, files: &[RepoPath]) -> Result<(), RepoError> {
        self.with_wlock(|repo| {
            for path in files {
                if !repo.paths.wfile(path).is_file() {
                    return Err(WorkingCopyError::Missing(path.to_string()).into());
                }
                repo.dirstate.add(path.clone());
            }
            Ok(())
        })
    }

    /// Stop tracking `files` and delete them from the working directory.
    pub fn remove(&mut self, files: &[RepoPath]) -> Result<(), RepoError> {
        self.with_wlock(|repo| {
            for path in files {
                repo.dirstate.remove(path)?;
                vfs::remove_optional(&repo.paths.wfile(path))?;
            }
            Ok(())
        })
    }

    /// Record `dest` as a copy of `source`. `dest` must exist.
    pub fn copy(&mut self, source: &RepoPath, dest: &RepoPath) -> Result<(), RepoError> {
        self.with_wlock(|repo| {
            if !repo.paths.wfile(dest).is_file() {
                return Err(WorkingCopyError::Missing(dest.to_string()).into());
            }
            repo.dirstate.copy(source.clone(), dest.clone());
            Ok(())
        })
    }

    /// Set the working parents.
    pub fn set_parents(&mut self, p1: Node, p2: Node) -> Result<(), RepoError> {
        for parent in [&p1, &p2] {
            if !parent.is_null() && !self.stores.changelog.contains(parent) {
                return Err(crate::store::StoreError::UnknownNode(parent.clone()).into());
            }
        }
        self.with_wlock(|repo| {
            repo.dirstate.set_parents(p1, p2);
            Ok(())
        })
    }

    /// Working-copy changes selected by `matcher`.
    pub fn status(&self, matcher: &Matcher) -> Result<Status, RepoError> {
        let manifest = self.manifest_of(self.dirstate.p1())?;
        Ok(Status::compute(
            &self.paths,
            &self.dirstate,
            &manifest,
            &self.stores.filelog,
            matcher,
        )?)
    }

    /// Manifest of a commit; the null node has the empty manifest.
    pub fn manifest_of(&self, node: &Node) -> Result<crate::store::Manifest, RepoError> {
        if node.is_null() {
            return Ok(crate::store::Manifest::new());
        }
        let entry = self
            .stores
            .changelog
            .get(node)
            .ok_or_else(|| crate::store::StoreError::UnknownNode(node.clone()))?;
        Ok(self.stores.manifests.read(&entry.manifest)?)
    }

    /// Content of `path` as of commit `node`.
    pub fn file_data(&self, node: &Node, path: &RepoPath) -> Result<Option<Vec<u8>>, RepoError> {
        let manifest = self.manifest_of(node)?;
        match manifest.get(path) {
            Some(entry) => Ok(Some(self.stores.filelog.read(path, &entry.node)?)),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Bookmarks and phases
    // =========================================================================

    /// Point bookmark `name` at `node`, or delete it with `None`.
    pub fn bookmark(&mut self, name: &BookmarkName, node: Option<Node>) -> Result<(), RepoError> {
        if let Some(node) = &node {
            if !self.stores.changelog.contains(node) {
                return Err(crate::store::StoreError::UnknownNode(node.clone()).into());
            }
        }
        self.with_locks(|repo| {
            repo.with_transaction("bookmark", |repo| {
                let old = match &node {
                    Some(node) => repo.stores.bookmarks.set(name.clone(), node.clone())?,
                    None => repo.stores.bookmarks.remove(name)?,
                };
                if old != node {
                    repo.record_bookmark_move(name, old, node.clone());
                }
                Ok(())
            })
        })
    }

    /// The active bookmark, if any.
    pub fn active_bookmark(&self) -> Result<Option<BookmarkName>, RepoError> {
        match vfs::read_optional(&self.paths.active_bookmark_path())? {
            Some(data) => {
                let name = String::from_utf8_lossy(&data).trim().to_string();
                if name.is_empty() {
                    return Ok(None);
                }
                Ok(Some(BookmarkName::new(name)?))
            }
            None => Ok(None),
        }
    }

    /// Make `name` the active bookmark, or deactivate with `None`.
    pub fn activate_bookmark(&mut self, name: Option<&BookmarkName>) -> Result<(), RepoError> {
        self.with_wlock(|repo| {
            let path = repo.paths.active_bookmark_path();
            match name {
                Some(name) => vfs::atomic_write(&path, name.as_str().as_bytes())?,
                None => vfs::remove_optional(&path)?,
            }
            Ok(())
        })
    }

    /// Move `nodes` and their ancestors to at most `target`.
    pub fn advance_phase(&mut self, target: Phase, nodes: &[Node]) -> Result<(), RepoError> {
        self.with_lock(|repo| {
            repo.with_transaction("phase", |repo| {
                let moves = repo
                    .stores
                    .phases
                    .advance(&repo.stores.changelog, target, nodes)?;
                for mv in moves {
                    repo.record_phase_move(mv);
                }
                Ok(())
            })
        })
    }

    /// Move `nodes` and their descendants to at least `target`.
    pub fn retract_phase(&mut self, target: Phase, nodes: &[Node]) -> Result<(), RepoError> {
        self.with_lock(|repo| {
            repo.with_transaction("phase", |repo| {
                let moves = repo
                    .stores
                    .phases
                    .retract(&repo.stores.changelog, target, nodes)?;
                for mv in moves {
                    repo.record_phase_move(mv);
                }
                Ok(())
            })
        })
    }
}

/// Combine an operation result with the result of releasing its lock.
/// The operation's own error wins.
pub(crate) fn finish_with_release<T>(
    result: Result<T, RepoError>,
    released: Result<(), RepoError>,
) -> Result<T, RepoError> {
    match (result, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(release_err)) => {
            tracing::warn!(error = %release_err, "lock release failed after error");
            Err(err)
        }
    }
}

/// Diagnostic holder string written into lock files.
fn lock_holder() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{}:{}", host, std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ConfigFile;
    use tempfile::TempDir;

    fn repo() -> (TempDir, Repository) {
        let temp = TempDir::new().expect("temp dir");
        let repo = Repository::init_with_config(temp.path(), Config::with_global(ConfigFile::default()))
            .expect("init");
        (temp, repo)
    }

    #[test]
    fn init_writes_layout() {
        let (temp, repo) = repo();
        assert!(temp.path().join(".vcs/requires").exists());
        assert!(temp.path().join(".vcs/store/requires").exists());
        assert!(temp.path().join(".vcs/store/changelog").exists());
        assert!(repo.stores().changelog.entries().is_empty());
        assert!(Repository::init_with_config(temp.path(), Config::default()).is_err());
    }

    #[test]
    fn explicit_repo_layer_wins_over_config_file() {
        let (temp, repo) = repo();
        drop(repo);
        fs::write(
            temp.path().join(".vcs/config.toml"),
            "[ui]\nusername = \"from file\"\n",
        )
        .expect("write config");

        let explicit = Config::from_repo_toml("[ui]\nusername = \"explicit\"\n").expect("config");
        let repo = Repository::open_with_config(temp.path(), explicit).expect("open");
        assert_eq!(repo.config().username().as_deref(), Some("explicit"));
        drop(repo);

        let global_only = Config::with_global(ConfigFile::default());
        let repo = Repository::open_with_config(temp.path(), global_only).expect("open");
        assert_eq!(repo.config().username().as_deref(), Some("from file"));
    }

    #[test]
    fn open_missing_repository_fails() {
        let temp = TempDir::new().expect("temp dir");
        let err = Repository::open_with_config(temp.path(), Config::default()).expect_err("missing");
        assert!(matches!(err, RepoError::Abort { .. }));
    }

    #[test]
    fn locks_are_reentrant() {
        let (_temp, mut repo) = repo();
        let outer = repo.lock(false).expect("lock");
        let inner = repo.lock(false).expect("lock again");
        assert_eq!(repo.lock_count(LockKind::Store), 2);
        repo.release_lock(inner).expect("release inner");
        assert!(repo.holds_lock(LockKind::Store));
        repo.release_lock(outer).expect("release outer");
        assert!(!repo.holds_lock(LockKind::Store));
    }

    #[test]
    fn wlock_after_lock_is_flagged() {
        let (_temp, mut repo) = repo();
        repo.with_lock(|repo| repo.with_wlock(|_| Ok(()))).expect("locks");
        assert_eq!(repo.devel_warnings().len(), 1);
        assert!(repo.devel_warnings()[0].contains("\"wlock\" acquired after \"lock\""));

        repo.with_locks(|_| Ok(())).expect("ordered locks");
        assert_eq!(repo.devel_warnings().len(), 1);
    }

    #[test]
    fn strict_lock_order_refuses() {
        let temp = TempDir::new().expect("temp dir");
        let config = Config::from_repo_toml("[devel]\nstrict_lock_order = true\n").expect("config");
        let mut repo = Repository::init_with_config(temp.path(), config).expect("init");
        let result = repo.with_lock(|repo| repo.with_wlock(|_| Ok(())));
        assert!(matches!(
            result,
            Err(RepoError::Lock(LockError::OrderViolation))
        ));
        assert!(!repo.holds_lock(LockKind::Store));
    }

    #[test]
    fn after_lock_runs_on_outermost_release() {
        let (_temp, mut repo) = repo();
        let guard = repo.wlock(false).expect("wlock");
        repo.after_lock(|repo| {
            repo.devel_warnings.push("ran".into());
            Ok(())
        })
        .expect("schedule");
        assert!(repo.devel_warnings().is_empty());
        repo.release_lock(guard).expect("release");
        assert_eq!(repo.devel_warnings(), ["ran".to_string()]);

        repo.after_lock(|repo| {
            repo.devel_warnings.push("now".into());
            Ok(())
        })
        .expect("immediate");
        assert_eq!(repo.devel_warnings().len(), 2);
    }

    #[test]
    fn add_requires_existing_file() {
        let (temp, mut repo) = repo();
        let a = RepoPath::new("a").expect("path");
        assert!(repo.add(std::slice::from_ref(&a)).is_err());
        fs::write(temp.path().join("a"), "1").expect("write");
        repo.add(std::slice::from_ref(&a)).expect("add");
        let status = repo.status(&Matcher::Always).expect("status");
        assert_eq!(status.added, vec![a]);
    }
}
