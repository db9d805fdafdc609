//! engine::commit
//!
//! The commit pipeline.
//!
//! # Architecture
//!
//! ```text
//! commit(request)                         [working-copy lock]
//!   status -> explicit path checks -> empty / merge checks
//!   editor -> save last-message.txt -> policy checks
//!   transaction "commit"                  [store lock]
//!     precommit hook
//!     commitctx(ctx)
//!       filecommit per file -> manifest delta -> changelog append
//!       write_pending -> pretxncommit hook
//!       phase, visible heads, mutation record
//!     active bookmark, tracking state
//!   close -> merge state cleared -> commit hook after the locks are released
//! ```
//!
//! Every refusal before the transaction leaves nothing on disk except the
//! saved message. A failure inside the transaction restores every
//! journaled file.

use std::collections::BTreeMap;
use std::fmt;

use crate::core::types::{Node, RepoPath, UtcTimestamp};
use crate::core::vfs;
use crate::store::{
    manifest_id, GraphStore, ManifestDelta, ManifestEntry, ManifestStore, MutationEntry,
    MutationStore, NewCommit, PhaseStore, StoreError,
};
use crate::workingcopy::{Matcher, MergeState, WorkingCopyError, WorkingFile};

use super::filecommit::{commit_file, FileInput};
use super::hooks::{CommitArgs, PreCommitArgs};
use super::repository::Repository;
use super::RepoError;

/// Produces the final commit message from the prepared context.
pub type Editor = Box<dyn FnOnce(&CommitContext) -> Result<String, RepoError>>;

/// Where the content of a committed file comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
    /// The working directory.
    Working,
    Memory { data: Vec<u8>, flags: String },
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: RepoPath,
    pub source: FileSource,
    pub copy_source: Option<RepoPath>,
}

impl FileChange {
    pub fn working(path: RepoPath) -> Self {
        Self {
            path,
            source: FileSource::Working,
            copy_source: None,
        }
    }

    pub fn memory(path: RepoPath, data: impl Into<Vec<u8>>) -> Self {
        Self {
            path,
            source: FileSource::Memory {
                data: data.into(),
                flags: String::new(),
            },
            copy_source: None,
        }
    }

    pub fn removed(path: RepoPath) -> Self {
        Self {
            path,
            source: FileSource::Removed,
            copy_source: None,
        }
    }

    pub fn copied_from(mut self, source: RepoPath) -> Self {
        self.copy_source = Some(source);
        self
    }
}

/// History-rewrite provenance of a new commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationInfo {
    pub predecessors: Vec<Node>,
    pub op: String,
}

/// Everything needed to write one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitContext {
    pub parents: [Node; 2],
    pub user: String,
    pub date: UtcTimestamp,
    pub description: String,
    pub extra: BTreeMap<String, String>,
    pub files: Vec<FileChange>,
    pub mutation: Option<MutationInfo>,
}

/// Arguments of [`Repository::commit`].
pub struct CommitRequest {
    text: String,
    user: Option<String>,
    date: Option<UtcTimestamp>,
    matcher: Matcher,
    force: bool,
    editor: Option<Editor>,
    extra: BTreeMap<String, String>,
    mutation: Option<MutationInfo>,
}

impl fmt::Debug for CommitRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitRequest")
            .field("text", &self.text)
            .field("user", &self.user)
            .field("date", &self.date)
            .field("matcher", &self.matcher)
            .field("force", &self.force)
            .field("editor", &self.editor.is_some())
            .field("extra", &self.extra)
            .field("mutation", &self.mutation)
            .finish()
    }
}

impl CommitRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            user: None,
            date: None,
            matcher: Matcher::Always,
            force: false,
            editor: None,
            extra: BTreeMap::new(),
            mutation: None,
        }
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn date(mut self, date: UtcTimestamp) -> Self {
        self.date = Some(date);
        self
    }

    pub fn matcher(mut self, matcher: Matcher) -> Self {
        self.matcher = matcher;
        self
    }

    /// Allow partial merge commits and skip the checks on explicitly
    /// named paths.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn editor<F>(mut self, editor: F) -> Self
    where
        F: FnOnce(&CommitContext) -> Result<String, RepoError> + 'static,
    {
        self.editor = Some(Box::new(editor));
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn mutation(mut self, mutation: MutationInfo) -> Self {
        self.mutation = Some(mutation);
        self
    }
}

impl Repository {
    /// Commit the working-copy changes selected by the request's matcher.
    ///
    /// Returns `None` when there is nothing to commit.
    pub fn commit(&mut self, request: CommitRequest) -> Result<Option<Node>, RepoError> {
        self.with_wlock(|repo| repo.commit_locked(request))
    }

    fn commit_locked(&mut self, request: CommitRequest) -> Result<Option<Node>, RepoError> {
        let CommitRequest {
            text,
            user,
            date,
            matcher,
            force,
            editor,
            extra,
            mutation,
        } = request;
        let parents = self.dirstate.parents();
        let merge = self.dirstate.is_merge();

        if !force && merge && !matcher.is_always() {
            return Err(RepoError::abort(
                "cannot partially commit a merge (do not specify files or patterns)",
            ));
        }

        let status = self.status(&matcher)?;
        if !force {
            check_explicit_paths(self, &matcher, &status)?;
        }

        let changed = status.changed();
        let allow_empty = merge || self.config.allow_empty_commit();
        if changed.is_empty() && !allow_empty {
            tracing::debug!("nothing changed");
            return Ok(None);
        }
        if merge && !status.deleted.is_empty() {
            return Err(RepoError::abort("cannot commit merge with missing files"));
        }
        if let Some(ms) = MergeState::load(&self.paths)? {
            if !ms.unresolved().is_empty() {
                return Err(RepoError::abort_with_hint(
                    "unresolved merge conflicts",
                    "resolve the conflicts before committing",
                ));
            }
        }

        let user = match user.or_else(|| self.config.username()) {
            Some(user) if !user.trim().is_empty() => user,
            _ => {
                return Err(RepoError::abort_with_hint(
                    "no username supplied",
                    "set ui.username in .vcs/config.toml",
                ))
            }
        };

        let files = changed
            .iter()
            .map(|path| {
                if status.removed.contains(path) {
                    FileChange::removed(path.clone())
                } else {
                    let change = FileChange::working(path.clone());
                    match self.dirstate.copy_source(path) {
                        Some(source) => change.copied_from(source.clone()),
                        None => change,
                    }
                }
            })
            .collect();
        let mut ctx = CommitContext {
            parents: parents.clone(),
            user,
            date: date.unwrap_or_else(UtcTimestamp::now),
            description: text,
            extra,
            files,
            mutation,
        };
        if let Some(editor) = editor {
            ctx.description = editor(&ctx)?;
        }
        if ctx.description.trim().is_empty() {
            return Err(RepoError::abort("empty commit message"));
        }

        let message_path = self.paths.last_message_path();
        vfs::atomic_write(&message_path, ctx.description.as_bytes())?;
        self.validate_policy(&ctx)?;

        let committed_files = changed;
        self.dirstate.begin_parent_change();
        let result = self.with_lock(|repo| {
            repo.with_transaction("commit", |repo| {
                repo.hooks.precommit.fire(&PreCommitArgs {
                    parent1: parents[0].clone(),
                    parent2: parents[1].clone(),
                })?;
                let node = repo.commitctx(ctx)?;
                repo.advance_active_bookmark(&parents, &node)?;
                repo.dirstate.mark_committed(&node, &committed_files);
                Ok(node)
            })
        });
        self.dirstate.end_parent_change();

        let node = match result {
            Ok(node) => node,
            Err(err) => {
                tracing::warn!(
                    path = %message_path.display(),
                    "note: commit message saved in {}",
                    message_path.display()
                );
                return Err(err);
            }
        };
        MergeState::clear(&self.paths)?;

        let args = CommitArgs {
            node: node.clone(),
            parent1: parents[0].clone(),
            parent2: parents[1].clone(),
            txn_id: None,
        };
        self.after_lock(move |repo| {
            // The commit may have been rolled back by an outer transaction
            if repo.stores.changelog.contains(&args.node) {
                let _ = repo.hooks.commit.fire(&args);
            }
            Ok(())
        })?;
        Ok(Some(node))
    }

    fn validate_policy(&self, ctx: &CommitContext) -> Result<(), RepoError> {
        if !self.config.allow_non_printable()
            && ctx.description.chars().any(is_non_printable)
        {
            return Err(RepoError::abort("non-printable characters in commit message"));
        }
        if let Some(limit) = self.config.description_size_limit() {
            let len = ctx.description.len() as u64;
            if len > limit {
                return Err(RepoError::abort(format!(
                    "commit message length ({}) exceeds configured limit ({})",
                    len, limit
                )));
            }
        }
        if let Some(limit) = self.config.extras_size_limit() {
            let size: u64 = ctx
                .extra
                .iter()
                .map(|(k, v)| (k.len() + v.len()) as u64)
                .sum();
            if size > limit {
                return Err(RepoError::abort(format!(
                    "commit extras total size ({}) exceeds configured limit ({})",
                    size, limit
                )));
            }
        }
        if let Some(limit) = self.config.file_count_limit() {
            let count = ctx.files.len() as u64;
            if count > limit {
                return Err(RepoError::abort(format!(
                    "commit file count ({}) exceeds configured limit ({})",
                    count, limit
                )));
            }
        }
        Ok(())
    }

    fn advance_active_bookmark(&mut self, parents: &[Node; 2], node: &Node) -> Result<(), RepoError> {
        let Some(active) = self.active_bookmark()? else {
            return Ok(());
        };
        let Some(current) = self.stores.bookmarks.get(&active).cloned() else {
            return Ok(());
        };
        if parents.contains(&current) {
            self.stores.bookmarks.set(active.clone(), node.clone())?;
            self.record_bookmark_move(&active, Some(current), Some(node.clone()));
        }
        Ok(())
    }

    /// Write a prepared commit and return its node.
    pub fn commitctx(&mut self, ctx: CommitContext) -> Result<Node, RepoError> {
        self.validate_context(&ctx)?;
        self.validate_policy(&ctx)?;
        self.with_lock(|repo| repo.with_transaction("commit", |repo| repo.write_commit(ctx)))
    }

    fn validate_context(&self, ctx: &CommitContext) -> Result<(), RepoError> {
        let [p1, p2] = &ctx.parents;
        if p1.is_null() && !p2.is_null() {
            return Err(RepoError::programming("second parent without a first parent"));
        }
        for parent in [p1, p2] {
            if !parent.is_null() && !self.stores.changelog.contains(parent) {
                return Err(StoreError::UnknownNode(parent.clone()).into());
            }
        }
        let mut seen = std::collections::BTreeSet::new();
        for change in &ctx.files {
            if !seen.insert(&change.path) {
                return Err(RepoError::programming(format!(
                    "file '{}' listed twice in commit",
                    change.path
                )));
            }
        }
        Ok(())
    }

    fn write_commit(&mut self, ctx: CommitContext) -> Result<Node, RepoError> {
        let [p1, p2] = ctx.parents.clone();
        let m1 = self.manifest_of(&p1)?;
        let m2 = self.manifest_of(&p2)?;

        let mut delta = ManifestDelta::default();
        let mut touched = Vec::new();
        for change in &ctx.files {
            let path = &change.path;
            let (data, flags) = match &change.source {
                FileSource::Removed => {
                    if m1.contains_key(path) || m2.contains_key(path) {
                        delta.removed.insert(path.clone());
                        touched.push(path.clone());
                    }
                    continue;
                }
                FileSource::Working => {
                    let file = WorkingFile::read(&self.paths, path)?
                        .ok_or_else(|| WorkingCopyError::Missing(path.to_string()))?;
                    (file.data, file.flags)
                }
                FileSource::Memory { data, flags } => (data.clone(), flags.clone()),
            };
            let input = FileInput {
                path,
                data: &data,
                flags: &flags,
                copy_source: change.copy_source.as_ref(),
            };
            let node = commit_file(&mut self.stores.filelog, input, &m1, &m2, &mut touched)?;
            delta.set.insert(path.clone(), ManifestEntry::new(node, flags));
        }
        touched.sort();
        touched.dedup();

        let base = manifest_id(&m1);
        let manifest = self.stores.manifests.write(&base, &delta)?;

        let commit = NewCommit {
            parents: ctx.parents.iter().filter(|p| !p.is_null()).cloned().collect(),
            manifest,
            user: ctx.user.clone(),
            date: ctx.date.clone(),
            description: ctx.description.clone(),
            files: touched,
            extra: ctx.extra.clone(),
        };
        let files_changed = commit.files.len();
        let parents = commit.parents.clone();
        let node = self.stores.changelog.append(commit)?;
        self.record_node(&node);

        self.write_pending()?;
        let txn_id = self.current_transaction().map(|txn| txn.id().clone());
        self.hooks.pretxncommit.fire(&CommitArgs {
            node: node.clone(),
            parent1: p1,
            parent2: p2,
            txn_id,
        })?;

        let phase = self.config.new_commit_phase();
        let moved = self
            .stores
            .phases
            .register(&self.stores.changelog, &node, phase)?;
        if let Some(mv) = moved {
            if mv.to != crate::core::types::Phase::Public {
                self.stores.visibility.add(&node, &parents)?;
            }
            self.record_phase_move(mv);
        }

        if let Some(mutation) = &ctx.mutation {
            self.stores.mutation.record(MutationEntry {
                successor: node.clone(),
                predecessors: mutation.predecessors.clone(),
                op: mutation.op.clone(),
                user: ctx.user.clone(),
                date: ctx.date.clone(),
            })?;
            for predecessor in &mutation.predecessors {
                self.stores
                    .visibility
                    .remove(predecessor, std::slice::from_ref(&node))?;
            }
        }

        tracing::info!(
            node = %node.short(12),
            user = %ctx.user,
            files = files_changed,
            "committed changeset"
        );
        Ok(node)
    }
}

/// Fail on explicitly named paths that cannot be committed.
/// ASCII control characters other than whitespace. Non-ASCII text is
/// always accepted.
fn is_non_printable(c: char) -> bool {
    c.is_ascii_control() && !matches!(c, '\t' | '\n' | '\r' | '\x0b' | '\x0c')
}

fn check_explicit_paths(
    repo: &Repository,
    matcher: &Matcher,
    status: &crate::workingcopy::Status,
) -> Result<(), RepoError> {
    for path in matcher.files() {
        if status.contains(path) {
            continue;
        }
        if status.deleted.contains(path) {
            return Err(RepoError::abort(format!("{}: file not found!", path)));
        }
        if repo.dirstate.state(path).is_none() {
            return Err(RepoError::abort(format!("{}: file not tracked!", path)));
        }
    }
    let changed = status.changed();
    for dir in matcher.dirs() {
        if changed.iter().any(|p| p.is_under(dir)) {
            continue;
        }
        if repo.dirstate.has_dir(dir) {
            return Err(RepoError::abort(format!("{}: no match under directory!", dir)));
        }
        return Err(RepoError::abort(format!("{}: file not tracked!", dir)));
    }
    Ok(())
}
