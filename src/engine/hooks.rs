//! engine::hooks
//!
//! Typed hook events.
//!
//! # Architecture
//!
//! The set of hook kinds is closed. Each kind has a fixed payload type and
//! a fixed policy:
//!
//! - **Veto** hooks run before an outcome is final. The first failing
//!   handler stops the chain and the error aborts the enclosing
//!   transaction or commit.
//! - **Best-effort** hooks run after the outcome is final. Failures are
//!   logged and the remaining handlers still run.
//!
//! Handlers run in registration order.
//!
//! # Example
//!
//! ```ignore
//! repo.hooks_mut().pretxncommit.add("no-wip", |args: &CommitArgs| {
//!     anyhow::ensure!(!args.node.is_null(), "null commit");
//!     Ok(())
//! });
//! ```

use std::fmt;

use thiserror::Error;

use crate::core::types::{BookmarkName, Node, Phase, TxnId};

/// A veto raised by a hook handler.
#[derive(Debug, Error)]
#[error("{hook} hook '{handler}' failed: {message}")]
pub struct HookVeto {
    pub hook: &'static str,
    pub handler: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPolicy {
    Veto,
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    PreTxnOpen,
    PreTxnClose,
    PreTxnCloseBookmark,
    PreTxnClosePhase,
    PreCommit,
    PreTxnCommit,
    TxnClose,
    TxnCloseBookmark,
    TxnClosePhase,
    TxnAbort,
    Commit,
}

impl HookKind {
    pub fn name(&self) -> &'static str {
        match self {
            HookKind::PreTxnOpen => "pretxnopen",
            HookKind::PreTxnClose => "pretxnclose",
            HookKind::PreTxnCloseBookmark => "pretxnclose-bookmark",
            HookKind::PreTxnClosePhase => "pretxnclose-phase",
            HookKind::PreCommit => "precommit",
            HookKind::PreTxnCommit => "pretxncommit",
            HookKind::TxnClose => "txnclose",
            HookKind::TxnCloseBookmark => "txnclose-bookmark",
            HookKind::TxnClosePhase => "txnclose-phase",
            HookKind::TxnAbort => "txnabort",
            HookKind::Commit => "commit",
        }
    }

    pub fn policy(&self) -> HookPolicy {
        match self {
            HookKind::PreTxnOpen
            | HookKind::PreTxnClose
            | HookKind::PreTxnCloseBookmark
            | HookKind::PreTxnClosePhase
            | HookKind::PreCommit
            | HookKind::PreTxnCommit => HookPolicy::Veto,
            HookKind::TxnClose
            | HookKind::TxnCloseBookmark
            | HookKind::TxnClosePhase
            | HookKind::TxnAbort
            | HookKind::Commit => HookPolicy::BestEffort,
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Payload of transaction-level hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnArgs {
    pub txn_name: String,
    pub txn_id: TxnId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookmarkArgs {
    pub txn: TxnArgs,
    pub bookmark: BookmarkName,
    pub old: Option<Node>,
    pub new: Option<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseArgs {
    pub txn: TxnArgs,
    pub node: Node,
    pub old: Option<Phase>,
    pub new: Phase,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreCommitArgs {
    pub parent1: Node,
    pub parent2: Node,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitArgs {
    pub node: Node,
    pub parent1: Node,
    pub parent2: Node,
    /// Transaction that created the commit, while it is still open.
    pub txn_id: Option<TxnId>,
}

type Handler<P> = Box<dyn Fn(&P) -> anyhow::Result<()>>;

/// Ordered handlers of one hook kind.
pub struct HookList<P> {
    kind: HookKind,
    handlers: Vec<(String, Handler<P>)>,
}

impl<P> HookList<P> {
    fn new(kind: HookKind) -> Self {
        Self {
            kind,
            handlers: Vec::new(),
        }
    }

    pub fn kind(&self) -> HookKind {
        self.kind
    }

    /// Append a handler. A handler with the same name is replaced in place.
    pub fn add<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&P) -> anyhow::Result<()> + 'static,
    {
        let name = name.into();
        let handler: Handler<P> = Box::new(handler);
        match self.handlers.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = handler,
            None => self.handlers.push((name, handler)),
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(n, _)| n != name);
        self.handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run every handler.
    ///
    /// For veto hooks the first failure is returned; best-effort failures
    /// are logged and never returned.
    pub fn fire(&self, payload: &P) -> Result<(), HookVeto> {
        for (name, handler) in &self.handlers {
            tracing::debug!(hook = self.kind.name(), handler = %name, "running hook");
            if let Err(err) = handler(payload) {
                match self.kind.policy() {
                    HookPolicy::Veto => {
                        return Err(HookVeto {
                            hook: self.kind.name(),
                            handler: name.clone(),
                            message: format!("{:#}", err),
                        })
                    }
                    HookPolicy::BestEffort => {
                        tracing::warn!(
                            hook = self.kind.name(),
                            handler = %name,
                            error = %format!("{:#}", err),
                            "hook failed"
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

impl<P> fmt::Debug for HookList<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookList")
            .field("kind", &self.kind)
            .field(
                "handlers",
                &self.handlers.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Every hook list of a repository.
#[derive(Debug)]
pub struct Hooks {
    pub pretxnopen: HookList<TxnArgs>,
    pub pretxnclose: HookList<TxnArgs>,
    pub pretxnclose_bookmark: HookList<BookmarkArgs>,
    pub pretxnclose_phase: HookList<PhaseArgs>,
    pub precommit: HookList<PreCommitArgs>,
    pub pretxncommit: HookList<CommitArgs>,
    pub txnclose: HookList<TxnArgs>,
    pub txnclose_bookmark: HookList<BookmarkArgs>,
    pub txnclose_phase: HookList<PhaseArgs>,
    pub txnabort: HookList<TxnArgs>,
    pub commit: HookList<CommitArgs>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            pretxnopen: HookList::new(HookKind::PreTxnOpen),
            pretxnclose: HookList::new(HookKind::PreTxnClose),
            pretxnclose_bookmark: HookList::new(HookKind::PreTxnCloseBookmark),
            pretxnclose_phase: HookList::new(HookKind::PreTxnClosePhase),
            precommit: HookList::new(HookKind::PreCommit),
            pretxncommit: HookList::new(HookKind::PreTxnCommit),
            txnclose: HookList::new(HookKind::TxnClose),
            txnclose_bookmark: HookList::new(HookKind::TxnCloseBookmark),
            txnclose_phase: HookList::new(HookKind::TxnClosePhase),
            txnabort: HookList::new(HookKind::TxnAbort),
            commit: HookList::new(HookKind::Commit),
        }
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }
}
