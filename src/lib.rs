//! vcstore - transactional local storage for a version-control repository
//!
//! vcstore is the on-disk engine behind a single repository: an append-only
//! commit graph, manifests, file revisions, phases, bookmarks, visible heads
//! and mutation records, all kept consistent by one transaction manager.
//!
//! # Architecture
//!
//! The codebase is layered:
//!
//! - [`core`] - Domain types, paths, config, requirements, locking, journal, caches
//! - [`store`] - File-backed sub-stores (changelog, manifests, filelog, ...)
//! - [`workingcopy`] - Tracking state, matchers, status and merge state
//! - [`engine`] - The [`Repository`](engine::Repository): locks, transactions,
//!   hooks, the commit pipeline and rollback
//!
//! # Correctness Invariants
//!
//! 1. The working-copy lock is taken before the store lock
//! 2. Every store mutation happens inside a journaled transaction
//! 3. An abandoned journal is rolled back before any new transaction opens
//! 4. A cached value is never returned against a superseded version key
//! 5. A failed commit leaves no partial state across the sub-stores

pub mod core;
pub mod engine;
pub mod store;
pub mod workingcopy;

pub use engine::{RepoError, Repository};
