//! core
//!
//! Core domain types and the low-level machinery shared by the engine.
//!
//! # Modules
//!
//! - [`types`] - Strong types: Node, TxnId, RepoPath, Phase, BookmarkName
//! - [`paths`] - Centralized path routing for repository storage
//! - [`config`] - Configuration schema and loading
//! - [`requirements`] - On-disk format requirements resolved at open
//! - [`vfs`] - Atomic writes and file stat signatures
//! - [`cache`] - Version-keyed cache registry
//! - [`ops`] - Locking, the transaction journal and crash recovery
//!
//! # Design Principles
//!
//! - Strong typing prevents invalid states at compile time
//! - On-disk schemas are strict and self-describing
//! - Nothing here knows about the repository object itself

pub mod cache;
pub mod config;
pub mod ops;
pub mod paths;
pub mod requirements;
pub mod types;
pub mod vfs;
