//! core::cache
//!
//! Version-keyed memoization for derived repository properties.
//!
//! # Architecture
//!
//! Each cache is registered once under a name with a [`KeyStrategy`] that
//! computes its live [`VersionKey`]:
//!
//! - [`KeyStrategy::Files`] - the stat signatures of a fixed set of files
//! - [`KeyStrategy::Custom`] - any function of the context, typically
//!   combining several state signals (a metadata-root hash, an entry count)
//!
//! Every slot is explicitly `Unset` or `Valid { key, value }`. A lookup
//! computes the live key first; a valid slot whose key matches is returned,
//! anything else is recomputed and stored under the live key.
//!
//! # Invariants
//!
//! - A value is never returned against a key other than the live key
//! - No internal borrow is held while a key or a value is computed, so
//!   computations may consult other caches
//!
//! # Example
//!
//! ```
//! use vcstore::core::cache::{CacheError, CacheRegistry, KeyStrategy, VersionKey};
//!
//! struct Counter { generation: u64 }
//!
//! let mut caches: CacheRegistry<Counter, CacheError> = CacheRegistry::new();
//! caches.register(
//!     "double",
//!     KeyStrategy::Custom(Box::new(|c: &Counter| {
//!         Ok::<_, CacheError>(VersionKey::from_parts([c.generation]))
//!     })),
//! );
//!
//! let ctx = Counter { generation: 1 };
//! let value = caches.get(&ctx, "double", |c| Ok(c.generation * 2)).unwrap();
//! assert_eq!(*value, 2);
//! ```

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;

use thiserror::Error;

use crate::core::vfs::FileStamp;

/// Errors raised by the registry itself.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("no cache registered under '{0}'")]
    Unregistered(String),

    #[error("cache '{0}' holds a value of a different type")]
    TypeMismatch(String),

    #[error("cache key i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// The version a cached value was computed against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionKey(String);

impl VersionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Join several signals into one key.
    pub fn from_parts<I, T>(parts: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: fmt::Display,
    {
        Self(
            parts
                .into_iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join("|"),
        )
    }

    pub fn from_stamps(stamps: &[FileStamp]) -> Self {
        Self::from_parts(stamps.iter())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Live key derivation for one cache.
pub enum KeyStrategy<C, E> {
    Files(Vec<PathBuf>),
    Custom(Box<dyn Fn(&C) -> Result<VersionKey, E>>),
}

impl<C, E> fmt::Debug for KeyStrategy<C, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStrategy::Files(paths) => f.debug_tuple("Files").field(paths).finish(),
            KeyStrategy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

enum CacheSlot {
    Unset,
    Valid { key: VersionKey, value: Rc<dyn Any> },
}

/// Named, version-keyed caches over a context `C`.
pub struct CacheRegistry<C, E> {
    strategies: HashMap<&'static str, KeyStrategy<C, E>>,
    slots: RefCell<HashMap<&'static str, CacheSlot>>,
}

impl<C, E> Default for CacheRegistry<C, E> {
    fn default() -> Self {
        Self {
            strategies: HashMap::new(),
            slots: RefCell::new(HashMap::new()),
        }
    }
}

impl<C, E> fmt::Debug for CacheRegistry<C, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.borrow();
        let mut names: Vec<_> = self.strategies.keys().collect();
        names.sort();
        let mut map = f.debug_map();
        for name in names {
            let state = match slots.get(name) {
                Some(CacheSlot::Valid { key, .. }) => key.as_str().to_string(),
                _ => "unset".to_string(),
            };
            map.entry(name, &state);
        }
        map.finish()
    }
}

impl<C, E> CacheRegistry<C, E>
where
    E: From<CacheError>,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cache. Registering an existing name replaces its strategy
    /// and drops its value.
    pub fn register(&mut self, name: &'static str, strategy: KeyStrategy<C, E>) {
        self.strategies.insert(name, strategy);
        self.slots.borrow_mut().insert(name, CacheSlot::Unset);
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.strategies.contains_key(name)
    }

    /// Compute the live key of `name`.
    pub fn live_key(&self, ctx: &C, name: &str) -> Result<VersionKey, E> {
        let strategy = self
            .strategies
            .get(name)
            .ok_or_else(|| CacheError::Unregistered(name.to_string()))?;
        match strategy {
            KeyStrategy::Files(paths) => {
                let stamps = paths
                    .iter()
                    .map(|p| FileStamp::of(p))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(CacheError::from)?;
                Ok(VersionKey::from_stamps(&stamps))
            }
            KeyStrategy::Custom(f) => f(ctx),
        }
    }

    /// Return the value of `name`, recomputing it if its key moved.
    pub fn get<V, F>(&self, ctx: &C, name: &'static str, compute: F) -> Result<Rc<V>, E>
    where
        V: 'static,
        F: FnOnce(&C) -> Result<V, E>,
    {
        let key = self.live_key(ctx, name)?;

        let cached = match self.slots.borrow().get(name) {
            Some(CacheSlot::Valid { key: stored, value }) if *stored == key => {
                Some(Rc::clone(value))
            }
            _ => None,
        };
        if let Some(value) = cached {
            return value
                .downcast::<V>()
                .map_err(|_| CacheError::TypeMismatch(name.to_string()).into());
        }

        tracing::trace!(cache = name, key = key.as_str(), "recomputing cache");
        let value = Rc::new(compute(ctx)?);
        let stored: Rc<dyn Any> = value.clone();
        self.slots
            .borrow_mut()
            .insert(name, CacheSlot::Valid { key, value: stored });
        Ok(value)
    }

    /// The key the cached value of `name` was computed against, if any.
    pub fn cached_key(&self, name: &str) -> Option<VersionKey> {
        match self.slots.borrow().get(name) {
            Some(CacheSlot::Valid { key, .. }) => Some(key.clone()),
            _ => None,
        }
    }

    /// Whether `name` holds a value computed against the live key.
    pub fn is_fresh(&self, ctx: &C, name: &str) -> Result<bool, E> {
        let live = self.live_key(ctx, name)?;
        Ok(self.cached_key(name).as_ref() == Some(&live))
    }

    /// The stored value of `name`, whatever key it was computed against.
    pub fn peek<V: 'static>(&self, name: &str) -> Option<Rc<V>> {
        match self.slots.borrow().get(name) {
            Some(CacheSlot::Valid { value, .. }) => Rc::clone(value).downcast::<V>().ok(),
            _ => None,
        }
    }

    pub fn invalidate(&self, name: &str) {
        if let Some(slot) = self.slots.borrow_mut().get_mut(name) {
            *slot = CacheSlot::Unset;
        }
    }

    pub fn invalidate_all(&self) {
        for slot in self.slots.borrow_mut().values_mut() {
            *slot = CacheSlot::Unset;
        }
    }
}
