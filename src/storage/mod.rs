//! Storage module
//!
//! This module contains the storage layer components:
//! - The ordered key-value `Storage` interface and the shared `Store` handle
//! - An in-memory backend
//! - Values, records and table lifecycle on top of the store

pub mod memory;
pub mod record;
pub mod table;
pub mod value;

pub use memory::MemoryStorage;
pub use record::Record;
pub use table::{RecordCursor, Table, TransientTable};
pub use value::Value;

use crate::error::Result;
use parking_lot::Mutex;
use std::sync::Arc;

/// Key prefix of every table's record collection
pub const TABLE_PREFIX: &str = "table:";
/// Key prefix of every table's record-id counter
pub const SEQUENCE_PREFIX: &str = "seq:";

/// Ordered key-value primitives the engine is built on.
///
/// Keys hold either a counter or a sorted collection of unique members,
/// each with a score.
pub trait Storage: Send {
    /// Increment a counter, creating it at 0 first. Returns the new value.
    fn increment(&mut self, key: &str) -> Result<i64>;

    /// Add or rescore a member. Returns true if the member is new.
    fn add(&mut self, key: &str, score: f64, member: &str) -> Result<bool>;

    /// Members with `min <= score <= max`, in score order
    fn range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<String>>;

    /// Members starting with `prefix`, in lexicographic order
    fn range_by_prefix(&self, key: &str, prefix: &str) -> Result<Vec<String>>;

    /// Remove members with `min <= score <= max`. Returns how many went.
    fn remove_by_score(&mut self, key: &str, min: f64, max: f64) -> Result<usize>;

    /// Remove one member by value
    fn remove_member(&mut self, key: &str, member: &str) -> Result<bool>;

    /// Delete a key of either kind
    fn delete(&mut self, key: &str) -> Result<bool>;

    /// Cursor-based key scan. Examines up to `count` keys after `cursor` and
    /// returns those matching the glob `pattern` along with the cursor to
    /// resume from, or `None` once the keyspace is exhausted.
    fn scan(
        &self,
        pattern: &str,
        cursor: Option<&str>,
        count: usize,
    ) -> Result<(Option<String>, Vec<String>)>;
}

/// Shared handle to a storage backend.
///
/// Every call goes through `atomic`, which holds the backend exclusively for
/// the duration of the closure. A compiled statement runs inside a single
/// `atomic` call, so nothing interleaves with it.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Mutex<Box<dyn Storage>>>,
}

impl Store {
    pub fn new(backend: impl Storage + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(backend))),
        }
    }

    /// A store backed by a fresh `MemoryStorage`
    pub fn memory() -> Self {
        Self::new(MemoryStorage::new())
    }

    /// Run `f` with exclusive access to the backend
    pub fn atomic<T>(&self, f: impl FnOnce(&mut dyn Storage) -> Result<T>) -> Result<T> {
        let mut backend = self.inner.lock();
        f(&mut **backend)
    }

    /// Like `atomic`, but returns `None` instead of waiting when the backend
    /// is busy.
    pub fn try_atomic<T>(
        &self,
        f: impl FnOnce(&mut dyn Storage) -> Result<T>,
    ) -> Option<Result<T>> {
        let mut backend = self.inner.try_lock()?;
        Some(f(&mut **backend))
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_section() {
        let store = Store::memory();
        let n = store
            .atomic(|s| {
                s.increment("seq:a")?;
                s.increment("seq:a")
            })
            .unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn test_try_atomic_when_busy() {
        let store = Store::memory();
        let other = store.clone();
        store
            .atomic(|_| {
                assert!(other.try_atomic(|s| s.increment("x")).is_none());
                Ok(())
            })
            .unwrap();
        assert!(matches!(other.try_atomic(|s| s.increment("x")), Some(Ok(1))));
    }
}
