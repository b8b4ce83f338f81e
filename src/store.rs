//! Primary entity store.
//!
//! The store is local and reliable, so no resilience policy wraps it. Keys are allocated by the
//! store when an entity is inserted.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

/// Failure of the primary store itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A writer panicked while holding the lock; the records can no longer be trusted.
    #[error("primary store lock poisoned during {operation}")]
    Poisoned { operation: &'static str },
    #[error("primary store failure: {0}")]
    Backend(String),
}

/// Synchronous get/insert/delete/list over primary entities keyed by `u64`.
pub trait PrimaryStore<P>: Send + Sync {
    fn get(&self, key: u64) -> Result<Option<P>, StoreError>;

    /// Allocate a key, build the entity for it and store it.
    fn insert(&self, build: Box<dyn FnOnce(u64) -> P + Send + '_>) -> Result<(u64, P), StoreError>;

    /// Returns whether an entity was removed.
    fn delete(&self, key: u64) -> Result<bool, StoreError>;

    /// Every entity, ordered by key.
    fn list(&self) -> Result<Vec<(u64, P)>, StoreError>;
}

/// `BTreeMap` behind a `RwLock`. Keys start at 1 and are never reused.
#[derive(Debug)]
pub struct InMemoryStore<P> {
    records: RwLock<BTreeMap<u64, P>>,
    next_key: AtomicU64,
}

impl<P> Default for InMemoryStore<P> {
    fn default() -> Self {
        Self { records: RwLock::new(BTreeMap::new()), next_key: AtomicU64::new(1) }
    }
}

impl<P> InMemoryStore<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or_else(|e| e.into_inner().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<G>(operation: &'static str) -> impl FnOnce(PoisonError<G>) -> StoreError {
    move |_| StoreError::Poisoned { operation }
}

impl<P> PrimaryStore<P> for InMemoryStore<P>
where
    P: Clone + Send + Sync,
{
    fn get(&self, key: u64) -> Result<Option<P>, StoreError> {
        let records = self.records.read().map_err(poisoned("get"))?;
        Ok(records.get(&key).cloned())
    }

    fn insert(&self, build: Box<dyn FnOnce(u64) -> P + Send + '_>) -> Result<(u64, P), StoreError> {
        let mut records = self.records.write().map_err(poisoned("insert"))?;
        let key = self.next_key.fetch_add(1, Ordering::SeqCst);
        let entity = build(key);
        records.insert(key, entity.clone());
        Ok((key, entity))
    }

    fn delete(&self, key: u64) -> Result<bool, StoreError> {
        let mut records = self.records.write().map_err(poisoned("delete"))?;
        Ok(records.remove(&key).is_some())
    }

    fn list(&self) -> Result<Vec<(u64, P)>, StoreError> {
        let records = self.records.read().map_err(poisoned("list"))?;
        Ok(records.iter().map(|(k, v)| (*k, v.clone())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn keys_start_at_one_and_are_not_reused() {
        let store = InMemoryStore::new();
        let (a, _) = store.insert(Box::new(|key| format!("post {key}"))).unwrap();
        let (b, entity) = store.insert(Box::new(|key| format!("post {key}"))).unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(entity, "post 2");

        assert!(store.delete(2).unwrap());
        let (c, _) = store.insert(Box::new(|key| format!("post {key}"))).unwrap();
        assert_eq!(c, 3);
    }

    #[test]
    fn get_delete_list() {
        let store = InMemoryStore::new();
        for title in ["b", "a", "c"] {
            store.insert(Box::new(move |_| title.to_string())).unwrap();
        }
        assert_eq!(store.get(2).unwrap().as_deref(), Some("a"));
        assert_eq!(store.get(9).unwrap(), None);
        assert!(!store.delete(9).unwrap());

        let keys: Vec<u64> = store.list().unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![1, 2, 3]);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn poisoned_lock_is_reported() {
        let store = Arc::new(InMemoryStore::<String>::new());
        let clone = store.clone();
        let _ = std::thread::spawn(move || {
            let _ = clone.insert(Box::new(|_| panic!("builder panicked")));
        })
        .join();

        assert_eq!(store.get(1).unwrap_err(), StoreError::Poisoned { operation: "get" });
        assert_eq!(store.len(), 0);
    }
}
