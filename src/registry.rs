//! Registry of live server-side connections.
//!
//! Ids are assigned from a counter starting at 0 and are never reused within
//! one registry, even after the connection holding an id goes away. Removal
//! is idempotent, so concurrent teardown paths resolve to a single effective
//! removal.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

struct Inner<T> {
    next_id: u64,
    live: BTreeMap<u64, Arc<T>>,
}

/// Thread-safe map of connection id to connection.
pub(crate) struct ConnectionRegistry<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> ConnectionRegistry<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 0,
                live: BTreeMap::new(),
            }),
        }
    }

    /// Assign the next id, build the entry with it and insert it.
    ///
    /// Id assignment and insertion happen under one lock, so entries appear
    /// in id order.
    pub(crate) fn register(&self, make: impl FnOnce(u64) -> T) -> Arc<T> {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let entry = Arc::new(make(id));
        inner.live.insert(id, Arc::clone(&entry));
        entry
    }

    /// Remove a connection. Returns `None` if it was already gone.
    pub(crate) fn remove(&self, id: u64) -> Option<Arc<T>> {
        self.lock().live.remove(&id)
    }

    pub(crate) fn get(&self, id: u64) -> Option<Arc<T>> {
        self.lock().live.get(&id).cloned()
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.lock().live.contains_key(&id)
    }

    /// Copy of the live entries, ordered by id.
    pub(crate) fn snapshot(&self) -> Vec<Arc<T>> {
        self.lock().live.values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().live.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
