//! Observer Registry
//!
//! Id-keyed subscriber lists shared by every user of a connection.
//! Additions hand out a [`Subscription`] whose drop removes exactly the
//! entry it added.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Thread-safe list of observers keyed by registration id
pub struct Registry<T> {
    next_id: AtomicU64,
    entries: Mutex<BTreeMap<u64, T>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, T>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an observer and return its id
    pub fn add(&self, entry: T) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, entry);
        id
    }

    /// Remove an observer by id
    pub fn remove(&self, id: u64) -> Option<T> {
        self.lock().remove(&id)
    }

    /// Check if an id is still registered
    pub fn contains(&self, id: u64) -> bool {
        self.lock().contains_key(&id)
    }

    /// Number of registered observers
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl<T: Clone> Registry<T> {
    /// Copy of the current observers, in registration order
    pub fn snapshot(&self) -> Vec<T> {
        self.lock().values().cloned().collect()
    }
}

/// Guard that deregisters an observer when dropped
#[must_use = "dropping a Subscription deregisters the observer immediately"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(remove: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            remove: Some(Box::new(remove)),
        }
    }

    /// Deregister now
    pub fn cancel(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_add_remove() {
        let registry = Registry::new();
        let a = registry.add("a");
        let b = registry.add("b");
        assert_ne!(a, b);
        assert_eq!(registry.snapshot(), vec!["a", "b"]);

        assert_eq!(registry.remove(a), Some("a"));
        assert_eq!(registry.remove(a), None);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(b));
    }

    #[test]
    fn test_subscription_removes_only_its_entry() {
        let registry = Arc::new(Registry::new());
        let mine = registry.add(1);
        let theirs = registry.add(2);

        let guard = {
            let registry = registry.clone();
            Subscription::new(move || {
                registry.remove(mine);
            })
        };
        drop(guard);

        assert!(!registry.contains(mine));
        assert!(registry.contains(theirs));
    }

    #[test]
    fn test_concurrent_registration() {
        let registry = Arc::new(Registry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let id = registry.add(i);
                        registry.remove(id);
                    }
                    registry.add(i)
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.len(), 8);
    }
}
