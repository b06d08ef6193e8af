//! Concurrent caches with compute-once sharing.
//!
//! [`ComputeCache`] is a key→value map where the first caller for a key
//! installs a pending computation and every concurrent caller for the same
//! key awaits that single result instead of recomputing. A failed
//! computation caches nothing, so a later request retries from scratch.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;

/// A concurrent key→value map with compute-once construction.
///
/// Values are stored behind `Arc` so many requests can hold the same
/// resource while the cache decides its lifetime. Readers never observe a
/// half-written value; removing an absent key is a no-op.
pub struct ComputeCache<K, V> {
    map: DashMap<K, Arc<OnceCell<Arc<V>>>>,
}

impl<K, V> ComputeCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    /// Get the value for `key`, running `factory` to build it if absent.
    ///
    /// Concurrent callers for the same key all await the first caller's
    /// computation; at most one factory runs per key at any time. A failed
    /// computation leaves the slot unfilled, so the next caller retries
    /// from scratch — nothing is ever cached for a key whose construction
    /// failed.
    ///
    /// The failed slot itself stays in the map rather than being removed:
    /// a queued rival may already be re-running the factory, and removing
    /// the slot out from under it could leave two live resources serving
    /// the same key.
    ///
    /// # Errors
    ///
    /// Propagates the factory's error to every caller that observed the
    /// failed computation.
    pub async fn get_or_try_init<F, Fut, E>(&self, key: &K, factory: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<V>, E>>,
    {
        let cell = self.map.entry(key.clone()).or_default().clone();
        cell.get_or_try_init(factory).await.cloned()
    }

    /// Get the value for `key` if it has been fully constructed.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.map.get(key).and_then(|cell| cell.get().cloned())
    }

    /// Install a pre-built value for `key`, replacing any existing entry.
    pub fn insert(&self, key: K, value: Arc<V>) {
        self.map
            .insert(key, Arc::new(OnceCell::new_with(Some(value))));
    }

    /// Remove the entry for `key`, returning its value if it was built.
    ///
    /// Removing an absent key is a no-op.
    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.map
            .remove(key)
            .and_then(|(_, cell)| cell.get().cloned())
    }

    /// Remove the entry for `key` only if it currently holds `value`.
    ///
    /// Lets teardown paths drop exactly the resource they own without
    /// clobbering a replacement built under the same key in the meantime.
    pub fn remove_if_value(&self, key: &K, value: &Arc<V>) -> bool {
        self.map
            .remove_if(key, |_, cell| {
                cell.get().is_some_and(|live| Arc::ptr_eq(live, value))
            })
            .is_some()
    }

    /// Number of fully constructed entries.
    pub fn len(&self) -> usize {
        self.map
            .iter()
            .filter(|entry| entry.value().get().is_some())
            .count()
    }

    /// Returns `true` if the cache holds no constructed entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for ComputeCache<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> std::fmt::Debug for ComputeCache<K, V>
where
    K: Eq + Hash + Clone,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeCache")
            .field("len", &self.map.len())
            .finish_non_exhaustive()
    }
}
