//! [LruCache] is the thread-safe face of [CostBasedLru]: one coarse lock around the engine, plus [CacheHooks] for
//! cost and eviction handling.
//!
//! Every public method takes the lock for its whole duration, so the size invariants hold whenever a call returns.
//! Eviction hooks are never run under the lock.  The entries a call pushes out are collected while locked and handed
//! to [CacheHooks::on_evicted] once the lock is dropped; a hook therefore sees the cache in its fully updated state
//! and may call back into it (or into another cache, as secondary pools do).  The flip side is that hook calls from
//! two racing threads are not ordered with respect to each other.
use std::hash::Hash;

use parking_lot::Mutex;
use tracing::debug;

use crate::*;

pub struct LruCache<K, V, H = UnitCost> {
    inner: Mutex<CostBasedLru<K, V>>,
    hooks: H,
}

impl<K: Hash + Eq + Clone, V> LruCache<K, V, UnitCost> {
    /// A cache of at most `max_size` entries.  Since an entry costing the whole budget is rejected, a `max_size` of 1
    /// or less holds nothing.
    pub fn new(max_size: u64) -> LruCache<K, V, UnitCost> {
        LruCache::with_hooks(max_size, UnitCost)
    }
}

impl<K: Hash + Eq + Clone, V, H: CacheHooks<K, V>> LruCache<K, V, H> {
    pub fn with_hooks(max_size: u64, hooks: H) -> LruCache<K, V, H> {
        LruCache {
            inner: Mutex::new(CostBasedLru::new(max_size)),
            hooks,
        }
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    fn notify(&self, evicted: Vec<(K, V)>, cause: EvictionCause) {
        for (k, v) in evicted {
            self.hooks.on_evicted(k, v, cause);
        }
    }

    /// Get a value, making it the freshest entry.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.inner.lock().get(key).cloned()
    }

    /// Get a value without touching it.
    pub fn peek(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.inner.lock().peek(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().contains(key)
    }

    /// Insert a value, returning the one it replaced.
    ///
    /// - If the value costs at least [Self::max_size], it is not inserted: the hook gets it back with
    ///   [EvictionCause::Rejected], `None` is returned and any older entry under the key stays put.
    /// - A replaced value is passed to the hook with [EvictionCause::Replaced] unless it is equal to the new one.
    /// - Whatever has to go to bring the cache back under budget is passed to the hook with [EvictionCause::Size].
    pub fn put(&self, key: K, value: V) -> Option<V>
    where
        V: Clone + PartialEq,
    {
        let cost = self.hooks.cost(&value);
        let (ret, replaced, evicted) = {
            let mut guard = self.inner.lock();
            let replaced_key = match guard.peek(&key) {
                Some(old) if *old != value => Some(key.clone()),
                _ => None,
            };

            let insertion = guard.insert(key, value, cost);
            match insertion {
                Insertion::Rejected(k, v) => {
                    drop(guard);
                    self.hooks.on_evicted(k, v, EvictionCause::Rejected);
                    return None;
                }
                Insertion::Admitted { previous, evicted } => {
                    let replaced = match (replaced_key, &previous) {
                        (Some(k), Some(p)) => Some((k, p.clone())),
                        _ => None,
                    };
                    (previous, replaced, evicted)
                }
            }
        };

        if let Some((k, v)) = replaced {
            self.hooks.on_evicted(k, v, EvictionCause::Replaced);
        }
        self.notify(evicted, EvictionCause::Size);
        ret
    }

    /// Remove a value.  The hook is not told: the caller has it now.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().remove(key)
    }

    /// Evict the coldest entries until the current size is at most `target`.
    pub fn trim_to_size(&self, target: u64) {
        let evicted = self.inner.lock().trim_to_size(target);
        self.notify(evicted, EvictionCause::Size);
    }

    /// Evict everything, including entries which cost nothing.  Calling this on an empty cache does nothing.
    pub fn clear_memory(&self) {
        let evicted = self.inner.lock().clear();
        debug!(evicted = evicted.len(), "cleared cache");
        self.notify(evicted, EvictionCause::Size);
    }

    /// Shrink in response to memory pressure; see [TrimLevel::retained_fraction].
    pub fn trim_memory(&self, level: TrimLevel) {
        match level.retained_fraction() {
            Some(f) if f <= 0.0 => self.clear_memory(),
            Some(f) => {
                let target = (self.max_size() as f64 * f) as u64;
                debug!(?level, target, "trimming cache");
                self.trim_to_size(target);
            }
            None => {}
        }
    }

    /// Scale the budget to `multiplier` times its initial value, evicting immediately if it shrank.
    pub fn set_size_multiplier(&self, multiplier: f32) -> Result<(), CacheError> {
        let evicted = self.inner.lock().set_size_multiplier(multiplier)?;
        self.notify(evicted, EvictionCause::Size);
        Ok(())
    }

    pub fn max_size(&self) -> u64 {
        self.inner.lock().max_size()
    }

    pub fn current_size(&self) -> u64 {
        self.inner.lock().current_size()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
