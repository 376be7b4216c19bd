//! The [ResultCache] holds decoded results, keyed by whatever identifies their content, behind shared [Resource]
//! handles.
//!
//! Each resident entry accounts for one reference to its resource.  When an entry leaves because of the budget, a
//! clear, or a replacement by a different resource, that reference is passed to the [ResourceRemovedListener] so the
//! owner can release or recycle it.  [ResultCache::remove] hands the reference to the caller instead, and a resource
//! too large to be admitted is never reported at all.
use std::fmt;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::*;

/// A shared handle to a cached value, carrying the size it was measured at.
///
/// Two handles are equal only if they point at the same allocation; equal contents aren't enough.
pub struct Resource<T> {
    inner: Arc<T>,
    size: u64,
}

impl<T> Resource<T> {
    pub fn new(value: T, size: u64) -> Resource<T> {
        Resource::from_arc(Arc::new(value), size)
    }

    pub fn from_arc(inner: Arc<T>, size: u64) -> Resource<T> {
        Resource { inner, size }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of live handles to this resource, including the one held by a cache.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn same_resource(&self, other: &Resource<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn into_arc(self) -> Arc<T> {
        self.inner
    }
}

impl<T> Clone for Resource<T> {
    fn clone(&self) -> Self {
        Resource {
            inner: self.inner.clone(),
            size: self.size,
        }
    }
}

impl<T> PartialEq for Resource<T> {
    fn eq(&self, other: &Self) -> bool {
        self.same_resource(other)
    }
}

impl<T> Eq for Resource<T> {}

impl<T> Deref for Resource<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: fmt::Debug> fmt::Debug for Resource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("value", &*self.inner)
            .field("size", &self.size)
            .finish()
    }
}

/// Told about every resource a [ResultCache] lets go of on its own.
pub trait ResourceRemovedListener<T>: Send + Sync {
    fn on_resource_removed(&self, removed: Resource<T>);
}

impl<T, F> ResourceRemovedListener<T> for F
where
    F: Fn(Resource<T>) + Send + Sync,
{
    fn on_resource_removed(&self, removed: Resource<T>) {
        (self)(removed)
    }
}

type SharedListener<T> = Arc<dyn ResourceRemovedListener<T>>;

pub struct ResultHooks<T> {
    listener: RwLock<Option<SharedListener<T>>>,
}

impl<K, T: Send + Sync + 'static> CacheHooks<K, Resource<T>> for ResultHooks<T> {
    fn cost(&self, value: &Resource<T>) -> u64 {
        value.size()
    }

    fn on_evicted(&self, _key: K, value: Resource<T>, cause: EvictionCause) {
        if cause == EvictionCause::Rejected {
            trace!(size = value.size(), "resource too large to cache");
            return;
        }

        // Clone out so the listener doesn't run under our lock.
        let listener = self.listener.read().clone();
        if let Some(l) = listener {
            l.on_resource_removed(value);
        }
    }
}

pub struct ResultCache<K, T> {
    cache: LruCache<K, Resource<T>, ResultHooks<T>>,
}

impl<K: Hash + Eq + Clone, T: Send + Sync + 'static> ResultCache<K, T> {
    /// `max_size` is in the units of [Resource::size], usually bytes.
    pub fn new(max_size: u64) -> ResultCache<K, T> {
        ResultCache {
            cache: LruCache::with_hooks(
                max_size,
                ResultHooks {
                    listener: RwLock::new(None),
                },
            ),
        }
    }

    /// Set the listener, replacing any previous one.
    pub fn set_resource_removed_listener<L>(&self, listener: L)
    where
        L: ResourceRemovedListener<T> + 'static,
    {
        *self.cache.hooks().listener.write() = Some(Arc::new(listener));
    }

    pub fn get(&self, key: &K) -> Option<Resource<T>> {
        self.cache.get(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.cache.contains(key)
    }

    /// Cache a resource, returning the one previously under `key`.
    ///
    /// Putting the very same resource again only refreshes it.  A different resource displaces the old one, which
    /// goes to the listener.  A resource at least as large as the whole cache is dropped without notification and
    /// leaves any existing entry alone.
    pub fn put(&self, key: K, resource: Resource<T>) -> Option<Resource<T>> {
        self.cache.put(key, resource)
    }

    /// Take a resource out of the cache without notifying the listener.
    pub fn remove(&self, key: &K) -> Option<Resource<T>> {
        self.cache.remove(key)
    }

    pub fn current_size(&self) -> u64 {
        self.cache.current_size()
    }

    pub fn max_size(&self) -> u64 {
        self.cache.max_size()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn set_size_multiplier(&self, multiplier: f32) -> Result<(), CacheError> {
        self.cache.set_size_multiplier(multiplier)
    }

    pub fn clear_memory(&self) {
        self.cache.clear_memory()
    }

    pub fn trim_memory(&self, level: TrimLevel) {
        self.cache.trim_memory(level)
    }
}
