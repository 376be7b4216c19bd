//! The traits which plug user behavior into the caches and pools.
//!
//! [CacheHooks] tells an [LruCache](crate::LruCache) what a value costs and what to do with values it lets go of.
//! [Poolable] and [ObjectFactory] tell a [ReusablePool](crate::ReusablePool) how to bucket, erase, create and destroy
//! the objects it recycles.
use std::fmt::Debug;
use std::hash::Hash;

/// Why a value left a cache without the caller asking for it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EvictionCause {
    /// The value cost at least the whole budget and was never admitted.
    Rejected,
    /// A different value was put under the same key.
    Replaced,
    /// The value was the coldest entry while the cache was over budget, or the cache was trimmed or cleared.
    Size,
}

/// Cost and eviction behavior of a cache.
///
/// The defaults give every value a cost of 1 and ignore evictions, which makes the cache a plain bounded-count LRU.
pub trait CacheHooks<K, V>: Send + Sync {
    /// The cost of a value.  Asked exactly once per insertion; the answer is kept for the life of the entry.
    fn cost(&self, _value: &V) -> u64 {
        1
    }

    /// Called for every value which leaves the cache by any path other than an explicit remove.
    ///
    /// Runs after the cache has released its lock and is consistent again, so implementations may call back into
    /// the cache.
    fn on_evicted(&self, _key: K, _value: V, _cause: EvictionCause) {}
}

/// Every value costs 1 and evictions are dropped.
#[derive(Copy, Clone, Debug, Default)]
pub struct UnitCost;

impl<K, V> CacheHooks<K, V> for UnitCost {}

/// [CacheHooks] built from a pair of closures.
pub struct FnHooks<C, E> {
    cost: C,
    on_evicted: E,
}

impl<C, E> FnHooks<C, E> {
    pub fn new<K, V>(cost: C, on_evicted: E) -> FnHooks<C, E>
    where
        C: Fn(&V) -> u64 + Send + Sync,
        E: Fn(K, V, EvictionCause) + Send + Sync,
    {
        FnHooks { cost, on_evicted }
    }
}

impl<K, V, C, E> CacheHooks<K, V> for FnHooks<C, E>
where
    C: Fn(&V) -> u64 + Send + Sync,
    E: Fn(K, V, EvictionCause) + Send + Sync,
{
    fn cost(&self, value: &V) -> u64 {
        (self.cost)(value)
    }

    fn on_evicted(&self, key: K, value: V, cause: EvictionCause) {
        (self.on_evicted)(key, value, cause)
    }
}

/// An object which can be handed back to a pool and reused by a later caller asking for the same shape.
pub trait Poolable: Send + 'static {
    /// What makes two objects interchangeable, e.g. dimensions and pixel format, or element type and length.
    ///
    /// The ordering is used for loose lookups: the smallest resident signature at or above the request is tried.
    type Signature: Ord + Hash + Clone + Debug + Send + Sync + 'static;

    fn signature(&self) -> Self::Signature;

    /// Bytes held by this object; used as its cost in the pool.
    fn byte_size(&self) -> u64;

    /// Logically clear the contents, so that the object looks freshly allocated.
    fn erase(&mut self);

    /// Objects which return false are disposed of instead of pooled.
    fn is_reusable(&self) -> bool {
        true
    }

    /// Whether a resident object with signature `candidate` may serve a loose request for `requested`.
    ///
    /// `pool_half_empty` is true when the pool is using at most half of its budget, and lets implementations be
    /// generous about handing out oversized objects when memory isn't tight.
    fn fits(
        requested: &Self::Signature,
        candidate: &Self::Signature,
        _pool_half_empty: bool,
    ) -> bool {
        requested == candidate
    }
}

/// Makes fresh objects when a pool has nothing suitable, and destroys objects a pool can't keep.
pub trait ObjectFactory<T: Poolable>: Send + Sync {
    /// Allocate a new object with the given signature.
    fn create(&self, signature: &T::Signature) -> T;

    /// Whether a retired object may be pooled.  Objects refused here go to [Self::dispose].
    fn accepts(&self, _item: &T) -> bool {
        true
    }

    /// Release an object which could not be pooled.
    fn dispose(&self, item: T) {
        drop(item)
    }
}
