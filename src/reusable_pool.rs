//! A [ReusablePool] recycles objects by shape rather than by identity.
//!
//! Retired objects are put back with [ReusablePool::put] and land in a bucket for their [Poolable::Signature].  A later
//! [ReusablePool::get] for a compatible signature takes one out again instead of allocating.  All resident objects
//! share one byte budget, enforced by a [CostBasedLru] keyed by `(signature, serial)`: when the budget is exceeded
//! the coldest objects, whatever their bucket, are handed to [ObjectFactory::dispose].
//!
//! Lookups never fail.  When nothing suitable is resident the factory makes a fresh object.
//!
//! As with [LruCache], the lock covers the engine and the bucket index together, and the factory is only ever called
//! once the lock has been released.  A factory's `dispose` may therefore forward objects into another pool, or even
//! back into this one.
use std::collections::{BTreeMap, VecDeque};
use std::marker::PhantomData;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::*;

/// How a requested signature is matched against resident ones.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MatchMode {
    /// Only an identical signature will do.
    Strict,
    /// The smallest resident signature at or above the request, if [Poolable::fits] accepts it.
    Loose,
}

impl Default for MatchMode {
    fn default() -> MatchMode {
        MatchMode::Strict
    }
}

#[derive(Clone, Debug, derive_builder::Builder)]
pub struct PoolConfig {
    /// Maximum total bytes of pooled objects.
    pub max_size: u64,
    /// Objects bigger than this are disposed of instead of pooled, even if the pool could fit them.
    #[builder(default, setter(strip_option))]
    pub max_single_item_size: Option<u64>,
    /// How [ReusablePool::get] and [ReusablePool::get_dirty] match requests.
    #[builder(default)]
    pub match_mode: MatchMode,
    /// [ReusablePool::trim_memory] empties the pool at this level or above.  Below it, [TrimLevel::retained_fraction]
    /// decides.
    #[builder(default = "TrimLevel::BACKGROUND")]
    pub trim_clears_at: TrimLevel,
}

/// Counters describing how well a pool is doing.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub evictions: u64,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct PoolKey<S> {
    signature: S,
    serial: u64,
}

struct PoolState<T: Poolable> {
    lru: CostBasedLru<PoolKey<T::Signature>, T>,
    /// Serials of the resident objects of each signature, oldest first.  Buckets are never left empty.
    buckets: BTreeMap<T::Signature, VecDeque<u64>>,
    next_serial: u64,
    stats: PoolStats,
}

impl<T: Poolable> PoolState<T> {
    fn new(max_size: u64) -> PoolState<T> {
        PoolState {
            lru: CostBasedLru::new(max_size),
            buckets: Default::default(),
            next_serial: 0,
            stats: Default::default(),
        }
    }

    fn is_half_empty(&self) -> bool {
        let current = self.lru.current_size();
        current == 0 || self.lru.max_size() / current >= 2
    }

    /// Drop evicted objects from the bucket index.
    fn forget(&mut self, evicted: &[(PoolKey<T::Signature>, T)]) {
        for (key, _) in evicted {
            if let Some(bucket) = self.buckets.get_mut(&key.signature) {
                if let Some(pos) = bucket.iter().position(|s| *s == key.serial) {
                    bucket.remove(pos);
                }
                if bucket.is_empty() {
                    self.buckets.remove(&key.signature);
                }
            }
        }
        self.stats.evictions += evicted.len() as u64;
    }

    /// Find the bucket which should serve a request, if any.
    fn find(&self, requested: &T::Signature, mode: MatchMode) -> Option<T::Signature> {
        match mode {
            MatchMode::Strict => self
                .buckets
                .contains_key(requested)
                .then(|| requested.clone()),
            MatchMode::Loose => {
                let (candidate, _) = self.buckets.range(requested.clone()..).next()?;
                T::fits(requested, candidate, self.is_half_empty()).then(|| candidate.clone())
            }
        }
    }

    fn take(&mut self, requested: &T::Signature, mode: MatchMode) -> Option<T> {
        let signature = self.find(requested, mode)?;
        let bucket = self.buckets.get_mut(&signature)?;
        // Most recently returned first.
        let serial = bucket.pop_back()?;
        if bucket.is_empty() {
            self.buckets.remove(&signature);
        }

        self.lru.remove(&PoolKey { signature, serial })
    }
}

pub struct ReusablePool<T: Poolable, F> {
    state: Mutex<PoolState<T>>,
    factory: F,
    config: PoolConfig,
}

impl<T: Poolable, F: ObjectFactory<T>> ReusablePool<T, F> {
    pub fn new(factory: F, config: PoolConfig) -> ReusablePool<T, F> {
        ReusablePool {
            state: Mutex::new(PoolState::new(config.max_size)),
            factory,
            config,
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn take(&self, requested: &T::Signature, mode: MatchMode) -> Option<T> {
        let mut state = self.state.lock();
        let found = state.take(requested, mode);
        if found.is_some() {
            state.stats.hits += 1;
        } else {
            state.stats.misses += 1;
        }
        trace!(
            signature = ?requested,
            hit = found.is_some(),
            current_size = state.lru.current_size(),
            "pool lookup"
        );
        found
    }

    /// An object for `signature`, with its contents erased.  Recycled if possible, freshly made otherwise.
    pub fn get(&self, signature: &T::Signature) -> T {
        match self.take(signature, self.config.match_mode) {
            Some(mut item) => {
                item.erase();
                item
            }
            None => self.factory.create(signature),
        }
    }

    /// Like [Self::get], but a recycled object keeps whatever it held.  The caller must overwrite it before reading.
    pub fn get_dirty(&self, signature: &T::Signature) -> T {
        self.take(signature, self.config.match_mode)
            .unwrap_or_else(|| self.factory.create(signature))
    }

    /// Like [Self::get], but only an identical signature is accepted, whatever the configured [MatchMode].
    pub fn get_exact(&self, signature: &T::Signature) -> T {
        match self.take(signature, MatchMode::Strict) {
            Some(mut item) => {
                item.erase();
                item
            }
            None => self.factory.create(signature),
        }
    }

    /// Hand an object back for reuse.  The caller must not keep using it.
    ///
    /// Objects which aren't reusable, are refused by the factory, are over the single item limit, or cost at least the
    /// whole budget are disposed of straight away.  Otherwise the object is pooled, and the coldest objects are disposed of if that takes the
    /// pool over budget.
    pub fn put(&self, item: T) {
        let cost = item.byte_size();
        let too_big = self
            .config
            .max_single_item_size
            .map_or(false, |limit| cost > limit);
        if !item.is_reusable() || too_big || !self.factory.accepts(&item) {
            trace!(signature = ?item.signature(), cost, "rejected object from pool");
            self.factory.dispose(item);
            return;
        }

        let signature = item.signature();
        let evicted = {
            let mut state = self.state.lock();
            let serial = state.next_serial;
            state.next_serial += 1;
            let key = PoolKey {
                signature: signature.clone(),
                serial,
            };

            let insertion = state.lru.insert(key, item, cost);
            match insertion {
                Insertion::Rejected(_, item) => {
                    drop(state);
                    trace!(?signature, cost, "object too large for pool");
                    self.factory.dispose(item);
                    return;
                }
                Insertion::Admitted { evicted, .. } => {
                    state
                        .buckets
                        .entry(signature)
                        .or_insert_with(VecDeque::new)
                        .push_back(serial);
                    state.stats.puts += 1;
                    state.forget(&evicted);
                    evicted
                }
            }
        };

        self.dispose_all(evicted);
    }

    fn dispose_all(&self, evicted: Vec<(PoolKey<T::Signature>, T)>) {
        for (key, item) in evicted {
            trace!(signature = ?key.signature, "evicting pooled object");
            self.factory.dispose(item);
        }
    }

    /// Dispose of the coldest objects until at most `target` bytes are pooled.
    pub fn trim_to_size(&self, target: u64) {
        let evicted = {
            let mut state = self.state.lock();
            let evicted = state.lru.trim_to_size(target);
            state.forget(&evicted);
            evicted
        };
        self.dispose_all(evicted);
    }

    /// Dispose of every pooled object.
    pub fn clear_memory(&self) {
        let evicted = {
            let mut state = self.state.lock();
            let evicted = state.lru.clear();
            state.forget(&evicted);
            evicted
        };
        debug!(evicted = evicted.len(), "cleared pool");
        self.dispose_all(evicted);
    }

    pub fn trim_memory(&self, level: TrimLevel) {
        if level >= self.config.trim_clears_at {
            debug!(?level, "trim clears pool");
            self.clear_memory();
            return;
        }

        match level.retained_fraction() {
            Some(f) if f <= 0.0 => self.clear_memory(),
            Some(f) => self.trim_to_size((self.max_size() as f64 * f) as u64),
            None => {}
        }
    }

    pub fn set_size_multiplier(&self, multiplier: f32) -> Result<(), CacheError> {
        let evicted = {
            let mut state = self.state.lock();
            let evicted = state.lru.set_size_multiplier(multiplier)?;
            state.forget(&evicted);
            evicted
        };
        self.dispose_all(evicted);
        Ok(())
    }

    pub fn max_size(&self) -> u64 {
        self.state.lock().lru.max_size()
    }

    pub fn current_size(&self) -> u64 {
        self.state.lock().lru.current_size()
    }

    /// Number of pooled objects.
    pub fn len(&self) -> usize {
        self.state.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().lru.is_empty()
    }

    pub fn stats(&self) -> PoolStats {
        self.state.lock().stats
    }
}

/// The operations shared by every pool strategy, so that callers can hold a `Box<dyn ObjectPool<T>>` without caring
/// whether pooling is enabled.
pub trait ObjectPool<T: Poolable>: Send + Sync {
    fn get(&self, signature: &T::Signature) -> T;
    fn get_dirty(&self, signature: &T::Signature) -> T;
    fn put(&self, item: T);
    fn max_size(&self) -> u64;
    fn current_size(&self) -> u64;
    fn set_size_multiplier(&self, multiplier: f32) -> Result<(), CacheError>;
    fn clear_memory(&self);
    fn trim_memory(&self, level: TrimLevel);
}

impl<T: Poolable, F: ObjectFactory<T>> ObjectPool<T> for ReusablePool<T, F> {
    fn get(&self, signature: &T::Signature) -> T {
        ReusablePool::get(self, signature)
    }

    fn get_dirty(&self, signature: &T::Signature) -> T {
        ReusablePool::get_dirty(self, signature)
    }

    fn put(&self, item: T) {
        ReusablePool::put(self, item)
    }

    fn max_size(&self) -> u64 {
        ReusablePool::max_size(self)
    }

    fn current_size(&self) -> u64 {
        ReusablePool::current_size(self)
    }

    fn set_size_multiplier(&self, multiplier: f32) -> Result<(), CacheError> {
        ReusablePool::set_size_multiplier(self, multiplier)
    }

    fn clear_memory(&self) {
        ReusablePool::clear_memory(self)
    }

    fn trim_memory(&self, level: TrimLevel) {
        ReusablePool::trim_memory(self, level)
    }
}

/// The strategy for when pooling is turned off: every get allocates and every put disposes.
pub struct NoPool<T, F> {
    factory: F,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Poolable, F: ObjectFactory<T>> NoPool<T, F> {
    pub fn new(factory: F) -> NoPool<T, F> {
        NoPool {
            factory,
            _marker: PhantomData,
        }
    }
}

impl<T: Poolable, F: ObjectFactory<T>> ObjectPool<T> for NoPool<T, F> {
    fn get(&self, signature: &T::Signature) -> T {
        self.factory.create(signature)
    }

    fn get_dirty(&self, signature: &T::Signature) -> T {
        self.factory.create(signature)
    }

    fn put(&self, item: T) {
        self.factory.dispose(item)
    }

    fn max_size(&self) -> u64 {
        0
    }

    fn current_size(&self) -> u64 {
        0
    }

    /// Nothing to scale, but a negative multiplier is still refused.
    fn set_size_multiplier(&self, multiplier: f32) -> Result<(), CacheError> {
        if !(multiplier >= 0.0) {
            return Err(CacheError::InvalidMultiplier(multiplier));
        }
        Ok(())
    }

    fn clear_memory(&self) {}

    fn trim_memory(&self, _level: TrimLevel) {}
}

/// Which pool to build.
#[derive(Clone, Debug)]
pub enum PoolStrategy {
    Lru(PoolConfig),
    Disabled,
}

impl PoolStrategy {
    pub fn build<T, F>(self, factory: F) -> Box<dyn ObjectPool<T>>
    where
        T: Poolable,
        F: ObjectFactory<T> + 'static,
    {
        match self {
            PoolStrategy::Lru(config) => Box::new(ReusablePool::new(factory, config)),
            PoolStrategy::Disabled => Box::new(NoPool::new(factory)),
        }
    }
}
