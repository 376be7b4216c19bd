//! Memory pressure handling, and [MemoryCaches], which bundles the result cache with the bitmap and array pools so
//! that a host can size, trim and clear them together.
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::*;

pub const DEFAULT_RESULT_CACHE_SIZE: u64 = 4 * 1024 * 1024;

/// How badly the host wants memory back.  Higher is more severe.
///
/// The `RUNNING_*` levels are sent while the application is in the foreground; the others once it has been hidden
/// or backgrounded.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrimLevel(pub i32);

impl TrimLevel {
    pub const RUNNING_MODERATE: TrimLevel = TrimLevel(5);
    pub const RUNNING_LOW: TrimLevel = TrimLevel(10);
    pub const RUNNING_CRITICAL: TrimLevel = TrimLevel(15);
    pub const UI_HIDDEN: TrimLevel = TrimLevel(20);
    pub const BACKGROUND: TrimLevel = TrimLevel(40);
    pub const MODERATE: TrimLevel = TrimLevel(60);
    pub const COMPLETE: TrimLevel = TrimLevel(80);

    /// The fraction of its budget a cache should keep at this level, or `None` if it shouldn't trim at all.
    ///
    /// Backgrounded, everything goes.  Hidden, or critically low while running, the oldest half goes.
    pub fn retained_fraction(self) -> Option<f64> {
        if self >= TrimLevel::BACKGROUND {
            Some(0.0)
        } else if self >= TrimLevel::UI_HIDDEN || self == TrimLevel::RUNNING_CRITICAL {
            Some(0.5)
        } else {
            None
        }
    }
}

/// A coarse knob for how much memory the caches may use relative to their configured sizes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MemoryCategory {
    Low,
    Normal,
    High,
}

impl MemoryCategory {
    pub fn multiplier(self) -> f32 {
        match self {
            MemoryCategory::Low => 0.5,
            MemoryCategory::Normal => 1.0,
            MemoryCategory::High => 1.5,
        }
    }
}

impl Default for MemoryCategory {
    fn default() -> MemoryCategory {
        MemoryCategory::Normal
    }
}

/// Unset builder fields take their values from [MemoryCachesConfig::default].
#[derive(Clone, Debug, derive_builder::Builder)]
#[builder(default)]
pub struct MemoryCachesConfig {
    /// Budget of the result cache, in bytes.
    pub result_cache_size: u64,
    pub bitmap_pool_size: u64,
    pub array_pool_size: u64,
    /// If false, or if the bitmap pool size is 0, bitmaps are never pooled.
    pub bitmap_pooling: bool,
}

impl Default for MemoryCachesConfig {
    fn default() -> MemoryCachesConfig {
        MemoryCachesConfig {
            result_cache_size: DEFAULT_RESULT_CACHE_SIZE,
            bitmap_pool_size: DEFAULT_BITMAP_POOL_SIZE,
            array_pool_size: DEFAULT_ARRAY_POOL_SIZE,
            bitmap_pooling: true,
        }
    }
}

pub struct MemoryCaches<K, T> {
    result_cache: ResultCache<K, T>,
    bitmap_pool: Arc<dyn ObjectPool<Bitmap>>,
    array_pool: LruArrayPool,
    category: Mutex<MemoryCategory>,
}

impl<K: Hash + Eq + Clone, T: Send + Sync + 'static> MemoryCaches<K, T> {
    pub fn new(config: &MemoryCachesConfig) -> MemoryCaches<K, T> {
        let strategy = if config.bitmap_pooling && config.bitmap_pool_size > 0 {
            PoolStrategy::Lru(bitmap_pool_config(config.bitmap_pool_size))
        } else {
            PoolStrategy::Disabled
        };
        debug!(?config, "creating memory caches");

        MemoryCaches {
            result_cache: ResultCache::new(config.result_cache_size),
            bitmap_pool: Arc::from(strategy.build::<Bitmap, _>(BitmapAllocator::default())),
            array_pool: LruArrayPool::with_max_size(config.array_pool_size),
            category: Mutex::new(MemoryCategory::Normal),
        }
    }

    pub fn result_cache(&self) -> &ResultCache<K, T> {
        &self.result_cache
    }

    pub fn bitmap_pool(&self) -> &Arc<dyn ObjectPool<Bitmap>> {
        &self.bitmap_pool
    }

    pub fn array_pool(&self) -> &LruArrayPool {
        &self.array_pool
    }

    /// Empty everything.  The result cache goes first, so anything it releases into the pools is cleared as well.
    pub fn clear_memory(&self) {
        self.result_cache.clear_memory();
        self.bitmap_pool.clear_memory();
        self.array_pool.clear_memory();
    }

    pub fn trim_memory(&self, level: TrimLevel) {
        debug!(?level, "trimming memory caches");
        self.result_cache.trim_memory(level);
        self.bitmap_pool.trim_memory(level);
        self.array_pool.trim_memory(level);
    }

    pub fn memory_category(&self) -> MemoryCategory {
        *self.category.lock()
    }

    /// Scale the result cache and the bitmap pool, returning the previous category.  The array pool keeps its size.
    pub fn set_memory_category(&self, category: MemoryCategory) -> Result<MemoryCategory, CacheError> {
        let mut current = self.category.lock();
        let multiplier = category.multiplier();
        self.result_cache.set_size_multiplier(multiplier)?;
        self.bitmap_pool.set_size_multiplier(multiplier)?;
        debug!(?category, previous = ?*current, "memory category changed");
        Ok(std::mem::replace(&mut *current, category))
    }
}

impl<K: Hash + Eq + Clone> MemoryCaches<K, Bitmap> {
    /// Send bitmaps the result cache lets go of to the bitmap pool, provided nothing else still holds them.
    pub fn recycle_removed_bitmaps(&self) {
        let pool = self.bitmap_pool.clone();
        self.result_cache
            .set_resource_removed_listener(move |removed: Resource<Bitmap>| {
                if let Ok(bitmap) = Arc::try_unwrap(removed.into_arc()) {
                    pool.put(bitmap);
                }
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> MemoryCachesConfig {
        MemoryCachesConfigBuilder::default()
            .result_cache_size(100)
            .bitmap_pool_size(10_000)
            .array_pool_size(1000)
            .build()
            .expect("Should build")
    }

    fn bitmap_caches() -> MemoryCaches<u32, Bitmap> {
        let caches = MemoryCaches::new(
            &MemoryCachesConfigBuilder::default()
                .result_cache_size(1000)
                .bitmap_pool_size(10_000)
                .build()
                .expect("Should build"),
        );
        caches.recycle_removed_bitmaps();
        caches
    }

    fn bitmap_resource() -> Resource<Bitmap> {
        let bitmap = Bitmap::new(10, 10, PixelFormat::Argb8888);
        let size = bitmap.byte_size();
        Resource::new(bitmap, size)
    }

    #[test]
    fn test_retained_fraction() {
        assert_eq!(TrimLevel::RUNNING_MODERATE.retained_fraction(), None);
        assert_eq!(TrimLevel::RUNNING_LOW.retained_fraction(), None);
        assert_eq!(TrimLevel::RUNNING_CRITICAL.retained_fraction(), Some(0.5));
        assert_eq!(TrimLevel::UI_HIDDEN.retained_fraction(), Some(0.5));
        assert_eq!(TrimLevel(30).retained_fraction(), Some(0.5));
        assert_eq!(TrimLevel::BACKGROUND.retained_fraction(), Some(0.0));
        assert_eq!(TrimLevel::MODERATE.retained_fraction(), Some(0.0));
        assert_eq!(TrimLevel::COMPLETE.retained_fraction(), Some(0.0));
    }

    #[test]
    fn test_default_config() {
        let built = MemoryCachesConfigBuilder::default()
            .build()
            .expect("Should build");
        let default = MemoryCachesConfig::default();
        assert_eq!(built.result_cache_size, default.result_cache_size);
        assert_eq!(built.bitmap_pool_size, default.bitmap_pool_size);
        assert_eq!(built.array_pool_size, 4 * 1024 * 1024);
        assert!(built.bitmap_pooling);

        // A partly set builder takes everything else from the defaults.
        let partial = MemoryCachesConfigBuilder::default()
            .array_pool_size(1)
            .build()
            .expect("Should build");
        assert_eq!(partial.array_pool_size, 1);
        assert_eq!(partial.result_cache_size, DEFAULT_RESULT_CACHE_SIZE);
        assert_eq!(partial.bitmap_pool_size, DEFAULT_BITMAP_POOL_SIZE);
        assert!(partial.bitmap_pooling);

        let caches = MemoryCaches::<u32, String>::new(&default);
        assert_eq!(caches.result_cache().max_size(), DEFAULT_RESULT_CACHE_SIZE);
        assert_eq!(caches.bitmap_pool().max_size(), DEFAULT_BITMAP_POOL_SIZE);
        assert_eq!(caches.array_pool().max_size(), DEFAULT_ARRAY_POOL_SIZE);
    }

    #[test]
    fn test_bitmap_pooling_disabled() {
        let mut config = test_config();
        config.bitmap_pooling = false;
        let caches = MemoryCaches::<u32, String>::new(&config);

        let pool = caches.bitmap_pool();
        assert_eq!(pool.max_size(), 0);
        pool.put(Bitmap::new(10, 10, PixelFormat::Argb8888));
        assert_eq!(pool.current_size(), 0);

        config.bitmap_pooling = true;
        config.bitmap_pool_size = 0;
        let caches = MemoryCaches::<u32, String>::new(&config);
        assert_eq!(caches.bitmap_pool().max_size(), 0);
    }

    #[test]
    fn test_memory_category() {
        let caches = MemoryCaches::<&'static str, String>::new(&test_config());
        assert_eq!(caches.memory_category(), MemoryCategory::Normal);

        assert_eq!(
            caches.set_memory_category(MemoryCategory::High).unwrap(),
            MemoryCategory::Normal
        );
        assert_eq!(caches.result_cache().max_size(), 150);
        assert_eq!(caches.bitmap_pool().max_size(), 15_000);
        assert_eq!(caches.array_pool().max_size(), 1000);

        for k in &["a", "b", "c", "d"] {
            caches
                .result_cache()
                .put(*k, Resource::new(k.to_string(), 20));
        }
        assert_eq!(
            caches.set_memory_category(MemoryCategory::Low).unwrap(),
            MemoryCategory::High
        );
        assert_eq!(caches.result_cache().max_size(), 50);
        assert_eq!(caches.result_cache().current_size(), 40);
        assert_eq!(caches.memory_category(), MemoryCategory::Low);
    }

    #[test]
    fn test_trim_and_clear_fan_out() {
        let caches = MemoryCaches::<&'static str, String>::new(&test_config());
        for k in &["a", "b", "c", "d"] {
            caches
                .result_cache()
                .put(*k, Resource::new(k.to_string(), 20));
        }
        for _ in 0..4 {
            caches.array_pool().put(ScratchBuffer::Bytes(vec![0; 200]));
        }
        caches
            .bitmap_pool()
            .put(Bitmap::new(10, 10, PixelFormat::Argb8888));

        caches.trim_memory(TrimLevel::RUNNING_LOW);
        assert_eq!(caches.result_cache().current_size(), 80);
        assert_eq!(caches.array_pool().current_size(), 800);

        caches.trim_memory(TrimLevel::UI_HIDDEN);
        assert_eq!(caches.result_cache().current_size(), 40);
        assert_eq!(caches.array_pool().current_size(), 400);
        // Bitmaps don't survive the application being hidden.
        assert_eq!(caches.bitmap_pool().current_size(), 0);

        caches
            .bitmap_pool()
            .put(Bitmap::new(10, 10, PixelFormat::Argb8888));

        caches.trim_memory(TrimLevel::BACKGROUND);
        assert!(caches.result_cache().is_empty());
        assert!(caches.array_pool().is_empty());
        assert_eq!(caches.bitmap_pool().current_size(), 0);

        caches.array_pool().put(ScratchBuffer::Ints(vec![0; 10]));
        caches.clear_memory();
        assert!(caches.array_pool().is_empty());
    }

    #[test]
    fn test_evicted_bitmaps_are_recycled() {
        let caches = bitmap_caches();
        for k in 0..3 {
            caches.result_cache().put(k, bitmap_resource());
        }
        assert_eq!(caches.result_cache().len(), 2);
        assert_eq!(caches.bitmap_pool().current_size(), 400);

        caches
            .bitmap_pool()
            .get(&BitmapSignature::new(10, 10, PixelFormat::Argb8888));
        assert_eq!(caches.bitmap_pool().current_size(), 0);
    }

    #[test]
    fn test_shared_bitmaps_are_not_recycled() {
        let caches = bitmap_caches();
        let held = bitmap_resource();
        caches.result_cache().put(0, held.clone());
        caches.result_cache().put(1, bitmap_resource());
        caches.result_cache().put(2, bitmap_resource());

        assert!(!caches.result_cache().contains(&0));
        assert_eq!(held.ref_count(), 1);
        assert_eq!(caches.bitmap_pool().current_size(), 0);
    }

    #[test]
    fn test_clear_empties_recycled_bitmaps_too() {
        let caches = bitmap_caches();
        caches.result_cache().put(0, bitmap_resource());
        caches.result_cache().put(1, bitmap_resource());

        caches.clear_memory();
        assert!(caches.result_cache().is_empty());
        assert_eq!(caches.bitmap_pool().current_size(), 0);
    }
}
