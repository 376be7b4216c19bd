//! Cost-bounded LRU caches and shape-bucketed object pools, for pipelines which decode large objects such as images.
//!
//! Decoding is expensive, and so is allocating the buffers decoded data lands in.  This crate attacks both costs with
//! one eviction engine and two things built on it:
//!
//! [CostBasedLru] is a standard Lru cache which supports giving each item a cost.  When the cost is exceeded, the cache
//! evicts the least recently used items until it is back under budget, and hands them back to the caller.  Its budget
//! can be scaled at runtime.  This is the low-level building block, and is exposed because it's useful in other
//! contexts.
//!
//! [LruCache] wraps the engine in a lock and adds [CacheHooks] to price values and to learn about evictions.  On top of
//! that, [ResultCache] holds shared [Resource] handles and tells a [ResourceRemovedListener] whenever one leaves.
//!
//! [ReusablePool] is the other use of the engine: retired objects are bucketed by their [Poolable::Signature] and
//! handed to the next caller asking for the same shape, instead of being freed and reallocated.  [LruBitmapPool]
//! recycles [Bitmap]s by exact dimensions and format, and [LruArrayPool] recycles [ScratchBuffer]s, accepting a
//! somewhat longer buffer when no exact one is around.
//!
//! Finally [MemoryCaches] bundles a result cache with both pools so a host can respond to [TrimLevel]s and
//! [MemoryCategory] changes in one place.
mod array_pool;
mod bitmap;
mod cost_based_lru;
mod error;
mod lru_cache;
mod memory;
mod result_cache;
mod reusable_pool;
mod traits;

pub use array_pool::*;
pub use bitmap::*;
pub use cost_based_lru::*;
pub use error::*;
pub use lru_cache::*;
pub use memory::*;
pub use result_cache::*;
pub use reusable_pool::*;
pub use traits::*;
