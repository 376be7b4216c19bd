//! Decoded images and the pool which recycles them.
//!
//! Bitmaps are only interchangeable when width, height and pixel format all match, so the bitmap pool always matches
//! strictly.  Immutable bitmaps are never pooled, and neither are bitmaps in a format the pool wasn't set up to hold.
//! Unlike the other caches, a bitmap pool is emptied outright once the application is hidden.
use std::collections::BTreeSet;
use std::fmt;

use crate::*;

/// Pool size giving room for four 1080p frames at 4 bytes per pixel.
pub const DEFAULT_BITMAP_POOL_SIZE: u64 = 4 * (1920 * 1080 * 4);

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PixelFormat {
    Alpha8,
    Rgb565,
    Argb4444,
    Argb8888,
    RgbaF16,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> u64 {
        match self {
            PixelFormat::Alpha8 => 1,
            PixelFormat::Rgb565 | PixelFormat::Argb4444 => 2,
            PixelFormat::Argb8888 => 4,
            PixelFormat::RgbaF16 => 8,
        }
    }
}

impl Default for PixelFormat {
    fn default() -> PixelFormat {
        PixelFormat::Argb8888
    }
}

/// The shape of a bitmap: what a pooled bitmap must match to be handed out.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BitmapSignature {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl BitmapSignature {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> BitmapSignature {
        BitmapSignature {
            width,
            height,
            format,
        }
    }

    pub fn byte_size(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.format.bytes_per_pixel()
    }
}

#[derive(Clone, PartialEq)]
pub struct Bitmap {
    signature: BitmapSignature,
    pixels: Vec<u8>,
    mutable: bool,
}

impl Bitmap {
    /// A mutable, fully transparent bitmap.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Bitmap {
        Bitmap::with_signature(BitmapSignature::new(width, height, format))
    }

    pub fn with_signature(signature: BitmapSignature) -> Bitmap {
        Bitmap {
            signature,
            pixels: vec![0; signature.byte_size() as usize],
            mutable: true,
        }
    }

    pub fn width(&self) -> u32 {
        self.signature.width
    }

    pub fn height(&self) -> u32 {
        self.signature.height
    }

    pub fn format(&self) -> PixelFormat {
        self.signature.format
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    /// Freeze the pixels.  Frozen bitmaps can't be recycled.
    pub fn into_immutable(mut self) -> Bitmap {
        self.mutable = false;
        self
    }

    /// Fill every byte of pixel data with `value`.
    pub fn erase_color(&mut self, value: u8) {
        self.pixels.iter_mut().for_each(|p| *p = value);
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bitmap({}x{} {:?}{})",
            self.signature.width,
            self.signature.height,
            self.signature.format,
            if self.mutable { "" } else { " immutable" }
        )
    }
}

impl Poolable for Bitmap {
    type Signature = BitmapSignature;

    fn signature(&self) -> BitmapSignature {
        self.signature
    }

    fn byte_size(&self) -> u64 {
        self.pixels.len() as u64
    }

    /// Make every pixel transparent.
    fn erase(&mut self) {
        self.erase_color(0);
    }

    fn is_reusable(&self) -> bool {
        self.mutable
    }
}

/// Allocates zeroed bitmaps; disposal just frees the pixels.
///
/// Optionally restricted to a set of pixel formats: bitmaps in any other format are refused by the pool.
#[derive(Clone, Debug, Default)]
pub struct BitmapAllocator {
    allowed_formats: Option<BTreeSet<PixelFormat>>,
}

impl BitmapAllocator {
    pub fn with_allowed_formats<I>(formats: I) -> BitmapAllocator
    where
        I: IntoIterator<Item = PixelFormat>,
    {
        BitmapAllocator {
            allowed_formats: Some(formats.into_iter().collect()),
        }
    }

    pub fn allows(&self, format: PixelFormat) -> bool {
        self.allowed_formats
            .as_ref()
            .map_or(true, |allowed| allowed.contains(&format))
    }
}

impl ObjectFactory<Bitmap> for BitmapAllocator {
    fn create(&self, signature: &BitmapSignature) -> Bitmap {
        Bitmap::with_signature(*signature)
    }

    fn accepts(&self, item: &Bitmap) -> bool {
        self.allows(item.format())
    }
}

pub type LruBitmapPool = ReusablePool<Bitmap, BitmapAllocator>;

/// The pool configuration used for bitmaps: strict matching, nothing beyond the budget itself limits single items,
/// and trimming clears the pool from [TrimLevel::UI_HIDDEN] up.
pub fn bitmap_pool_config(max_size: u64) -> PoolConfig {
    PoolConfig {
        max_size,
        max_single_item_size: None,
        match_mode: MatchMode::Strict,
        trim_clears_at: TrimLevel::UI_HIDDEN,
    }
}

impl LruBitmapPool {
    pub fn with_max_size(max_size: u64) -> LruBitmapPool {
        ReusablePool::new(BitmapAllocator::default(), bitmap_pool_config(max_size))
    }

    /// A pool which only keeps bitmaps in one of `formats`.
    pub fn with_allowed_formats<I>(max_size: u64, formats: I) -> LruBitmapPool
    where
        I: IntoIterator<Item = PixelFormat>,
    {
        ReusablePool::new(
            BitmapAllocator::with_allowed_formats(formats),
            bitmap_pool_config(max_size),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn painted(width: u32, height: u32, format: PixelFormat) -> Bitmap {
        let mut b = Bitmap::new(width, height, format);
        b.erase_color(0xff);
        b
    }

    #[test]
    fn test_byte_sizes() {
        assert_eq!(Bitmap::new(10, 10, PixelFormat::Argb8888).byte_size(), 400);
        assert_eq!(Bitmap::new(10, 10, PixelFormat::Rgb565).byte_size(), 200);
        assert_eq!(Bitmap::new(3, 5, PixelFormat::Alpha8).byte_size(), 15);
        assert_eq!(
            BitmapSignature::new(2, 2, PixelFormat::RgbaF16).byte_size(),
            32
        );
        assert_eq!(DEFAULT_BITMAP_POOL_SIZE, 33_177_600);
    }

    #[test]
    fn test_get_recycles_and_erases() {
        let pool = LruBitmapPool::with_max_size(10_000);
        pool.put(painted(10, 10, PixelFormat::Argb8888));
        assert_eq!(pool.current_size(), 400);

        let b = pool.get(&BitmapSignature::new(10, 10, PixelFormat::Argb8888));
        assert!(b.pixels().iter().all(|p| *p == 0));
        assert_eq!(pool.stats().hits, 1);
        assert_eq!(pool.current_size(), 0);
    }

    #[test]
    fn test_get_dirty_keeps_pixels() {
        let pool = LruBitmapPool::with_max_size(10_000);
        pool.put(painted(4, 4, PixelFormat::Rgb565));

        let b = pool.get_dirty(&BitmapSignature::new(4, 4, PixelFormat::Rgb565));
        assert!(b.pixels().iter().all(|p| *p == 0xff));
    }

    #[test]
    fn test_shape_must_match() {
        let pool = LruBitmapPool::with_max_size(10_000);
        pool.put(painted(10, 10, PixelFormat::Argb8888));

        // Same byte count, different shape or format: not interchangeable.
        let b = pool.get_dirty(&BitmapSignature::new(20, 5, PixelFormat::Argb8888));
        assert_eq!((b.width(), b.height()), (20, 5));
        let b = pool.get_dirty(&BitmapSignature::new(10, 20, PixelFormat::Rgb565));
        assert_eq!(b.format(), PixelFormat::Rgb565);
        assert!(b.pixels().iter().all(|p| *p == 0));

        assert_eq!(pool.stats().misses, 2);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_immutable_not_pooled() {
        let pool = LruBitmapPool::with_max_size(10_000);
        pool.put(painted(10, 10, PixelFormat::Argb8888).into_immutable());
        assert!(pool.is_empty());
        assert_eq!(pool.stats().puts, 0);
    }

    #[test]
    fn test_budget_evicts_oldest_bitmap() {
        let pool = LruBitmapPool::with_max_size(1000);
        pool.put(painted(10, 10, PixelFormat::Argb8888));
        pool.put(painted(10, 10, PixelFormat::Rgb565));
        pool.put(painted(20, 10, PixelFormat::Argb8888));

        assert_eq!(pool.current_size(), 1000);
        assert_eq!(pool.stats().evictions, 1);

        pool.put(painted(5, 5, PixelFormat::Alpha8));
        assert_eq!(pool.current_size(), 825);
        assert_eq!(pool.stats().evictions, 2);

        pool.get_dirty(&BitmapSignature::new(10, 10, PixelFormat::Argb8888));
        assert_eq!(pool.stats().misses, 1);
    }

    #[test]
    fn test_disallowed_format_not_pooled() {
        let pool = LruBitmapPool::with_allowed_formats(
            10_000,
            vec![PixelFormat::Argb8888, PixelFormat::Rgb565],
        );
        assert!(pool.factory().allows(PixelFormat::Rgb565));
        assert!(!pool.factory().allows(PixelFormat::Alpha8));

        pool.put(painted(10, 10, PixelFormat::Alpha8));
        assert!(pool.is_empty());
        assert_eq!(pool.stats().puts, 0);

        pool.put(painted(10, 10, PixelFormat::Rgb565));
        assert_eq!(pool.current_size(), 200);

        // Asking for a disallowed format still works; it just always allocates.
        let b = pool.get(&BitmapSignature::new(10, 10, PixelFormat::Alpha8));
        assert_eq!(b.format(), PixelFormat::Alpha8);
        assert_eq!(pool.stats().misses, 1);
    }

    #[test]
    fn test_any_format_allowed_by_default() {
        let allocator = BitmapAllocator::default();
        assert!(allocator.allows(PixelFormat::Alpha8));
        assert!(allocator.allows(PixelFormat::RgbaF16));
    }

    #[test]
    fn test_trim_clears_once_hidden() {
        let pool = LruBitmapPool::with_max_size(1000);
        pool.put(painted(10, 10, PixelFormat::Argb8888));
        pool.put(painted(10, 10, PixelFormat::Rgb565));

        pool.trim_memory(TrimLevel::RUNNING_LOW);
        assert_eq!(pool.current_size(), 600);

        pool.trim_memory(TrimLevel::RUNNING_CRITICAL);
        assert_eq!(pool.current_size(), 200);

        pool.put(painted(10, 10, PixelFormat::Argb8888));
        pool.trim_memory(TrimLevel::UI_HIDDEN);
        assert_eq!(pool.current_size(), 0);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_bitmap_too_large_for_pool() {
        let pool = LruBitmapPool::with_max_size(400);
        pool.put(painted(10, 10, PixelFormat::Argb8888));
        assert!(pool.is_empty());
    }
}
