#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("size multiplier must be >= 0, got {0}")]
    InvalidMultiplier(f32),
}
