//! Scratch buffers for decoders, and the pool which recycles them.
//!
//! Unlike bitmaps, a buffer longer than requested is still useful, so the array pool matches loosely: the shortest
//! pooled buffer of the right element type that is at least as long as the request.  To stop small requests from
//! pinning huge buffers, a buffer more than 8 times the requested length is only handed out while the pool is at most
//! half full.
use crate::*;

/// Size of the buffers decoders usually ask for.
pub const STANDARD_BUFFER_SIZE_BYTES: usize = 64 * 1024;

pub const DEFAULT_ARRAY_POOL_SIZE: u64 = 4 * 1024 * 1024;

/// A single buffer may use at most this fraction of the pool.
const SINGLE_ARRAY_MAX_SIZE_DIVISOR: u64 = 2;

const MAX_OVER_SIZE_MULTIPLE: usize = 8;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BufferKind {
    Bytes,
    Ints,
}

impl BufferKind {
    pub fn element_size(self) -> u64 {
        match self {
            BufferKind::Bytes => 1,
            BufferKind::Ints => 4,
        }
    }
}

/// Element type and length.  Ordered by kind first, so that loose lookups never cross element types.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferSignature {
    pub kind: BufferKind,
    pub len: usize,
}

impl BufferSignature {
    pub fn bytes(len: usize) -> BufferSignature {
        BufferSignature {
            kind: BufferKind::Bytes,
            len,
        }
    }

    pub fn ints(len: usize) -> BufferSignature {
        BufferSignature {
            kind: BufferKind::Ints,
            len,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ScratchBuffer {
    Bytes(Vec<u8>),
    Ints(Vec<i32>),
}

impl ScratchBuffer {
    /// A zeroed buffer.
    pub fn new(signature: BufferSignature) -> ScratchBuffer {
        match signature.kind {
            BufferKind::Bytes => ScratchBuffer::Bytes(vec![0; signature.len]),
            BufferKind::Ints => ScratchBuffer::Ints(vec![0; signature.len]),
        }
    }

    pub fn kind(&self) -> BufferKind {
        match self {
            ScratchBuffer::Bytes(_) => BufferKind::Bytes,
            ScratchBuffer::Ints(_) => BufferKind::Ints,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ScratchBuffer::Bytes(b) => b.len(),
            ScratchBuffer::Ints(i) => i.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            ScratchBuffer::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_ints_mut(&mut self) -> Option<&mut [i32]> {
        match self {
            ScratchBuffer::Ints(i) => Some(i),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            ScratchBuffer::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn into_ints(self) -> Option<Vec<i32>> {
        match self {
            ScratchBuffer::Ints(i) => Some(i),
            _ => None,
        }
    }
}

impl Poolable for ScratchBuffer {
    type Signature = BufferSignature;

    fn signature(&self) -> BufferSignature {
        BufferSignature {
            kind: self.kind(),
            len: self.len(),
        }
    }

    fn byte_size(&self) -> u64 {
        self.len() as u64 * self.kind().element_size()
    }

    fn erase(&mut self) {
        match self {
            ScratchBuffer::Bytes(b) => b.iter_mut().for_each(|x| *x = 0),
            ScratchBuffer::Ints(i) => i.iter_mut().for_each(|x| *x = 0),
        }
    }

    fn fits(
        requested: &BufferSignature,
        candidate: &BufferSignature,
        pool_half_empty: bool,
    ) -> bool {
        candidate.kind == requested.kind
            && candidate.len >= requested.len
            && (pool_half_empty || candidate.len <= MAX_OVER_SIZE_MULTIPLE * requested.len)
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct BufferAllocator;

impl ObjectFactory<ScratchBuffer> for BufferAllocator {
    fn create(&self, signature: &BufferSignature) -> ScratchBuffer {
        trace_allocation(signature);
        ScratchBuffer::new(*signature)
    }
}

fn trace_allocation(signature: &BufferSignature) {
    tracing::trace!(
        kind = ?signature.kind,
        bytes = signature.len as u64 * signature.kind.element_size(),
        "allocated scratch buffer"
    );
}

pub type LruArrayPool = ReusablePool<ScratchBuffer, BufferAllocator>;

/// Loose matching, and no single buffer may take more than half the pool.
pub fn array_pool_config(max_size: u64) -> PoolConfig {
    PoolConfig {
        max_size,
        max_single_item_size: Some(max_size / SINGLE_ARRAY_MAX_SIZE_DIVISOR),
        match_mode: MatchMode::Loose,
        trim_clears_at: TrimLevel::BACKGROUND,
    }
}

impl LruArrayPool {
    pub fn with_max_size(max_size: u64) -> LruArrayPool {
        ReusablePool::new(BufferAllocator, array_pool_config(max_size))
    }
}
