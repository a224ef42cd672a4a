//! Public traits describing paged key/value storage.

use candle_core::Tensor;

use crate::core::AttentionError;

/// Counters exposed by a block store for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Blocks handed out over the lifetime of the store.
    pub blocks_allocated: usize,
    pub blocks_in_use: usize,
    pub tokens_written: usize,
    /// Successful gathers.
    pub hits: usize,
    /// Gathers that referenced unknown blocks or ran past the table.
    pub misses: usize,
}

/// Opaque handle to one physical cache block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// Storage that resolves block pointers into key/value tensors.
///
/// Gathered tensors have layout `[kv_heads, len, head_dim]`.
pub trait KvBlockStore {
    /// Tokens held by each block.
    fn block_size(&self) -> usize;

    /// Reads the first `len` logical positions addressed by `table`.
    fn gather(&self, table: &[BlockId], len: usize) -> Result<(Tensor, Tensor), AttentionError>;

    fn stats(&self) -> CacheStats;
}
