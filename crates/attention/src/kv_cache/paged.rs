//! Paged key/value block pool.
//!
//! Storage is split into fixed-capacity blocks of `[kv_heads, block_size,
//! head_dim]` so long contexts never reallocate one monolithic buffer. A
//! request's logical positions map onto its [`BlockTable`] row: position `p`
//! lives in block `row[p / block_size]` at offset `p % block_size`.

use std::cell::Cell;

use candle_core::{DType, Device, Tensor};

use crate::core::errors::{config_err, shape_err};
use crate::core::{to_backend_err, AttentionError};
use crate::kv_cache::api::{BlockId, CacheStats, KvBlockStore};
use crate::kv_cache::params::BlockTable;
use crate::kv_cache::present::PagedAppend;

#[derive(Debug, Clone)]
pub struct BlockPoolConfig {
    pub num_blocks: usize,
    pub kv_heads: usize,
    pub block_size: usize,
    pub head_dim: usize,
    pub dtype: DType,
    pub device: Device,
}

impl BlockPoolConfig {
    pub fn new(
        num_blocks: usize,
        kv_heads: usize,
        block_size: usize,
        head_dim: usize,
        dtype: DType,
        device: Device,
    ) -> Result<Self, AttentionError> {
        if num_blocks == 0 || kv_heads == 0 || block_size == 0 || head_dim == 0 {
            return Err(config_err(format!(
                "block pool dimensions must be non-zero, got blocks={num_blocks} kv_heads={kv_heads} block_size={block_size} head_dim={head_dim}"
            )));
        }
        let cfg = Self {
            num_blocks,
            kv_heads,
            block_size,
            head_dim,
            dtype,
            device,
        };
        log::info!(
            "kv-cache pool init: blocks={} kv_heads={} block_size={} head_dim={} dtype={:?}",
            cfg.num_blocks,
            cfg.kv_heads,
            cfg.block_size,
            cfg.head_dim,
            cfg.dtype
        );
        Ok(cfg)
    }
}

#[derive(Debug)]
struct Block {
    keys: Tensor,
    values: Tensor,
}

impl Block {
    fn new(config: &BlockPoolConfig) -> Result<Self, AttentionError> {
        let shape = (config.kv_heads, config.block_size, config.head_dim);
        let keys = Tensor::zeros(shape, config.dtype, &config.device).map_err(to_backend_err)?;
        let values = Tensor::zeros(shape, config.dtype, &config.device).map_err(to_backend_err)?;
        Ok(Self { keys, values })
    }

    fn store(&mut self, offset: usize, keys: &Tensor, values: &Tensor) -> Result<(), AttentionError> {
        let (heads, chunk, dim) = keys.dims3().map_err(to_backend_err)?;
        let ranges = [0..heads, offset..offset + chunk, 0..dim];
        self.keys = self.keys.slice_assign(&ranges, keys).map_err(to_backend_err)?;
        self.values = self
            .values
            .slice_assign(&ranges, values)
            .map_err(to_backend_err)?;
        Ok(())
    }

    fn slice(&self, len: usize) -> Result<(Tensor, Tensor), AttentionError> {
        let keys = self.keys.narrow(1, 0, len).map_err(to_backend_err)?;
        let values = self.values.narrow(1, 0, len).map_err(to_backend_err)?;
        Ok((keys, values))
    }
}

/// Owner of every physical block. Allocation and eviction belong to the
/// serving runtime; attention layers only read through [`KvBlockStore`].
#[derive(Debug)]
pub struct KvBlockPool {
    config: BlockPoolConfig,
    blocks: Vec<Option<Block>>,
    free: Vec<u32>,
    stats: Cell<CacheStats>,
}

impl KvBlockPool {
    pub fn new(config: BlockPoolConfig) -> Self {
        let blocks = (0..config.num_blocks).map(|_| None).collect();
        let free = (0..config.num_blocks as u32).rev().collect();
        Self {
            config,
            blocks,
            free,
            stats: Cell::new(CacheStats::default()),
        }
    }

    pub fn config(&self) -> &BlockPoolConfig {
        &self.config
    }

    pub fn free_blocks(&self) -> usize {
        self.free.len()
    }

    fn update_stats(&self, f: impl FnOnce(&mut CacheStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    pub fn allocate(&mut self) -> Result<BlockId, AttentionError> {
        let id = self.free.pop().ok_or_else(|| {
            config_err(format!(
                "block pool exhausted ({} blocks)",
                self.config.num_blocks
            ))
        })?;
        self.blocks[id as usize] = Some(Block::new(&self.config)?);
        self.update_stats(|s| {
            s.blocks_allocated += 1;
            s.blocks_in_use += 1;
        });
        Ok(BlockId(id))
    }

    /// Enough blocks to hold `tokens` positions.
    pub fn allocate_sequence(&mut self, tokens: usize) -> Result<Vec<BlockId>, AttentionError> {
        let mut row = Vec::new();
        self.reserve(&mut row, tokens)?;
        Ok(row)
    }

    /// Grows `row` until it covers `tokens` positions.
    pub fn reserve(&mut self, row: &mut Vec<BlockId>, tokens: usize) -> Result<(), AttentionError> {
        let needed = tokens.div_ceil(self.config.block_size);
        while row.len() < needed {
            row.push(self.allocate()?);
        }
        Ok(())
    }

    pub fn release(&mut self, row: &[BlockId]) -> Result<(), AttentionError> {
        for &BlockId(id) in row {
            match self.blocks.get_mut(id as usize) {
                Some(slot @ Some(_)) => {
                    *slot = None;
                    self.free.push(id);
                    self.update_stats(|s| s.blocks_in_use -= 1);
                }
                _ => return Err(config_err(format!("block {id} is not allocated"))),
            }
        }
        Ok(())
    }

    fn block(&self, BlockId(id): BlockId) -> Result<&Block, AttentionError> {
        self.blocks
            .get(id as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| shape_err(format!("block {id} is not allocated")))
    }

    /// Writes `[kv_heads, n, head_dim]` keys and values at logical positions
    /// `start..start + n` of `row`.
    pub fn write(
        &mut self,
        row: &[BlockId],
        start: usize,
        keys: &Tensor,
        values: &Tensor,
    ) -> Result<(), AttentionError> {
        let (heads, total, dim) = keys.dims3().map_err(to_backend_err)?;
        if heads != self.config.kv_heads || dim != self.config.head_dim || values.dims() != keys.dims() {
            return Err(shape_err(format!(
                "block write expects [{}, n, {}] keys and values, got {:?} and {:?}",
                self.config.kv_heads,
                self.config.head_dim,
                keys.dims(),
                values.dims()
            )));
        }
        if keys.dtype() != self.config.dtype || values.dtype() != self.config.dtype {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("block writes must use {:?}", self.config.dtype),
            });
        }
        let block_size = self.config.block_size;
        if (start + total).div_ceil(block_size) > row.len() {
            return Err(shape_err(format!(
                "{} blocks cannot hold {} positions",
                row.len(),
                start + total
            )));
        }

        if total > 0 {
            for &id in &row[start / block_size..=(start + total - 1) / block_size] {
                self.block(id)?;
            }
        }

        let mut written = 0;
        while written < total {
            let pos = start + written;
            let offset = pos % block_size;
            let chunk = (block_size - offset).min(total - written);
            let BlockId(id) = row[pos / block_size];
            let block = self
                .blocks
                .get_mut(id as usize)
                .and_then(Option::as_mut)
                .ok_or_else(|| shape_err(format!("block {id} is not allocated")))?;
            let k = keys.narrow(1, written, chunk).map_err(to_backend_err)?;
            let v = values.narrow(1, written, chunk).map_err(to_backend_err)?;
            block.store(offset, &k, &v)?;
            written += chunk;
        }
        self.update_stats(|s| s.tokens_written += total);
        Ok(())
    }

    /// Publishes one layer's new tokens: every request's row is grown as
    /// needed and its tokens land after its past. Returns the new lengths.
    pub fn commit(
        &mut self,
        table: &mut BlockTable,
        past_lengths: &[usize],
        append: &PagedAppend,
    ) -> Result<Vec<usize>, AttentionError> {
        let batch = append.keys.len();
        if table.rows.len() != batch || past_lengths.len() != batch || append.values.len() != batch {
            return Err(shape_err(format!(
                "commit needs matching batch sizes: table={} past_lengths={} keys={} values={}",
                table.rows.len(),
                past_lengths.len(),
                batch,
                append.values.len()
            )));
        }
        let mut lengths = Vec::with_capacity(batch);
        for (request, row) in table.rows.iter_mut().enumerate() {
            let new_tokens = append.keys[request].dim(1).map_err(to_backend_err)?;
            let total = past_lengths[request] + new_tokens;
            self.reserve(row, total)?;
            self.write(
                row,
                past_lengths[request],
                &append.keys[request],
                &append.values[request],
            )?;
            lengths.push(total);
        }
        Ok(lengths)
    }
}

impl KvBlockStore for KvBlockPool {
    fn block_size(&self) -> usize {
        self.config.block_size
    }

    fn gather(&self, row: &[BlockId], len: usize) -> Result<(Tensor, Tensor), AttentionError> {
        let block_size = self.config.block_size;
        if len.div_ceil(block_size) > row.len() {
            self.update_stats(|s| s.misses += 1);
            return Err(shape_err(format!(
                "gather of {len} positions exceeds {} blocks",
                row.len()
            )));
        }
        if len == 0 {
            let empty = Tensor::zeros(
                (self.config.kv_heads, 0usize, self.config.head_dim),
                self.config.dtype,
                &self.config.device,
            )
            .map_err(to_backend_err)?;
            return Ok((empty.clone(), empty));
        }

        let mut key_slices = Vec::with_capacity(row.len());
        let mut value_slices = Vec::with_capacity(row.len());
        let mut remaining = len;
        for &id in row {
            if remaining == 0 {
                break;
            }
            let block = match self.block(id) {
                Ok(block) => block,
                Err(err) => {
                    self.update_stats(|s| s.misses += 1);
                    return Err(err);
                }
            };
            let take = remaining.min(block_size);
            let (k, v) = block.slice(take)?;
            key_slices.push(k);
            value_slices.push(v);
            remaining -= take;
        }

        let keys = Tensor::cat(&key_slices, 1).map_err(to_backend_err)?;
        let values = Tensor::cat(&value_slices, 1).map_err(to_backend_err)?;
        self.update_stats(|s| s.hits += 1);
        log::debug!("kv-cache gather: blocks={} len={len}", key_slices.len());
        Ok((keys, values))
    }

    fn stats(&self) -> CacheStats {
        self.stats.get()
    }
}
