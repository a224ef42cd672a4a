//! Tensor-parallel mapping and the communication boundary.
//!
//! A sharded projection computes its local slice and hands the partial result
//! to a [`Communicator`], which performs the cross-rank reduction. The
//! collective itself (NCCL, MPI, ...) lives outside this workspace; a
//! single-process deployment uses [`SingleProcess`], for which every collective
//! is the identity.

use std::fmt;

use candle_core::{bail, Result, Tensor};

/// Position of this process inside the tensor-parallel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub tp_size: usize,
    pub tp_rank: usize,
}

impl Default for Mapping {
    fn default() -> Self {
        Self {
            tp_size: 1,
            tp_rank: 0,
        }
    }
}

impl Mapping {
    pub fn new(tp_size: usize, tp_rank: usize) -> Result<Self> {
        if tp_size == 0 {
            bail!("tp_size must be greater than zero");
        }
        if tp_rank >= tp_size {
            bail!("tp_rank {tp_rank} out of range for tp_size {tp_size}");
        }
        Ok(Self { tp_size, tp_rank })
    }

    pub fn is_parallel(&self) -> bool {
        self.tp_size > 1
    }

    /// Splits `total` evenly across ranks, failing when it does not divide.
    pub fn shard(&self, context: &str, total: usize) -> Result<usize> {
        if total % self.tp_size != 0 {
            bail!(
                "{context} ({total}) is not divisible by tp_size {}",
                self.tp_size
            );
        }
        Ok(total / self.tp_size)
    }

    /// Key/value heads held by this rank. When there are fewer key/value heads
    /// than ranks each rank keeps a replica of one head.
    pub fn kv_heads_per_rank(&self, num_kv_heads: usize) -> Result<usize> {
        if num_kv_heads >= self.tp_size {
            self.shard("num_key_value_heads", num_kv_heads)
        } else if self.tp_size % num_kv_heads == 0 {
            Ok(1)
        } else {
            bail!(
                "tp_size {} must be a multiple of num_key_value_heads {num_kv_heads}",
                self.tp_size
            )
        }
    }
}

/// Rounds the vocabulary up to a multiple of the tensor-parallel degree so the
/// output projection shards evenly.
pub fn pad_vocab_size(vocab_size: usize, tp_size: usize) -> usize {
    let tp = tp_size.max(1);
    vocab_size.div_ceil(tp) * tp
}

/// Cross-rank collectives required by sharded layers.
pub trait Communicator: Send + Sync + fmt::Debug {
    fn mapping(&self) -> Mapping;

    /// Element-wise sum of `partial` across every rank.
    fn all_reduce_sum(&self, partial: &Tensor) -> Result<Tensor>;

    /// Concatenates every rank's `local` tensor along `dim`, ordered by rank.
    fn all_gather(&self, local: &Tensor, dim: usize) -> Result<Tensor>;
}

/// Communicator for a group of one: every collective returns its input.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn mapping(&self) -> Mapping {
        Mapping::default()
    }

    fn all_reduce_sum(&self, partial: &Tensor) -> Result<Tensor> {
        Ok(partial.clone())
    }

    fn all_gather(&self, local: &Tensor, _dim: usize) -> Result<Tensor> {
        Ok(local.clone())
    }
}
