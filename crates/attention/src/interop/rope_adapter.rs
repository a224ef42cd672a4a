//! Integration with the rotary position embedding kernels.
//!
//! Attention layers rotate queries and keys laid out as
//! `[batch, num_heads, seq_len, head_dim]` before scoring. The adapter picks
//! the rotary convention once and defers to the embedding crate for the
//! numerical kernels and the shared sin/cos cache.

use candle_core::{bail, Result, Tensor};
use embedding::positional::rope::{Rope, Rope2d, RopeConfig, RopeScaling};

/// Rotary convention applied inside an attention layer.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RopeAdapter {
    /// Positions are injected elsewhere (learned embeddings).
    #[default]
    None,
    /// Leading `rotate_dim` features rotated by the token position.
    OneDimensional(Rope),
    /// Head halves rotated by position and block index respectively.
    TwoDimensional(Rope2d),
}

impl RopeAdapter {
    pub fn one_dimensional(config: RopeConfig) -> Result<Self> {
        Ok(Self::OneDimensional(Rope::new(config)?))
    }

    pub fn two_dimensional(head_dim: usize, rope_theta: f32, scaling: RopeScaling) -> Result<Self> {
        Ok(Self::TwoDimensional(Rope2d::new(head_dim, rope_theta, scaling)?))
    }

    /// Whether the adapter needs a block index next to every position.
    pub fn needs_blocks(&self) -> bool {
        matches!(self, Self::TwoDimensional(_))
    }

    /// Rotates `q` and `k` for tokens at `positions` (rank-1 integer tensor,
    /// one entry per sequence step). `q` and `k` may carry different head
    /// counts.
    pub fn apply(
        &self,
        q: &Tensor,
        k: &Tensor,
        positions: &Tensor,
        blocks: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        if !q.device().same_device(k.device()) {
            bail!("q and k must reside on the same device");
        }
        match self {
            Self::None => Ok((q.clone(), k.clone())),
            Self::OneDimensional(rope) => rope.apply_rotary_embeddings(q, k, positions),
            Self::TwoDimensional(rope) => {
                let Some(blocks) = blocks else {
                    bail!("2d rotary embedding requires block indices");
                };
                Ok((rope.apply(q, positions, blocks)?, rope.apply(k, positions, blocks)?))
            }
        }
    }
}
