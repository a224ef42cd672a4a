//! Learned absolute position embedding used by GLM-130B.
//!
//! Every token carries a `(position, block)` index pair. Both indices select a
//! row from their own table of `max_position_embeddings + 1` rows and the two
//! rows are summed.

use candle_core::{bail, Result, Tensor};

use crate::token::{TokenEmbedding, TokenEmbeddingConfig};

#[derive(Debug, Clone)]
pub struct PositionBlockEmbedding {
    position: TokenEmbedding,
    block: TokenEmbedding,
}

impl PositionBlockEmbedding {
    pub fn new(
        max_position_embeddings: usize,
        hidden_dim: usize,
        position_weight: Tensor,
        block_weight: Tensor,
    ) -> Result<Self> {
        let config = TokenEmbeddingConfig::new(max_position_embeddings + 1, hidden_dim);
        Ok(Self {
            position: TokenEmbedding::new(config.clone(), position_weight)?,
            block: TokenEmbedding::new(config, block_weight)?,
        })
    }

    pub fn rows(&self) -> usize {
        self.position.config().vocab_size
    }

    /// `embed_position(position_ids) + embed_block(block_ids)`; both id tensors
    /// share one shape and the result appends a hidden axis.
    pub fn forward(&self, position_ids: &Tensor, block_ids: &Tensor) -> Result<Tensor> {
        if position_ids.dims() != block_ids.dims() {
            bail!(
                "position ids {:?} and block ids {:?} must share a shape",
                position_ids.dims(),
                block_ids.dims()
            );
        }
        let position = self.position.forward(position_ids)?;
        let block = self.block.forward(block_ids)?;
        position.add(&block)
    }
}
