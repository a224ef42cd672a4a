//! Cache updates produced by one layer.

use candle_core::Tensor;

use crate::core::errors::shape_err;
use crate::core::{to_backend_err, AttentionError};

/// New tokens of every request, `[kv_heads, new_len, head_dim]` each.
#[derive(Debug, Clone, Default)]
pub struct PagedAppend {
    pub keys: Vec<Tensor>,
    pub values: Vec<Tensor>,
}

/// Updated cache of one layer, built only once every request of the layer
/// has finished.
#[derive(Debug, Clone)]
pub enum LayerPresent {
    /// `[batch, 2, kv_heads, max_total, head_dim]`; request rows shorter than
    /// `max_total` are zero-padded at the end.
    Contiguous(Tensor),
    /// Tokens to append behind each request's past in the block pool.
    Paged(PagedAppend),
}

impl LayerPresent {
    /// Stacks each request's full `[kv_heads, total, head_dim]` history.
    pub fn contiguous(histories: &[(Tensor, Tensor)]) -> Result<Self, AttentionError> {
        if histories.is_empty() {
            return Err(shape_err("present cache needs at least one request"));
        }
        let max_total = histories
            .iter()
            .map(|(k, _)| k.dim(1))
            .collect::<candle_core::Result<Vec<_>>>()
            .map_err(to_backend_err)?
            .into_iter()
            .max()
            .unwrap_or(0);
        let mut slots = Vec::with_capacity(histories.len());
        for (keys, values) in histories {
            let pad = max_total - keys.dim(1).map_err(to_backend_err)?;
            let keys = keys.pad_with_zeros(1, 0, pad).map_err(to_backend_err)?;
            let values = values.pad_with_zeros(1, 0, pad).map_err(to_backend_err)?;
            slots.push(Tensor::stack(&[keys, values], 0).map_err(to_backend_err)?);
        }
        let stacked = Tensor::stack(&slots, 0).map_err(to_backend_err)?;
        Ok(Self::Contiguous(stacked))
    }

    pub fn as_contiguous(&self) -> Option<&Tensor> {
        match self {
            Self::Contiguous(t) => Some(t),
            Self::Paged(_) => None,
        }
    }

    pub fn as_paged(&self) -> Option<&PagedAppend> {
        match self {
            Self::Paged(append) => Some(append),
            Self::Contiguous(_) => None,
        }
    }
}
