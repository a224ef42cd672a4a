//! Batch layout and position inputs.
//!
//! With padding removed every request's tokens are packed back to back into a
//! single `[tokens]` axis; otherwise inputs are `[batch, seq]` with each
//! request's tokens at the front of its row. Both layouts resolve to the same
//! per-request spans so attention sees identical inputs either way.

use candle_core::{DType, Device, IndexOp, Tensor};

use crate::error::{shape_err, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputLayout {
    /// `[batch, seq]` ids, right-padded.
    #[default]
    Padded,
    /// `[tokens]` ids, requests concatenated.
    Packed,
}

/// Position ids shaped like the token ids.
#[derive(Debug, Clone)]
pub enum PositionInput {
    OneDimensional(Tensor),
    /// Position and block index of every token (GLM and ChatGLM-6B).
    TwoDimensional { position: Tensor, block: Tensor },
}

impl PositionInput {
    /// Splits a stacked 2D position tensor: `[2, tokens]` when packed,
    /// `[batch, 2, seq]` when padded.
    pub fn split_2d(ids: &Tensor, layout: InputLayout) -> Result<Self> {
        let axis = match layout {
            InputLayout::Packed => 0,
            InputLayout::Padded => 1,
        };
        let expected_rank = axis + 2;
        if ids.rank() != expected_rank || ids.dim(axis)? != 2 {
            return Err(shape_err(format!(
                "2d position ids for {layout:?} layout must have a size-2 axis {axis} and rank {expected_rank}, got {:?}",
                ids.dims()
            )));
        }
        Ok(Self::TwoDimensional {
            position: ids.narrow(axis, 0, 1)?.squeeze(axis)?,
            block: ids.narrow(axis, 1, 1)?.squeeze(axis)?,
        })
    }

    pub fn is_2d(&self) -> bool {
        matches!(self, Self::TwoDimensional { .. })
    }

    fn check_shape(&self, ids: &Tensor) -> Result<()> {
        let tensors: Vec<&Tensor> = match self {
            Self::OneDimensional(p) => vec![p],
            Self::TwoDimensional { position, block } => vec![position, block],
        };
        for t in tensors {
            if t.dims() != ids.dims() {
                return Err(shape_err(format!(
                    "position ids {:?} must match input ids {:?}",
                    t.dims(),
                    ids.dims()
                )));
            }
        }
        Ok(())
    }
}

/// Tokens of one request within the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestSpan {
    /// Offset into the packed token axis, or the row in the padded layout.
    pub start: usize,
    pub len: usize,
}

/// Request spans of one forward call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchLayout {
    pub layout: InputLayout,
    pub spans: Vec<RequestSpan>,
    /// Padded sequence length; equals the token count when packed.
    pub seq_len: usize,
}

impl BatchLayout {
    /// `input_lengths` lists the real tokens of every request. When absent a
    /// packed batch is one request and every padded row is full.
    pub fn new(input_ids: &Tensor, layout: InputLayout, input_lengths: Option<&[usize]>) -> Result<Self> {
        match layout {
            InputLayout::Packed => {
                let tokens = input_ids.dims1().map_err(|_| {
                    shape_err(format!(
                        "packed input ids must be [tokens], got {:?}",
                        input_ids.dims()
                    ))
                })?;
                let lengths = input_lengths.map(<[usize]>::to_vec).unwrap_or_else(|| vec![tokens]);
                if lengths.iter().sum::<usize>() != tokens {
                    return Err(shape_err(format!(
                        "input lengths {lengths:?} do not sum to {tokens} packed tokens"
                    )));
                }
                let mut start = 0;
                let spans = lengths
                    .iter()
                    .map(|&len| {
                        let span = RequestSpan { start, len };
                        start += len;
                        span
                    })
                    .collect();
                Self {
                    layout,
                    spans,
                    seq_len: tokens,
                }
                .validated()
            }
            InputLayout::Padded => {
                let (batch, seq) = input_ids.dims2().map_err(|_| {
                    shape_err(format!(
                        "padded input ids must be [batch, seq], got {:?}",
                        input_ids.dims()
                    ))
                })?;
                let lengths = input_lengths.map(<[usize]>::to_vec).unwrap_or_else(|| vec![seq; batch]);
                if lengths.len() != batch || lengths.iter().any(|&len| len > seq) {
                    return Err(shape_err(format!(
                        "input lengths {lengths:?} do not fit a [{batch}, {seq}] batch"
                    )));
                }
                let spans = lengths
                    .iter()
                    .enumerate()
                    .map(|(row, &len)| RequestSpan { start: row, len })
                    .collect();
                Self {
                    layout,
                    spans,
                    seq_len: seq,
                }
                .validated()
            }
        }
    }

    fn validated(self) -> Result<Self> {
        if self.spans.is_empty() || self.spans.iter().any(|span| span.len == 0) {
            return Err(shape_err(format!(
                "every request needs at least one token, got lengths {:?}",
                self.spans.iter().map(|span| span.len).collect::<Vec<_>>()
            )));
        }
        Ok(self)
    }

    pub fn batch_size(&self) -> usize {
        self.spans.len()
    }

    /// Real tokens of one request from a `[tokens, ..]` or `[batch, seq, ..]`
    /// tensor, as `[len, ..]`.
    pub fn request(&self, tensor: &Tensor, request: usize) -> Result<Tensor> {
        let span = self.spans[request];
        let t = match self.layout {
            InputLayout::Packed => tensor.narrow(0, span.start, span.len)?,
            InputLayout::Padded => tensor.i(span.start)?.narrow(0, 0, span.len)?,
        };
        Ok(t)
    }

    /// Inverse of [`BatchLayout::request`]: rebuilds the batch tensor from
    /// per-request `[len, width]` rows, zero-filling padded tails.
    pub fn assemble(&self, rows: &[Tensor]) -> Result<Tensor> {
        match self.layout {
            InputLayout::Packed => Ok(Tensor::cat(rows, 0)?),
            InputLayout::Padded => {
                let padded = rows
                    .iter()
                    .zip(&self.spans)
                    .map(|(row, span)| row.pad_with_zeros(0, 0, self.seq_len - span.len))
                    .collect::<candle_core::Result<Vec<_>>>()?;
                Ok(Tensor::stack(&padded, 0)?)
            }
        }
    }
}

/// Rank-1 `u32` position (and block) ids of every request.
#[derive(Debug, Clone)]
pub struct RequestPositions {
    pub positions: Vec<Tensor>,
    pub blocks: Option<Vec<Tensor>>,
}

impl RequestPositions {
    pub fn new(input: &PositionInput, input_ids: &Tensor, batch: &BatchLayout) -> Result<Self> {
        input.check_shape(input_ids)?;
        let split = |t: &Tensor| -> Result<Vec<Tensor>> {
            (0..batch.batch_size())
                .map(|r| Ok(batch.request(t, r)?.to_dtype(DType::U32)?))
                .collect()
        };
        Ok(match input {
            PositionInput::OneDimensional(p) => Self {
                positions: split(p)?,
                blocks: None,
            },
            PositionInput::TwoDimensional { position, block } => Self {
                positions: split(position)?,
                blocks: Some(split(block)?),
            },
        })
    }

    pub fn block(&self, request: usize) -> Option<&Tensor> {
        self.blocks.as_ref().map(|b| &b[request])
    }
}

/// Default position ids for one request.
///
/// 1D: `past + i`. 2D follows the GLM generation convention: during the
/// context phase positions count up and the final token (the generation
/// marker) repeats position `len - 2` with block index 1; each later decode
/// step keeps position `context_len - 2` and advances the block index.
pub fn default_positions(
    two_dimensional: bool,
    past_len: usize,
    new_len: usize,
    context_len: usize,
) -> (Vec<u32>, Option<Vec<u32>>) {
    if !two_dimensional {
        return ((past_len..past_len + new_len).map(|p| p as u32).collect(), None);
    }
    if past_len == 0 {
        let mut positions: Vec<u32> = (0..new_len as u32).collect();
        let mut blocks = vec![0u32; new_len];
        if new_len > 1 {
            positions[new_len - 1] = (new_len - 2) as u32;
            blocks[new_len - 1] = 1;
        }
        return (positions, Some(blocks));
    }
    let anchor = context_len.saturating_sub(2) as u32;
    let positions = vec![anchor; new_len];
    let blocks = (0..new_len)
        .map(|i| (past_len + i + 2).saturating_sub(context_len) as u32)
        .collect();
    (positions, Some(blocks))
}

/// Builds `[batch, seq]` (padded) or `[tokens]` (packed) `u32` ids from
/// per-request rows.
pub fn ids_tensor(rows: &[Vec<u32>], layout: InputLayout, device: &Device) -> Result<Tensor> {
    match layout {
        InputLayout::Packed => {
            let flat: Vec<u32> = rows.iter().flatten().copied().collect();
            Ok(Tensor::new(flat.as_slice(), device)?)
        }
        InputLayout::Padded => {
            let seq = rows.iter().map(Vec::len).max().unwrap_or(0);
            let mut flat = Vec::with_capacity(rows.len() * seq);
            for row in rows {
                flat.extend_from_slice(row);
                flat.extend(std::iter::repeat(0).take(seq - row.len()));
            }
            Ok(Tensor::from_vec(flat, (rows.len(), seq), device)?)
        }
    }
}
