//! Beam-search remapping of cached positions.

use candle_core::{Tensor, D};

use crate::core::errors::{config_err, shape_err};
use crate::core::{to_backend_err, AttentionError};

/// Per-beam source table used during beam search.
///
/// Requests are laid out as `request = batch * beam_width + beam`. Past
/// position `t` of a request is read from beam `table[batch][beam][t]` of the
/// same batch entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheIndirection {
    beam_width: usize,
    table: Vec<Vec<Vec<u32>>>,
}

impl CacheIndirection {
    pub fn new(beam_width: usize, table: Vec<Vec<Vec<u32>>>) -> Result<Self, AttentionError> {
        if beam_width == 0 {
            return Err(config_err("cache indirection requires beam_width > 0"));
        }
        for (batch, beams) in table.iter().enumerate() {
            if beams.len() != beam_width {
                return Err(config_err(format!(
                    "cache indirection batch {batch} has {} beams, expected {beam_width}",
                    beams.len()
                )));
            }
            if let Some(bad) = beams.iter().flatten().find(|&&src| src as usize >= beam_width) {
                return Err(config_err(format!(
                    "cache indirection batch {batch} references beam {bad} >= {beam_width}"
                )));
            }
        }
        Ok(Self { beam_width, table })
    }

    /// Table where every beam reads its own history.
    pub fn identity(batch: usize, beam_width: usize, max_len: usize) -> Result<Self, AttentionError> {
        let table = (0..batch)
            .map(|_| {
                (0..beam_width)
                    .map(|beam| vec![beam as u32; max_len])
                    .collect()
            })
            .collect();
        Self::new(beam_width, table)
    }

    pub fn beam_width(&self) -> usize {
        self.beam_width
    }

    /// Request index each of the first `len` past positions is read from.
    pub fn source_requests(&self, request: usize, len: usize) -> Result<Vec<usize>, AttentionError> {
        let (batch, beam) = (request / self.beam_width, request % self.beam_width);
        let row = self
            .table
            .get(batch)
            .map(|beams| &beams[beam])
            .ok_or_else(|| shape_err(format!("request {request} has no cache indirection row")))?;
        if row.len() < len {
            return Err(shape_err(format!(
                "cache indirection for request {request} covers {} positions, past length is {len}",
                row.len()
            )));
        }
        Ok(row[..len]
            .iter()
            .map(|&src| batch * self.beam_width + src as usize)
            .collect())
    }

    /// Assembles the remapped past of `request`. `fetch(src)` returns the
    /// `[kv_heads, len, head_dim]` past stored for request `src`.
    pub fn remap<F>(&self, request: usize, len: usize, fetch: F) -> Result<(Tensor, Tensor), AttentionError>
    where
        F: Fn(usize) -> Result<(Tensor, Tensor), AttentionError>,
    {
        let sources = self.source_requests(request, len)?;
        if sources.iter().all(|&src| src == request) {
            return fetch(request);
        }

        let first = request - request % self.beam_width;
        let mut keys = Vec::with_capacity(self.beam_width);
        let mut values = Vec::with_capacity(self.beam_width);
        for src in first..first + self.beam_width {
            let (k, v) = fetch(src)?;
            keys.push(k);
            values.push(v);
        }

        // Beam `b`, position `t` lives at row `b * len + t` of the flattened stack.
        let index: Vec<u32> = sources
            .iter()
            .enumerate()
            .map(|(t, &src)| ((src - first) * len + t) as u32)
            .collect();
        let index = Tensor::new(index.as_slice(), keys[0].device()).map_err(to_backend_err)?;
        let pick = |parts: &[Tensor]| -> Result<Tensor, AttentionError> {
            let stacked = Tensor::stack(parts, 1).map_err(to_backend_err)?;
            let (kv_heads, beams, len, head_dim) = stacked.dims4().map_err(to_backend_err)?;
            stacked
                .reshape((kv_heads, beams * len, head_dim))
                .and_then(|flat| flat.index_select(&index, D::Minus2))
                .map_err(to_backend_err)
        };
        Ok((pick(&keys)?, pick(&values)?))
    }
}
