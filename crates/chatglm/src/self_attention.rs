//! Self-attention of one decoder layer.
//!
//! The fused `qkv` projection runs over the whole batch. Rotary embedding,
//! past resolution, masking and scoring then run request by request, since
//! each request has its own past length, window and positions. The merged
//! heads are reassembled into the batch layout before the row-parallel
//! output projection.

use std::sync::Arc;

use attention::interop::RopeAdapter;
use attention::kv_cache::{CacheMode, LayerCacheView, LayerPresent, PagedAppend};
use attention::masks::build_attention_mask;
use attention::{Attention, AttentionMaskType, Config as AttentionConfig, ExactAttention, HeadLayout};
use candle_core::Tensor;
use embedding::{RopeConfig, RotaryStyle};
use layers::{Communicator, Linear, LinearConfig, PrecisionPolicy, RowLinear};

use crate::config::{PositionScheme, ResolvedConfig};
use crate::error::{config_from, Result};
use crate::position::{BatchLayout, RequestPositions};
use crate::weights::WeightSource;

/// Keys and values of one request, `[1, kv_heads, len, head_dim]` each.
struct RequestKv {
    keys: Tensor,
    values: Tensor,
}

#[derive(Debug)]
pub struct AttentionBlock {
    layer: usize,
    heads: HeadLayout,
    mask_type: AttentionMaskType,
    qkv: Linear,
    dense: RowLinear,
    rope: RopeAdapter,
    kernel: ExactAttention,
    kernel_config: AttentionConfig,
}

impl AttentionBlock {
    /// `prefix` names the layer's attention weights, e.g.
    /// `transformer.layers.3.attention`.
    pub fn new(
        layer: usize,
        prefix: &str,
        config: &ResolvedConfig,
        weights: &dyn WeightSource,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        let heads = config.local_heads()?;
        let hidden = config.hidden_size;
        let local_width = heads.num_heads * heads.head_dim;

        let qkv_width = heads.qkv_width();
        let qkv = Linear::new(
            LinearConfig::new(hidden, qkv_width, config.add_qkv_bias),
            weights.get(&format!("{prefix}.qkv.weight"), &[qkv_width, hidden])?,
            optional(weights, config.add_qkv_bias, &format!("{prefix}.qkv.bias"), qkv_width)?,
        )
        .map_err(config_from)?;
        let dense = RowLinear::new(
            LinearConfig::new(local_width, hidden, config.add_bias_linear),
            weights.get(&format!("{prefix}.dense.weight"), &[hidden, local_width])?,
            optional(weights, config.add_bias_linear, &format!("{prefix}.dense.bias"), hidden)?,
            comm,
        )
        .map_err(config_from)?;

        let rope = match config.strategy.positions {
            PositionScheme::LearnedBlock => RopeAdapter::None,
            PositionScheme::Rotary2d => {
                RopeAdapter::two_dimensional(heads.head_dim, config.rope_base, config.rope_scaling)
                    .map_err(config_from)?
            }
            PositionScheme::Rotary1d => RopeAdapter::one_dimensional(
                RopeConfig {
                    head_dim: heads.head_dim,
                    rope_theta: config.rope_base,
                    rotate_dim: None,
                    scaling: config.rope_scaling,
                    style: RotaryStyle::Interleaved,
                }
                .with_rotary_pct(config.rotary_pct),
            )
            .map_err(config_from)?,
        };

        Ok(Self {
            layer,
            heads,
            mask_type: config.strategy.mask_type,
            qkv,
            dense,
            rope,
            kernel: ExactAttention::new(),
            kernel_config: AttentionConfig::default(),
        })
    }

    pub fn heads(&self) -> HeadLayout {
        self.heads
    }

    pub fn mask_type(&self) -> AttentionMaskType {
        self.mask_type
    }

    /// Attends every request of the batch. With `cache` set, each request's
    /// past is read through the view and the layer's present is returned once
    /// all requests are done; without it nothing is read or written.
    pub fn forward(
        &self,
        hidden: &Tensor,
        batch: &BatchLayout,
        positions: &RequestPositions,
        cache: Option<&LayerCacheView<'_, '_>>,
        policy: &PrecisionPolicy,
    ) -> Result<(Tensor, Option<LayerPresent>)> {
        let qkv = self.qkv.forward(hidden, policy)?;
        let mut merged = Vec::with_capacity(batch.batch_size());
        let mut histories = Vec::new();
        let mut appended = PagedAppend::default();

        for request in 0..batch.batch_size() {
            let rows = batch.request(&qkv, request)?;
            let (q, new) = self.split_heads(&rows)?;
            let (q, new_keys) = self.rope.apply(
                &q,
                &new.keys,
                &positions.positions[request],
                positions.block(request),
            )?;
            let new = RequestKv {
                keys: new_keys,
                values: new.values,
            };

            let (past_len, window, sink, past) = match cache {
                Some(view) => (
                    view.past_length(request)?,
                    view.max_attention_window(),
                    view.sink_token_length(),
                    view.resolve_past(request)?,
                ),
                None => (0, None, 0, None),
            };
            let full = match past {
                Some((past_keys, past_values)) => RequestKv {
                    keys: concat_past(&past_keys, &new.keys)?,
                    values: concat_past(&past_values, &new.values)?,
                },
                None => RequestKv {
                    keys: new.keys.clone(),
                    values: new.values.clone(),
                },
            };

            let q_len = q.dim(2)?;
            let mask = build_attention_mask(q.device(), self.mask_type, q_len, past_len, window, sink)?;
            let context = self.kernel.attend(
                &q,
                &full.keys,
                &full.values,
                Some(&mask),
                &self.kernel_config,
            )?;
            merged.push(
                context
                    .squeeze(0)?
                    .transpose(0, 1)?
                    .contiguous()?
                    .reshape((q_len, self.heads.num_heads * self.heads.head_dim))?,
            );

            if let Some(view) = cache {
                match view.mode() {
                    CacheMode::Contiguous => {
                        // The slot grows from its own history; indirection only
                        // changes what was scored above.
                        let history = match view.stored_past(request)? {
                            Some((own_keys, own_values)) => RequestKv {
                                keys: concat_past(&own_keys, &new.keys)?,
                                values: concat_past(&own_values, &new.values)?,
                            },
                            None => RequestKv {
                                keys: new.keys.clone(),
                                values: new.values.clone(),
                            },
                        };
                        histories.push((history.keys.squeeze(0)?, history.values.squeeze(0)?));
                    }
                    CacheMode::Paged => {
                        appended.keys.push(new.keys.squeeze(0)?);
                        appended.values.push(new.values.squeeze(0)?);
                    }
                }
            }
        }

        let context = batch.assemble(&merged)?;
        let output = self.dense.forward(&context, policy)?;
        let present = match cache.map(|view| view.mode()) {
            None => None,
            Some(CacheMode::Contiguous) => Some(LayerPresent::contiguous(&histories)?),
            Some(CacheMode::Paged) => Some(LayerPresent::Paged(appended)),
        };
        if let Some(view) = cache {
            log::trace!(
                "layer {} attention: {} requests, window {:?}, sink {}",
                self.layer,
                batch.batch_size(),
                view.max_attention_window(),
                view.sink_token_length()
            );
        }
        Ok((output, present))
    }

    /// `[len, qkv_width]` to queries `[1, heads, len, hd]` and keys/values
    /// `[1, kv_heads, len, hd]`.
    fn split_heads(&self, rows: &Tensor) -> Result<(Tensor, RequestKv)> {
        let HeadLayout {
            num_heads,
            num_kv_heads,
            head_dim,
        } = self.heads;
        let len = rows.dim(0)?;
        let part = |offset: usize, count: usize| -> Result<Tensor> {
            Ok(rows
                .narrow(1, offset * head_dim, count * head_dim)?
                .reshape((len, count, head_dim))?
                .transpose(0, 1)?
                .contiguous()?
                .unsqueeze(0)?)
        };
        let q = part(0, num_heads)?;
        let keys = part(num_heads, num_kv_heads)?;
        let values = part(num_heads + num_kv_heads, num_kv_heads)?;
        Ok((q, RequestKv { keys, values }))
    }
}

/// Appends new `[1, kv, len, hd]` tokens behind a `[kv, past, hd]` history.
fn concat_past(past: &Tensor, new: &Tensor) -> Result<Tensor> {
    let past = past.to_dtype(new.dtype())?.unsqueeze(0)?;
    Ok(Tensor::cat(&[&past, new], 2)?)
}

pub(crate) fn optional(
    weights: &dyn WeightSource,
    present: bool,
    name: &str,
    len: usize,
) -> Result<Option<Tensor>> {
    present.then(|| weights.get(name, &[len])).transpose()
}
