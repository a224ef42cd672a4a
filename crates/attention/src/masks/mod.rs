//! Mask utilities shared by attention implementations.
//!
//! All masks produced here are additive tensors with dtype `f32`. Values are
//! either `0.0` (keep) or `f32::NEG_INFINITY` (discard), so masks compose by
//! addition.

pub mod bidirectional;
pub mod causal;
pub mod window;

use candle_core::{DType, Device, Result, Tensor};

use crate::core::AttentionMaskType;

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

pub use bidirectional::build_bidirectional_mask;
pub use causal::build_causal_mask;
pub use window::build_window_mask;

/// Full mask for one request: the mask type over `past_len + q_len` keys,
/// narrowed by the attention window when one is set.
pub fn build_attention_mask(
    device: &Device,
    mask_type: AttentionMaskType,
    q_len: usize,
    past_len: usize,
    window: Option<usize>,
    sink: usize,
) -> Result<Tensor> {
    let base = match mask_type {
        AttentionMaskType::Causal => build_causal_mask(device, q_len, past_len)?,
        AttentionMaskType::Bidirectional => build_bidirectional_mask(device, q_len, past_len)?,
    };
    match window {
        Some(window) if window < past_len + q_len => {
            base.add(&build_window_mask(device, q_len, past_len, window, sink)?)
        }
        _ => Ok(base),
    }
}
