//! Causal mask over a cached past.

use candle_core::{Device, Result, Tensor};

/// Builds a `[1, 1, q_len, past_len + q_len]` mask where query `i` sees every
/// cached key plus the new keys up to and including itself.
pub fn build_causal_mask(device: &Device, q_len: usize, past_len: usize) -> Result<Tensor> {
    let k_len = past_len + q_len;
    let data: Vec<f32> = (0..q_len)
        .flat_map(|q| {
            (0..k_len).map(move |k| {
                if k > past_len + q {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
        })
        .collect();
    Tensor::from_vec(data, (1, 1, q_len, k_len), device)
}
