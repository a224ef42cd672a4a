//! Prefix-bidirectional mask used by ChatGLM-6B.

use candle_core::{Device, Result, Tensor};

use super::causal::build_causal_mask;

/// Builds a `[1, 1, q_len, past_len + q_len]` mask.
///
/// In a fresh context (`past_len == 0`) the first `q_len - 1` tokens attend to
/// each other in both directions and the final token attends to everything.
/// Once a past exists the new tokens are appended causally.
pub fn build_bidirectional_mask(device: &Device, q_len: usize, past_len: usize) -> Result<Tensor> {
    let k_len = past_len + q_len;
    if past_len > 0 || q_len <= 1 {
        return build_causal_mask(device, q_len, past_len);
    }

    let prefix = q_len - 1;
    let mut data = vec![0f32; q_len * k_len];
    for q in 0..prefix {
        data[q * k_len + prefix] = f32::NEG_INFINITY;
    }
    Tensor::from_vec(data, (1, 1, q_len, k_len), device)
}
