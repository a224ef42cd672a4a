//! Sliding attention window with attention sinks.

use candle_core::{Device, Result, Tensor};

/// Builds an additive `[1, 1, q_len, past_len + q_len]` mask that hides keys
/// which fell out of the attention window.
///
/// Query `i` sits at absolute position `t = past_len + i`. Key `j` stays visible
/// when `t - j < window` or when `j < sink`; sink tokens are never evicted.
/// Keys after the query are left to the causal/bidirectional mask.
pub fn build_window_mask(
    device: &Device,
    q_len: usize,
    past_len: usize,
    window: usize,
    sink: usize,
) -> Result<Tensor> {
    let k_len = past_len + q_len;
    let mut data = vec![0f32; q_len * k_len];
    for q in 0..q_len {
        let t = past_len + q;
        for j in 0..k_len.min(t + 1) {
            if t - j >= window && j >= sink {
                data[q * k_len + j] = f32::NEG_INFINITY;
            }
        }
    }
    Tensor::from_vec(data, (1, 1, q_len, k_len), device)
}
