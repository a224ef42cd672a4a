//! Reference attention kernel.
//!
//! The exact path prioritises numerical fidelity and mirrors the semantics
//! described by the [`Attention`](crate::core::Attention) trait.

use std::sync::OnceLock;

use candle_core::{DType, Tensor};
use candle_nn::ops::softmax_last_dim;

use crate::core::errors::shape_err;
use crate::core::{to_backend_err, Attention, AttentionError, Config};
use crate::masks::MASK_DTYPE;

/// Numerically stable, portable grouped-query attention.
#[derive(Debug, Default)]
pub struct ExactAttention {
    first_call: OnceLock<()>,
}

impl ExactAttention {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Expands `[b, n_kv, s, d]` to `[b, n_kv * n_rep, s, d]` so that query head
/// `h` lines up with key/value head `h / n_rep`.
pub fn repeat_kv(x: &Tensor, n_rep: usize) -> candle_core::Result<Tensor> {
    if n_rep == 1 {
        return Ok(x.clone());
    }
    let (b, n_kv, s, d) = x.dims4()?;
    x.unsqueeze(2)?
        .broadcast_as((b, n_kv, n_rep, s, d))?
        .contiguous()?
        .reshape((b, n_kv * n_rep, s, d))
}

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::reference init dtype={:?} softmax_scale={:?}",
                q.dtype(),
                config.softmax_scale
            );
        }

        let device = q.device();
        if !device.same_device(k.device()) || !device.same_device(v.device()) {
            return Err(shape_err("q, k, v must reside on the same device"));
        }

        let dtype = q.dtype();
        if dtype != k.dtype() || dtype != v.dtype() {
            return Err(shape_err("q, k, v must share the same dtype"));
        }
        if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }

        let (batch, heads, q_len, head_dim) = q
            .dims4()
            .map_err(|_| shape_err("q must have shape [batch, heads, seq_len, head_dim]"))?;
        let (kb, kv_heads, k_len, kd) = k
            .dims4()
            .map_err(|_| shape_err("k must have shape [batch, kv_heads, seq_len, head_dim]"))?;
        let (vb, vh, vk, vd) = v
            .dims4()
            .map_err(|_| shape_err("v must have shape [batch, kv_heads, seq_len, head_dim]"))?;

        if kb != batch || kd != head_dim || kv_heads == 0 || heads % kv_heads != 0 {
            return Err(shape_err(format!(
                "k shape mismatch: expected [{batch}, n_kv | {heads}, ?, {head_dim}] got [{kb}, {kv_heads}, {k_len}, {kd}]"
            )));
        }
        if vb != batch || vh != kv_heads || vk != k_len || vd != head_dim {
            return Err(shape_err(format!(
                "v shape mismatch: expected [{batch}, {kv_heads}, {k_len}, {head_dim}] got [{vb}, {vh}, {vk}, {vd}]"
            )));
        }

        let n_rep = heads / kv_heads;
        let q_work = q.to_dtype(DType::F32).map_err(to_backend_err)?;
        let k_work = repeat_kv(&k.to_dtype(DType::F32).map_err(to_backend_err)?, n_rep)
            .map_err(to_backend_err)?;
        let v_work = repeat_kv(&v.to_dtype(DType::F32).map_err(to_backend_err)?, n_rep)
            .map_err(to_backend_err)?;

        let merged = batch * heads;
        let q_view = q_work
            .contiguous()
            .and_then(|t| t.reshape((merged, q_len, head_dim)))
            .map_err(to_backend_err)?;
        let k_view = k_work
            .contiguous()
            .and_then(|t| t.reshape((merged, k_len, head_dim)))
            .map_err(to_backend_err)?;
        let k_t = k_view
            .t()
            .and_then(|t| t.contiguous())
            .map_err(to_backend_err)?;

        let scale = config
            .softmax_scale
            .unwrap_or_else(|| 1.0 / (head_dim as f32).sqrt());
        let mut scores = q_view
            .matmul(&k_t)
            .and_then(|s| s.affine(scale as f64, 0.0))
            .and_then(|s| s.reshape((batch, heads, q_len, k_len)))
            .map_err(to_backend_err)?;

        if let Some(mask) = mask {
            if !device.same_device(mask.device()) {
                return Err(shape_err("mask must reside on the same device as q"));
            }
            if mask.dtype() != MASK_DTYPE {
                return Err(AttentionError::UnsupportedDType {
                    requested: format!("mask expects dtype {MASK_DTYPE:?}, got {:?}", mask.dtype()),
                });
            }
            let (mb, mh, mq, mk) = mask
                .dims4()
                .map_err(|_| shape_err("mask must have shape [batch|1, heads|1, q_len, k_len]"))?;
            if (mb != 1 && mb != batch) || (mh != 1 && mh != heads) || mq != q_len || mk != k_len {
                return Err(shape_err(format!(
                    "mask shape mismatch: expected [1|{batch}, 1|{heads}, {q_len}, {k_len}] got [{mb}, {mh}, {mq}, {mk}]"
                )));
            }
            scores = scores.broadcast_add(mask).map_err(to_backend_err)?;
        }

        let probs = scores
            .reshape((merged, q_len, k_len))
            .and_then(|s| softmax_last_dim(&s))
            .map_err(to_backend_err)?;
        let v_view = v_work
            .contiguous()
            .and_then(|t| t.reshape((merged, k_len, head_dim)))
            .map_err(to_backend_err)?;
        probs
            .matmul(&v_view)
            .and_then(|o| o.reshape((batch, heads, q_len, head_dim)))
            .and_then(|o| o.to_dtype(dtype))
            .map_err(to_backend_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::{build_bidirectional_mask, build_causal_mask};
    use candle_core::{Device, Result as CandleResult};

    fn ramp(dims: (usize, usize, usize, usize), step: f32, device: &Device) -> CandleResult<Tensor> {
        let count = dims.0 * dims.1 * dims.2 * dims.3;
        let data: Vec<f32> = (0..count).map(|i| ((i % 13) as f32 - 6.0) * step).collect();
        Tensor::from_vec(data, dims, device)
    }

    fn build_inputs(device: &Device) -> CandleResult<(Tensor, Tensor, Tensor)> {
        let data: Vec<f32> = (0..64).map(|i| (i as f32) * 0.01).collect();
        let q = Tensor::from_vec(data.clone(), (1, 2, 4, 8), device)?;
        let k = Tensor::from_vec(data.clone(), (1, 2, 4, 8), device)?;
        let v = Tensor::from_vec(data, (1, 2, 4, 8), device)?;
        Ok((q, k, v))
    }

    /// Scalar attention. `mask` is `[1, 1, q_len, k_len]`; key heads are shared
    /// by `heads / kv_heads` consecutive query heads.
    fn naive_attention(
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
    ) -> CandleResult<Tensor> {
        let (batch, heads, q_len, head_dim) = q.dims4()?;
        let (_, kv_heads, k_len, _) = k.dims4()?;
        let n_rep = heads / kv_heads;
        let mut output = vec![0f32; batch * heads * q_len * head_dim];

        let q_vec = q.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let k_vec = k.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let v_vec = v.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let mask_vec = match mask {
            Some(m) => Some(m.flatten_all()?.to_vec1::<f32>()?),
            None => None,
        };
        let scale = 1.0 / (head_dim as f32).sqrt();

        for b in 0..batch {
            for h in 0..heads {
                let kh = h / n_rep;
                for qi in 0..q_len {
                    let mut row = vec![0f32; k_len];
                    let mut max_val = f32::NEG_INFINITY;
                    for (ki, slot) in row.iter_mut().enumerate() {
                        let mut dot = 0f32;
                        for d in 0..head_dim {
                            let qx = ((b * heads + h) * q_len + qi) * head_dim + d;
                            let kx = ((b * kv_heads + kh) * k_len + ki) * head_dim + d;
                            dot += q_vec[qx] * k_vec[kx];
                        }
                        dot *= scale;
                        if let Some(mask_vec) = &mask_vec {
                            dot += mask_vec[qi * k_len + ki];
                        }
                        *slot = dot;
                        if dot > max_val {
                            max_val = dot;
                        }
                    }
                    let mut denom = 0f32;
                    for val in row.iter_mut() {
                        *val = if *val == f32::NEG_INFINITY {
                            0.0
                        } else {
                            (*val - max_val).exp()
                        };
                        denom += *val;
                    }
                    for d in 0..head_dim {
                        let mut acc = 0f32;
                        for (ki, weight) in row.iter().enumerate() {
                            let vx = ((b * kv_heads + kh) * k_len + ki) * head_dim + d;
                            acc += weight / denom * v_vec[vx];
                        }
                        output[((b * heads + h) * q_len + qi) * head_dim + d] = acc;
                    }
                }
            }
        }

        Tensor::from_vec(output, (batch, heads, q_len, head_dim), q.device())
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> CandleResult<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()
    }

    #[test]
    fn exact_attention_matches_naive() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let mask = build_causal_mask(&device, 4, 0)?;
        let output = ExactAttention::new()
            .attend(&q, &k, &v, Some(&mask), &Config::default())
            .unwrap();
        let expected = naive_attention(&q, &k, &v, Some(&mask))?;
        assert!(max_diff(&output, &expected)? < 1e-4);
        Ok(())
    }

    #[test]
    fn grouped_query_matches_naive_with_past() -> CandleResult<()> {
        let device = Device::Cpu;
        let q = ramp((2, 4, 3, 8), 0.05, &device)?;
        let k = ramp((2, 2, 5, 8), 0.07, &device)?;
        let v = ramp((2, 2, 5, 8), 0.11, &device)?;
        let mask = build_bidirectional_mask(&device, 3, 2)?;
        let output = ExactAttention::new()
            .attend(&q, &k, &v, Some(&mask), &Config::default())
            .unwrap();
        assert_eq!(output.dims(), &[2, 4, 3, 8]);
        let expected = naive_attention(&q, &k, &v, Some(&mask))?;
        assert!(max_diff(&output, &expected)? < 1e-4);
        Ok(())
    }

    #[test]
    fn grouped_query_equals_replicated_heads() -> CandleResult<()> {
        let device = Device::Cpu;
        let q = ramp((1, 6, 4, 4), 0.1, &device)?;
        let k = ramp((1, 2, 4, 4), 0.03, &device)?;
        let v = ramp((1, 2, 4, 4), 0.2, &device)?;
        let mask = build_causal_mask(&device, 4, 0)?;
        let attention = ExactAttention::new();
        let grouped = attention
            .attend(&q, &k, &v, Some(&mask), &Config::default())
            .unwrap();

        // Replicate each kv head three times by hand.
        let k0 = k.narrow(1, 0, 1)?;
        let k1 = k.narrow(1, 1, 1)?;
        let v0 = v.narrow(1, 0, 1)?;
        let v1 = v.narrow(1, 1, 1)?;
        let k_full = Tensor::cat(&[&k0, &k0, &k0, &k1, &k1, &k1], 1)?;
        let v_full = Tensor::cat(&[&v0, &v0, &v0, &v1, &v1, &v1], 1)?;
        let replicated = attention
            .attend(&q, &k_full, &v_full, Some(&mask), &Config::default())
            .unwrap();
        assert!(max_diff(&grouped, &replicated)? < 1e-6);
        Ok(())
    }

    #[test]
    fn custom_softmax_scale_is_honoured() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let attention = ExactAttention::new();
        let default = attention.attend(&q, &k, &v, None, &Config::default()).unwrap();
        let explicit = attention
            .attend(
                &q,
                &k,
                &v,
                None,
                &Config {
                    softmax_scale: Some(1.0 / 8f32.sqrt()),
                },
            )
            .unwrap();
        assert!(max_diff(&default, &explicit)? < 1e-6);
        Ok(())
    }

    #[test]
    fn mismatched_shapes_error() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let k = Tensor::zeros((1, 2, 5, 8), DType::F32, &device).unwrap();
        let v = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let err = ExactAttention::new()
            .attend(&q, &k, &v, None, &Config::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));

        let k = Tensor::zeros((1, 3, 4, 8), DType::F32, &device).unwrap();
        let v = Tensor::zeros((1, 3, 4, 8), DType::F32, &device).unwrap();
        let err = ExactAttention::new()
            .attend(&q, &k, &v, None, &Config::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
    }

    #[test]
    fn mask_shape_validation() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let k = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let v = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let mask = Tensor::zeros((1, 3, 4, 4), DType::F32, &device).unwrap();
        let err = ExactAttention::new()
            .attend(&q, &k, &v, Some(&mask), &Config::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
    }

    #[test]
    fn dtype_matrix() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let mask = build_causal_mask(&device, 4, 0)?;
        let reference = ExactAttention::new()
            .attend(&q, &k, &v, Some(&mask), &Config::default())
            .unwrap();
        for dtype in [DType::F32, DType::BF16, DType::F16] {
            let out = ExactAttention::new()
                .attend(
                    &q.to_dtype(dtype)?,
                    &k.to_dtype(dtype)?,
                    &v.to_dtype(dtype)?,
                    Some(&mask),
                    &Config::default(),
                )
                .unwrap();
            assert_eq!(out.dtype(), dtype);
            let max = max_diff(&out, &reference)?;
            assert!(max < 5e-2, "dtype {dtype:?} diverged by {max}");
        }
        Ok(())
    }

    #[test]
    fn numerical_stability() {
        let device = Device::Cpu;
        let q = Tensor::full(10_000.0f32, (1, 1, 4, 4), &device).unwrap();
        let k = Tensor::full(-10_000.0f32, (1, 1, 4, 4), &device).unwrap();
        let v = Tensor::ones((1, 1, 4, 4), DType::F32, &device).unwrap();
        let out = ExactAttention::new()
            .attend(&q, &k, &v, None, &Config::default())
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(out.iter().all(|value| value.is_finite()));
    }
}
