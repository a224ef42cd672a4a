//! Normalisation layers bundled with unified shape and dtype handling.
//!
//! Inputs follow either the packed `(tokens, hidden)` or the padded
//! `(batch, seq, hidden)` convention. Normalisation happens along the last axis
//! while preserving the original layout. Statistics (mean, variance) are
//! promoted to [`PrecisionPolicy::reduction`] before casting the output back.

use std::sync::Arc;

use candle_core::{bail, Result, Tensor, D};

use crate::{checks, dtypes::PrecisionPolicy};

/// Available normalisation strategies for decoder blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormKind {
    /// Standard LayerNorm with learnable scale and shift.
    LayerNorm,
    /// RMSNorm variant used by the GLM-2 generation onwards.
    RmsNorm,
}

impl NormKind {
    /// Picks the kind from the checkpoint's `rmsnorm` flag.
    pub fn from_rmsnorm_flag(rmsnorm: bool) -> Self {
        if rmsnorm {
            NormKind::RmsNorm
        } else {
            NormKind::LayerNorm
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            NormKind::LayerNorm => "layernorm",
            NormKind::RmsNorm => "rmsnorm",
        }
    }
}

/// Configuration shared by all normalisation layers.
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the hidden dimension being normalised.
    pub hidden_size: usize,
    /// Numeric stabiliser applied to variance or RMS computations.
    pub epsilon: f64,
    /// Desired variant of the normalisation routine.
    pub kind: NormKind,
}

impl NormConfig {
    pub fn new(hidden_size: usize, kind: NormKind, epsilon: f64) -> Self {
        Self {
            hidden_size,
            epsilon,
            kind,
        }
    }
}

/// Shared interface for normalisation layers used inside decoder blocks.
pub trait NormalizationLayer: Send + Sync + std::fmt::Debug {
    fn config(&self) -> &NormConfig;

    /// Applies the normalisation to a hidden state tensor.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

#[derive(Debug, Clone)]
struct NormImpl {
    config: NormConfig,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl NormImpl {
    fn new(config: NormConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        if matches!(config.kind, NormKind::RmsNorm) && bias.is_some() {
            bail!("RMSNorm does not support bias parameters");
        }
        checks::expect_shape("norm.weight", &weight, &[config.hidden_size])?;
        checks::expect_dtype_in("norm.weight", &weight, checks::PARAMETER_DTYPES)?;
        if let Some(bias) = &bias {
            checks::expect_shape("norm.bias", bias, &[config.hidden_size])?;
            checks::expect_same_dtype("norm.bias", bias, "norm.weight", &weight)?;
        }
        log::debug!(
            "norm init: kind={} hidden={} eps={}",
            config.kind.name(),
            config.hidden_size,
            config.epsilon
        );
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_last_dim("norm.input", hidden, self.config.hidden_size)?;

        let hidden_size = self.config.hidden_size as f64;
        let mut compute = policy.cast_for_reduction(hidden)?;

        if matches!(self.config.kind, NormKind::LayerNorm) {
            let mean = (compute.sum_keepdim(D::Minus1)? / hidden_size)?;
            compute = compute.broadcast_sub(&mean)?;
        }

        let variance = (compute.sqr()?.sum_keepdim(D::Minus1)? / hidden_size)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let mut normalized = compute.broadcast_div(&denom)?;
        if normalized.dtype() != policy.compute() {
            normalized = normalized.to_dtype(policy.compute())?;
        }

        normalized = normalized.broadcast_mul(&self.weight.to_dtype(normalized.dtype())?)?;
        if let Some(bias) = &self.bias {
            normalized = normalized.broadcast_add(&bias.to_dtype(normalized.dtype())?)?;
        }

        policy.cast_to_storage(&normalized)
    }
}

/// Standard LayerNorm with learnable scale and bias.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    inner: NormImpl,
}

impl LayerNorm {
    pub fn new(weight: Tensor, bias: Tensor, mut config: NormConfig) -> Result<Self> {
        config.kind = NormKind::LayerNorm;
        Ok(Self {
            inner: NormImpl::new(config, weight, Some(bias))?,
        })
    }
}

impl NormalizationLayer for LayerNorm {
    fn config(&self) -> &NormConfig {
        &self.inner.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        self.inner.forward(hidden, policy)
    }
}

/// Root mean square norm with a learnable scale.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    inner: NormImpl,
}

impl RmsNorm {
    pub fn new(weight: Tensor, mut config: NormConfig) -> Result<Self> {
        config.kind = NormKind::RmsNorm;
        Ok(Self {
            inner: NormImpl::new(config, weight, None)?,
        })
    }
}

impl NormalizationLayer for RmsNorm {
    fn config(&self) -> &NormConfig {
        &self.inner.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        self.inner.forward(hidden, policy)
    }
}

/// Builds the norm selected by `config.kind`. LayerNorm requires `bias`.
pub fn build_norm(
    config: NormConfig,
    weight: Tensor,
    bias: Option<Tensor>,
) -> Result<Arc<dyn NormalizationLayer>> {
    match (config.kind, bias) {
        (NormKind::LayerNorm, Some(bias)) => Ok(Arc::new(LayerNorm::new(weight, bias, config)?)),
        (NormKind::LayerNorm, None) => bail!("LayerNorm requires a bias parameter"),
        (NormKind::RmsNorm, None) => Ok(Arc::new(RmsNorm::new(weight, config)?)),
        (NormKind::RmsNorm, Some(_)) => bail!("RMSNorm does not support bias parameters"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::ops;

    fn build_input(device: &Device, dtype: DType, dims: &[usize]) -> Result<Tensor> {
        let total: usize = dims.iter().product();
        let data = (0..total)
            .map(|i| (i as f32 * 0.25_f32) - 1.5_f32)
            .collect::<Vec<_>>();
        Tensor::from_vec(data, dims, device)?.to_dtype(dtype)
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()
    }

    #[test]
    fn layer_norm_matches_reference_across_dtypes() -> Result<()> {
        let device = Device::Cpu;
        let config = NormConfig::new(4, NormKind::LayerNorm, 1e-5);
        let weight_f32 = Tensor::from_vec(vec![1.0f32, 0.5, -0.25, 1.5], (4,), &device)?;
        let bias_f32 = Tensor::from_vec(vec![0.1f32, -0.2, 0.05, 0.0], (4,), &device)?;

        for &dtype in &[DType::F32, DType::F16, DType::BF16] {
            let input = build_input(&device, dtype, &[2, 3, 4])?;
            let weight = weight_f32.to_dtype(dtype)?;
            let bias = bias_f32.to_dtype(dtype)?;
            let layer = LayerNorm::new(weight.clone(), bias.clone(), config.clone())?;
            let policy = PrecisionPolicy::from_parameter_dtype(dtype);
            let output = layer.forward(&input, &policy)?;

            assert_eq!(output.dims(), input.dims());
            assert_eq!(output.dtype(), dtype);

            let reference = ops::layer_norm(&input, &weight, &bias, config.epsilon as f32)?;
            let tol = match dtype {
                DType::F16 => 1e-2,
                DType::BF16 => 5e-2,
                _ => 5e-4,
            };
            let diff = max_diff(&output, &reference)?;
            assert!(diff < tol, "max diff {diff} for dtype {dtype:?}");
        }
        Ok(())
    }

    #[test]
    fn rms_norm_matches_reference_on_packed_tokens() -> Result<()> {
        let device = Device::Cpu;
        let hidden = 6;
        let config = NormConfig::new(hidden, NormKind::RmsNorm, 1e-6);
        let weight = Tensor::from_vec(
            (0..hidden).map(|i| 1.0_f32 + i as f32 * 0.01).collect::<Vec<_>>(),
            (hidden,),
            &device,
        )?;
        let input = build_input(&device, DType::F32, &[7, hidden])?;
        let norm = RmsNorm::new(weight.clone(), config.clone())?;
        let output = norm.forward(&input, &PrecisionPolicy::from_parameter_dtype(DType::F32))?;

        let reference = ops::rms_norm(&input, &weight, config.epsilon as f32)?;
        assert!(max_diff(&output, &reference)? < 5e-4);
        Ok(())
    }

    #[test]
    fn build_norm_enforces_bias_rules() -> Result<()> {
        let device = Device::Cpu;
        let weight = Tensor::ones(4, DType::F32, &device)?;
        let bias = Tensor::zeros(4, DType::F32, &device)?;
        let rms = NormConfig::new(4, NormKind::RmsNorm, 1e-5);
        let ln = NormConfig::new(4, NormKind::LayerNorm, 1e-5);

        assert!(build_norm(rms.clone(), weight.clone(), Some(bias.clone())).is_err());
        assert!(build_norm(ln.clone(), weight.clone(), None).is_err());
        assert_eq!(
            build_norm(rms, weight.clone(), None)?.config().kind,
            NormKind::RmsNorm
        );
        assert_eq!(
            build_norm(ln, weight, Some(bias))?.config().kind,
            NormKind::LayerNorm
        );
        Ok(())
    }

    #[test]
    fn wrong_hidden_size_is_rejected() -> Result<()> {
        let device = Device::Cpu;
        let norm = RmsNorm::new(
            Tensor::ones(4, DType::F32, &device)?,
            NormConfig::new(4, NormKind::RmsNorm, 1e-5),
        )?;
        let input = Tensor::ones((2, 5), DType::F32, &device)?;
        assert!(norm
            .forward(&input, &PrecisionPolicy::from_parameter_dtype(DType::F32))
            .is_err());
        Ok(())
    }
}
