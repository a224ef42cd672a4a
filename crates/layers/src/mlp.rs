//! Position-wise feed-forward block.
//!
//! `fc` expands the hidden state to the (rank-local) intermediate width, the
//! activation is applied, and the row-parallel `proj` contracts back to the
//! model hidden size. Gated activations expect `fc` to emit
//! `2 * intermediate` features laid out as `(value, gate)`.
//!
//! Packed `(tokens, hidden)` and padded `(batch, seq, hidden)` inputs are both
//! accepted and the layout is preserved.

use std::sync::Arc;

use candle_core::{Result, Tensor};

use crate::{
    activations::ActivationKind,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, RowLinear},
    parallel::{Communicator, Mapping},
};

/// Configuration shared by transformer feed-forward networks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedForwardConfig {
    /// Model hidden size.
    pub hidden_size: usize,
    /// Full (unsharded) width of the activation space.
    pub intermediate_size: usize,
    /// Activation applied between projections.
    pub activation: ActivationKind,
    /// Whether `fc` and `proj` carry bias vectors.
    pub bias: bool,
}

impl FeedForwardConfig {
    pub fn new(
        hidden_size: usize,
        intermediate_size: usize,
        activation: ActivationKind,
        bias: bool,
    ) -> Self {
        Self {
            hidden_size,
            intermediate_size,
            activation,
            bias,
        }
    }

    /// Intermediate width held by one rank.
    pub fn local_intermediate(&self, mapping: &Mapping) -> Result<usize> {
        mapping.shard("intermediate_size", self.intermediate_size)
    }

    /// Output width of this rank's `fc` projection.
    pub fn fc_output_dim(&self, mapping: &Mapping) -> Result<usize> {
        let local = self.local_intermediate(mapping)?;
        Ok(if self.activation.is_gated() { 2 * local } else { local })
    }
}

/// Two-projection MLP with a column-parallel `fc` and a row-parallel `proj`.
#[derive(Debug, Clone)]
pub struct FeedForward {
    config: FeedForwardConfig,
    fc: Linear,
    proj: RowLinear,
}

impl FeedForward {
    /// `fc_weight` is `(fc_output_dim, hidden)` and `proj_weight` is
    /// `(hidden, local_intermediate)` for the communicator's rank.
    pub fn new(
        config: FeedForwardConfig,
        fc_weight: Tensor,
        fc_bias: Option<Tensor>,
        proj_weight: Tensor,
        proj_bias: Option<Tensor>,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        let mapping = comm.mapping();
        let local = config.local_intermediate(&mapping)?;
        let fc = Linear::new(
            LinearConfig::new(config.hidden_size, config.fc_output_dim(&mapping)?, config.bias),
            fc_weight,
            fc_bias,
        )?;
        let proj = RowLinear::new(
            LinearConfig::new(local, config.hidden_size, config.bias),
            proj_weight,
            proj_bias,
            comm,
        )?;
        log::debug!(
            "mlp init: hidden={} intermediate={} local={} activation={:?}",
            config.hidden_size,
            config.intermediate_size,
            local,
            config.activation
        );
        Ok(Self { config, fc, proj })
    }

    pub fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let expanded = self.fc.forward(hidden, policy)?;
        let activated = self.config.activation.forward(&expanded, policy)?;
        self.proj.forward(&activated, policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::SingleProcess;
    use candle_core::{DType, Device};

    #[test]
    fn swiglu_mlp_matches_manual_composition() -> Result<()> {
        let device = Device::Cpu;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let config = FeedForwardConfig::new(6, 4, ActivationKind::SwiGlu, false);
        let fc = Tensor::randn(0f32, 0.2, (8, 6), &device)?;
        let proj = Tensor::randn(0f32, 0.2, (6, 4), &device)?;
        let mlp = FeedForward::new(
            config,
            fc.clone(),
            None,
            proj.clone(),
            None,
            Arc::new(SingleProcess),
        )?;

        let input = Tensor::randn(0f32, 1.0, (5, 6), &device)?;
        let output = mlp.forward(&input, &policy)?;
        assert_eq!(output.dims(), &[5, 6]);

        let fused = input.matmul(&fc.t()?)?;
        let value = fused.narrow(1, 0, 4)?;
        let gate = fused.narrow(1, 4, 4)?;
        let expected = value.mul(&candle_nn::ops::silu(&gate)?)?.matmul(&proj.t()?)?;
        let diff = output.sub(&expected)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-5, "max diff {diff}");
        Ok(())
    }

    #[test]
    fn gelu_mlp_keeps_padded_layout_and_bias() -> Result<()> {
        let device = Device::Cpu;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let config = FeedForwardConfig::new(4, 8, ActivationKind::Gelu, true);
        let mlp = FeedForward::new(
            config,
            Tensor::zeros((8, 4), DType::F32, &device)?,
            Some(Tensor::zeros(8, DType::F32, &device)?),
            Tensor::zeros((4, 8), DType::F32, &device)?,
            Some(Tensor::full(0.25f32, 4, &device)?),
            Arc::new(SingleProcess),
        )?;
        let input = Tensor::randn(0f32, 1.0, (2, 3, 4), &device)?;
        let output = mlp.forward(&input, &policy)?;
        assert_eq!(output.dims(), &[2, 3, 4]);
        let values = output.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| (*v - 0.25).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn gated_fc_weight_must_be_double_width() -> Result<()> {
        let device = Device::Cpu;
        let config = FeedForwardConfig::new(6, 4, ActivationKind::SwiGlu, false);
        let result = FeedForward::new(
            config,
            Tensor::zeros((4, 6), DType::F32, &device)?,
            None,
            Tensor::zeros((6, 4), DType::F32, &device)?,
            None,
            Arc::new(SingleProcess),
        );
        assert!(result.is_err());
        Ok(())
    }
}
