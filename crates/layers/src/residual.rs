//! Residual connections around the attention and feed-forward branches.
//!
//! A decoder layer merges each branch output with a residual path. Which
//! tensor feeds the residual path depends on the wiring:
//!
//! * pre-norm (default): the branch input before normalisation,
//! * post-layernorm residual: the normalised tensor,
//! * scaled (GLM-130B/ChatGLM-6B): the normalised tensor multiplied by
//!   `residual_scale` before the addition.
//!
//! Additions are carried out in [`PrecisionPolicy::compute`] and cast back to
//! storage.

use candle_core::{Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration describing how residual connections are wired.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResidualConfig {
    /// Take the residual from the normalised tensor instead of the raw input.
    pub post_layernorm: bool,
    /// Multiplier applied to the residual path before the addition.
    pub residual_scale: Option<f32>,
}

impl ResidualConfig {
    /// Plain residual add; `post_layernorm` selects the residual source.
    pub fn standard(post_layernorm: bool) -> Self {
        Self {
            post_layernorm,
            residual_scale: None,
        }
    }

    /// `normed * alpha + branch`, the deep-norm style wiring.
    pub fn scaled(alpha: f32) -> Self {
        Self {
            post_layernorm: true,
            residual_scale: Some(alpha),
        }
    }
}

/// Residual add helper with optional scaling.
#[derive(Debug, Clone, Copy)]
pub struct Residual {
    config: ResidualConfig,
}

impl Residual {
    pub fn new(config: ResidualConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ResidualConfig {
        &self.config
    }

    /// Picks the tensor that feeds the residual path.
    pub fn source<'a>(&self, input: &'a Tensor, normed: &'a Tensor) -> &'a Tensor {
        if self.config.post_layernorm {
            normed
        } else {
            input
        }
    }

    /// Returns `residual * scale + branch`.
    pub fn add(&self, branch: &Tensor, residual: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_shape("residual.branch", branch, residual.dims())?;
        checks::expect_same_dtype("residual.branch", branch, "residual.input", residual)?;

        let branch = policy.cast_for_matmul(branch)?;
        let residual = policy.cast_for_matmul(residual)?;
        let residual = match self.config.residual_scale {
            Some(scale) => residual.affine(f64::from(scale), 0.0)?,
            None => residual,
        };
        policy.cast_to_storage(&residual.add(&branch)?)
    }
}
