//! Dense projections, plain and row-parallel.
//!
//! [`Linear`] maps `(.., in_dim)` to `(.., out_dim)` for packed `(tokens, in)`
//! or padded `(batch, seq, in)` inputs. When the output axis is sharded across
//! ranks (column parallelism) it is used as-is with the rank's slice of the
//! weight. [`RowLinear`] shards the input axis instead: each rank multiplies its
//! slice, the partial products are summed through the communicator, and only
//! then is the (unsharded) bias added.
//!
//! Weights and activations are cast to [`PrecisionPolicy::compute`] for the
//! matmul and the result is returned in the storage dtype.

use std::sync::Arc;

use candle_core::{bail, Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy, parallel::Communicator};

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension.
    pub output_dim: usize,
    /// Whether a learnable bias vector should be applied.
    pub bias: bool,
}

impl LinearConfig {
    pub fn new(input_dim: usize, output_dim: usize, bias: bool) -> Self {
        Self {
            input_dim,
            output_dim,
            bias,
        }
    }
}

/// Dense affine projection with optional bias.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Constructs a linear layer from pre-loaded parameters. `weight` is laid out
    /// `(output_dim, input_dim)`.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        checks::expect_shape("linear.weight", &weight, &[config.output_dim, config.input_dim])?;
        checks::expect_dtype_in("linear.weight", &weight, checks::PARAMETER_DTYPES)?;
        match (config.bias, bias.as_ref()) {
            (true, Some(tensor)) => {
                checks::expect_shape("linear.bias", tensor, &[config.output_dim])?;
                checks::expect_same_dtype("linear.bias", tensor, "linear.weight", &weight)?;
            }
            (false, Some(_)) => bail!("bias provided but config disables bias"),
            (true, None) => bail!("config expects bias but none supplied"),
            (false, None) => {}
        }
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Applies the projection without the bias term.
    fn matmul(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_last_dim("linear.input", hidden, self.config.input_dim)?;
        let dims = hidden.dims().to_vec();
        let rows: usize = dims[..dims.len() - 1].iter().product();

        let input = policy.cast_for_matmul(hidden)?;
        let weight_t = policy.cast_for_matmul(&self.weight)?.t()?;
        let flat = input.reshape((rows, self.config.input_dim))?;
        let projected = flat.matmul(&weight_t)?;

        let mut out_dims = dims;
        if let Some(last) = out_dims.last_mut() {
            *last = self.config.output_dim;
        }
        projected.reshape(out_dims)
    }

    fn add_bias(&self, projected: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        match &self.bias {
            Some(bias) => projected.broadcast_add(&policy.cast_for_matmul(bias)?),
            None => Ok(projected.clone()),
        }
    }

    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let projected = self.matmul(hidden, policy)?;
        let output = self.add_bias(&projected, policy)?;
        policy.cast_to_storage(&output)
    }
}

/// Projection whose input axis is sharded across tensor-parallel ranks.
#[derive(Debug, Clone)]
pub struct RowLinear {
    inner: Linear,
    comm: Arc<dyn Communicator>,
}

impl RowLinear {
    /// `weight` is this rank's `(output_dim, input_dim / tp_size)` slice; `bias`
    /// is the full, unsharded vector.
    pub fn new(
        config: LinearConfig,
        weight: Tensor,
        bias: Option<Tensor>,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        Ok(Self {
            inner: Linear::new(config, weight, bias)?,
            comm,
        })
    }

    pub fn config(&self) -> &LinearConfig {
        self.inner.config()
    }

    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let partial = self.inner.matmul(hidden, policy)?;
        let reduced = if self.comm.mapping().is_parallel() {
            self.comm.all_reduce_sum(&partial)?
        } else {
            partial
        };
        let output = self.inner.add_bias(&reduced, policy)?;
        policy.cast_to_storage(&output)
    }
}
