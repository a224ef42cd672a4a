//! Activation catalogue for the feed-forward stack and the output head.
//!
//! Activations are element-wise except for SwiGLU, which consumes a fused
//! `(.., 2 * width)` projection and returns `(.., width)`. Inputs are promoted
//! to the compute dtype requested by [`PrecisionPolicy`] and the result is cast
//! back to storage.
//!
//! # Built-in formulas
//!
//! * **GELU** uses the erf form `0.5 * x * (1 + erf(x / sqrt(2)))`.
//! * **SiLU** computes `x * sigmoid(x)`.
//! * **SwiGLU** splits the last axis into `(value, gate)` halves and returns
//!   `value * silu(gate)`.

use candle_core::{bail, Result, Tensor, D};

use crate::dtypes::PrecisionPolicy;

/// Identifies which non-linearity a layer applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    Identity,
    Gelu,
    Silu,
    Relu,
    /// Gated SiLU over a fused projection twice the activation width.
    SwiGlu,
}

impl ActivationKind {
    /// Parses the `hidden_act` names found in checkpoint configs.
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "identity" | "linear" => Ok(Self::Identity),
            "gelu" | "gelu_new" | "gelu_pytorch_tanh" => Ok(Self::Gelu),
            "silu" | "swish" => Ok(Self::Silu),
            "relu" => Ok(Self::Relu),
            "swiglu" => Ok(Self::SwiGlu),
            other => bail!("unsupported activation '{other}'"),
        }
    }

    /// Whether the preceding projection must produce `2 * width` features.
    pub fn is_gated(&self) -> bool {
        matches!(self, Self::SwiGlu)
    }

    pub fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let compute = policy.cast_for_matmul(input)?;
        let activated = match self {
            Self::Identity => compute,
            Self::Gelu => compute.gelu_erf()?,
            Self::Silu => compute.silu()?,
            Self::Relu => compute.relu()?,
            Self::SwiGlu => {
                let width = compute.dim(D::Minus1)?;
                if width % 2 != 0 {
                    bail!("swiglu expects an even fused width, got {width}");
                }
                let half = width / 2;
                let value = compute.narrow(D::Minus1, 0, half)?;
                let gate = compute.narrow(D::Minus1, half, half)?;
                value.mul(&gate.silu()?)?
            }
        };
        policy.cast_to_storage(&activated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use std::f64::consts::SQRT_2;

    fn policy() -> PrecisionPolicy {
        PrecisionPolicy::from_parameter_dtype(DType::F32)
    }

    #[test]
    fn gelu_matches_reference_formula() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::from_slice(&[-2.5f32, -0.5, 0.0, 1.0, 3.0], (5,), &device)?;
        let output = ActivationKind::Gelu.forward(&input, &policy())?;

        let scaled = input.affine(1.0 / SQRT_2, 0.0)?.erf()?;
        let inner = (Tensor::ones_like(&scaled)? + scaled)?;
        let reference = input.affine(0.5, 0.0)?.mul(&inner)?;

        let diff = output.sub(&reference)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 5e-6);
        Ok(())
    }

    #[test]
    fn swiglu_gates_value_half_with_silu_of_second_half() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::from_slice(&[1.0f32, 2.0, 0.0, 1.5, 2.0, -1.0, 3.0, 0.5], (2, 4), &device)?;
        let output = ActivationKind::SwiGlu.forward(&input, &policy())?;
        assert_eq!(output.dims(), &[2, 2]);

        let silu = |x: f32| x / (1.0 + (-x).exp());
        let expected = [1.0 * silu(0.0), 2.0 * silu(1.5), 2.0 * silu(3.0), -1.0 * silu(0.5)];
        let values = output.flatten_all()?.to_vec1::<f32>()?;
        for (got, want) in values.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-6, "{got} vs {want}");
        }
        Ok(())
    }

    #[test]
    fn checkpoint_activation_names_parse() -> Result<()> {
        assert_eq!(ActivationKind::parse("swiglu")?, ActivationKind::SwiGlu);
        assert_eq!(ActivationKind::parse("GELU")?, ActivationKind::Gelu);
        assert!(ActivationKind::SwiGlu.is_gated());
        assert!(!ActivationKind::Gelu.is_gated());
        assert!(ActivationKind::parse("mish").is_err());
        Ok(())
    }

    #[test]
    fn odd_swiglu_width_is_rejected() -> Result<()> {
        let input = Tensor::zeros((2, 3), DType::F32, &Device::Cpu)?;
        assert!(ActivationKind::SwiGlu.forward(&input, &policy()).is_err());
        Ok(())
    }
}
