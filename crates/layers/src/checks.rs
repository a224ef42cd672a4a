//! Lightweight validation helpers shared across layer components.
//!
//! Every helper takes a `context` label naming the tensor under test so that
//! failures point at the offending parameter (`"attention.qkv.weight"`) rather
//! than at a bare shape.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(context: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected shape {expected:?}, got {actual:?}"
        )))
    }
}

pub fn expect_rank(context: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    if tensor.rank() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected rank {rank}, got shape {:?}",
            tensor.dims()
        )))
    }
}

/// Validates a token-major layout (`(tokens, hidden)` or `(batch, seq, hidden)`)
/// whose trailing axis equals `hidden`.
pub fn expect_last_dim(context: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    match tensor.dims() {
        [.., last] if *last == hidden && (2..=3).contains(&tensor.rank()) => Ok(()),
        dims => Err(Error::Msg(format!(
            "{context}: expected (tokens, {hidden}) or (batch, seq, {hidden}), got {dims:?}"
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(context: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected dtype in {allowed:?}, got {dtype:?}"
        )))
    }
}

pub fn expect_contiguous(context: &str, tensor: &Tensor) -> Result<()> {
    if tensor.is_contiguous() {
        Ok(())
    } else {
        Err(Error::Msg(format!("{context}: tensor must be contiguous")))
    }
}

pub fn expect_same_dtype(
    left_context: &str,
    left: &Tensor,
    right_context: &str,
    right: &Tensor,
) -> Result<()> {
    if left.dtype() == right.dtype() {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{left_context} ({:?}) and {right_context} ({:?}) must share a dtype",
            left.dtype(),
            right.dtype()
        )))
    }
}

/// Floating point dtypes accepted for parameters.
pub const PARAMETER_DTYPES: &[DType] = &[DType::F16, DType::BF16, DType::F32];

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn last_dim_accepts_packed_and_padded_layouts() -> Result<()> {
        let device = Device::Cpu;
        let packed = Tensor::zeros((5, 8), DType::F32, &device)?;
        let padded = Tensor::zeros((2, 3, 8), DType::F32, &device)?;
        expect_last_dim("packed", &packed, 8)?;
        expect_last_dim("padded", &padded, 8)?;

        let wrong = Tensor::zeros((2, 3, 4), DType::F32, &device)?;
        let err = expect_last_dim("hidden", &wrong, 8).unwrap_err();
        assert!(err.to_string().contains("hidden"));
        let flat = Tensor::zeros(8, DType::F32, &device)?;
        assert!(expect_last_dim("flat", &flat, 8).is_err());
        Ok(())
    }

    #[test]
    fn shape_and_dtype_errors_carry_context() -> Result<()> {
        let device = Device::Cpu;
        let tensor = Tensor::zeros((2, 2), DType::F32, &device)?;
        let err = expect_shape("mlp.fc.weight", &tensor, &[2, 3]).unwrap_err();
        assert!(err.to_string().starts_with("mlp.fc.weight"));
        assert!(expect_dtype_in("w", &tensor, &[DType::F16]).is_err());
        expect_dtype_in("w", &tensor, PARAMETER_DTYPES)?;
        Ok(())
    }
}
