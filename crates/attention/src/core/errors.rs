//! Error types emitted by attention implementations.

/// Attention-specific error category.
#[derive(Debug, Clone, PartialEq)]
pub enum AttentionError {
    /// The supplied tensor shapes do not align with the documented contract.
    InvalidShape { context: String },
    /// The kernel does not support the requested data type.
    UnsupportedDType { requested: String },
    /// Inconsistent inputs detected before any computation ran (cache lists,
    /// execution mode, head grouping).
    Configuration { context: String },
    /// A backend-specific failure propagated to the caller.
    Backend { message: String },
}

impl std::fmt::Display for AttentionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttentionError::InvalidShape { context } => {
                write!(f, "invalid tensor shape: {context}")
            }
            AttentionError::UnsupportedDType { requested } => {
                write!(f, "unsupported dtype {requested}")
            }
            AttentionError::Configuration { context } => {
                write!(f, "invalid attention configuration: {context}")
            }
            AttentionError::Backend { message } => f.write_str(message),
        }
    }
}

impl std::error::Error for AttentionError {}

pub fn to_backend_err(err: candle_core::Error) -> AttentionError {
    AttentionError::Backend {
        message: err.to_string(),
    }
}

pub(crate) fn shape_err(context: impl Into<String>) -> AttentionError {
    AttentionError::InvalidShape {
        context: context.into(),
    }
}

pub(crate) fn config_err(context: impl Into<String>) -> AttentionError {
    AttentionError::Configuration {
        context: context.into(),
    }
}
