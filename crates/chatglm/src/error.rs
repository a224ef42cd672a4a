use attention::AttentionError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChatGlmError>;

#[derive(Error, Debug)]
pub enum ChatGlmError {
    /// Raised while building the model: bad config values, missing weights,
    /// malformed cache lists.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Raised during a forward pass when inputs violate the shape contract.
    #[error("shape error: {0}")]
    Shape(String),

    #[error("attention error: {0}")]
    Attention(AttentionError),

    #[error("tensor backend error: {0}")]
    Backend(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serde_json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl From<AttentionError> for ChatGlmError {
    fn from(err: AttentionError) -> Self {
        match err {
            AttentionError::Configuration { context } => Self::Config(context),
            AttentionError::InvalidShape { context } => Self::Shape(context),
            other => Self::Attention(other),
        }
    }
}

pub(crate) fn config_err<S: Into<String>>(msg: S) -> ChatGlmError {
    ChatGlmError::Config(msg.into())
}

pub(crate) fn shape_err<S: Into<String>>(msg: S) -> ChatGlmError {
    ChatGlmError::Shape(msg.into())
}

/// Candle contract violations raised while building the model are
/// configuration errors.
pub(crate) fn config_from(err: candle_core::Error) -> ChatGlmError {
    ChatGlmError::Config(err.to_string())
}
