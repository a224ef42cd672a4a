//! Token-wise building blocks for the ChatGLM decoder.
//!
//! Every layer here operates independently per token: inputs are either packed
//! `(tokens, hidden)` or padded `(batch, seq, hidden)` and the transform only
//! touches the last axis. Projections that are sharded across tensor-parallel
//! ranks hand their partial results to a [`parallel::Communicator`].

pub mod activations;
pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;
pub mod parallel;
pub mod residual;

pub use activations::ActivationKind;
pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig, RowLinear};
pub use mlp::{FeedForward, FeedForwardConfig};
pub use norm::{LayerNorm, NormConfig, NormKind, NormalizationLayer, RmsNorm};
pub use parallel::{pad_vocab_size, Communicator, Mapping, SingleProcess};
pub use residual::{Residual, ResidualConfig};
