//! ChatGLM decoder-only inference graph.
//!
//! One codepath serves four model versions. [`config::GlmVersion`] selects,
//! once at build time, the attention mask, the residual wiring and how
//! positions are encoded (learned position/block tables, 2D rotary or 1D
//! rotary). Layers read their past keys and values through the cache arena
//! of the `attention` crate, which accepts either contiguous past tensors or
//! paged block pointers.

pub mod causal_lm;
pub mod config;
pub mod error;
pub mod head;
pub mod layer;
pub mod model;
pub mod position;
pub mod self_attention;
pub mod weights;

pub use causal_lm::{CausalLmOutput, ChatGlmForCausalLM, PreparedInputs, RequestState};
pub use config::{
    ChatGlmConfig, GlmVersion, PositionScheme, ResidualStrategy, ResolvedConfig, RuntimeOptions,
    VersionStrategy,
};
pub use error::{ChatGlmError, Result};
pub use head::ChatGlmLmHead;
pub use layer::DecoderLayer;
pub use model::{ChatGlmModel, ModelInputs, ModelOutput};
pub use position::{BatchLayout, InputLayout, PositionInput};
pub use weights::{NamedWeights, SyntheticWeights, WeightSource};
