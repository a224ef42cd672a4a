//! Positional encodings: learned `(position, block)` tables and rotary embeddings.

pub mod learned;
pub mod rope;

pub use learned::PositionBlockEmbedding;
pub use rope::{
    apply_rope_at_positions, apply_rope_to_qk, get_sin_cos, Rope, Rope2d, RopeConfig,
    RopeScaling, RotaryStyle,
};
