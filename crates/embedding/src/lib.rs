//! Embedding crate
//!
//! Token lookup tables plus the positional encodings used by the GLM family:
//! learned position/block tables and 1D/2D rotary embeddings.

pub mod positional;
pub mod token;

pub use positional::*;
pub use token::*;
