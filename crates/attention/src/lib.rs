//! Grouped-query attention primitives and key/value cache plumbing.
//!
//! Query tensors use the layout `[batch, n_heads, seq_len, head_dim]`; keys and
//! values may carry fewer heads as long as `n_heads` is a multiple of their
//! head count. Inputs are bf16, f16, or f32. Reductions are performed
//! internally in `f32`, and the output tensor matches the query dtype and
//! shape.
//!
//! Masks are additive `f32` tensors. [`masks::build_attention_mask`] combines a
//! causal or prefix-bidirectional mask with an optional sliding window that
//! never evicts the leading sink tokens.
//!
//! The [`kv_cache`] module turns the per-layer cache lists handed over by a
//! serving runtime into one slot per layer, resolves past keys and values from
//! contiguous tensors or paged block pointers, and applies beam indirection.

pub mod core;
pub mod interop;
pub mod kv_cache;
pub mod masks;
pub mod reference;

pub use core::{Attention, AttentionError, AttentionMaskType, Config, HeadLayout};
pub use reference::ExactAttention;
