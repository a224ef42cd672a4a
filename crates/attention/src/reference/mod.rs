//! Portable, exact implementation of grouped-query attention.
//!
//! This path favours clarity over absolute performance and serves as the
//! baseline every decoder layer runs on.

pub mod exact;

pub use exact::{repeat_kv, ExactAttention};
