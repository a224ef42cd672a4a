//! Key/value cache descriptor and paged storage.
//!
//! The serving runtime hands every forward call a [`KvCacheParams`] holding
//! per-layer lists (raw past tensors or block pointers, window sizes) plus
//! fields shared by every layer (past lengths, sink length, beam
//! indirection). [`KvCacheParams::normalize`] turns that into a
//! [`KvCacheArena`] with exactly one slot per layer. Layers read their past
//! through a [`LayerCacheView`] and hand back a [`LayerPresent`].

pub mod api;
pub mod indirection;
pub mod paged;
pub mod params;
pub mod present;

pub use api::{BlockId, CacheStats, KvBlockStore};
pub use indirection::CacheIndirection;
pub use paged::{BlockPoolConfig, KvBlockPool};
pub use params::{BlockTable, CacheMode, KvCacheArena, KvCacheParams, LayerCacheEntry, LayerCacheView};
pub use present::{LayerPresent, PagedAppend};
