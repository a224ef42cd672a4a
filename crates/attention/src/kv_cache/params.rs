//! Raw cache lists from the runtime and their per-layer arena.

use candle_core::{IndexOp, Tensor};

use crate::core::errors::{config_err, shape_err};
use crate::core::{to_backend_err, AttentionError};
use crate::kv_cache::api::{BlockId, KvBlockStore};
use crate::kv_cache::indirection::CacheIndirection;

/// Physical cache representation used by the execution environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// One `[batch, 2, kv_heads, max_len, head_dim]` tensor per layer.
    #[default]
    Contiguous,
    /// Block pointers into a [`KvBlockStore`].
    Paged,
}

/// Block pointers of every request in the batch, in logical order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockTable {
    pub rows: Vec<Vec<BlockId>>,
}

impl BlockTable {
    pub fn new(rows: Vec<Vec<BlockId>>) -> Self {
        Self { rows }
    }

    pub fn row(&self, request: usize) -> Result<&[BlockId], AttentionError> {
        self.rows
            .get(request)
            .map(Vec::as_slice)
            .ok_or_else(|| shape_err(format!("no block pointers for request {request}")))
    }
}

/// Cache inputs of one forward call, as received from the serving runtime.
///
/// Per-layer lists are either empty or hold one entry per layer.
#[derive(Default)]
pub struct KvCacheParams<'a> {
    pub past_key_value: Vec<Option<Tensor>>,
    pub kv_cache_block_pointers: Vec<Option<BlockTable>>,
    pub host_kv_cache_block_pointers: Vec<Option<BlockTable>>,
    pub host_max_attention_window_sizes: Vec<Option<usize>>,
    /// Past length of every request; shared by all layers.
    pub host_past_key_value_lengths: Option<Vec<usize>>,
    pub host_sink_token_length: Option<usize>,
    pub cache_indirection: Option<CacheIndirection>,
    pub block_store: Option<&'a dyn KvBlockStore>,
}

/// Cache slot of a single layer after normalization.
#[derive(Debug, Clone, Default)]
pub enum LayerCacheEntry {
    /// Nothing cached; valid only while every past length is zero.
    #[default]
    Empty,
    Contiguous(Tensor),
    Paged { device: BlockTable, host: BlockTable },
}

fn filled<T: Default>(name: &str, list: Vec<T>, num_layers: usize) -> Result<Vec<T>, AttentionError> {
    match list.len() {
        0 => Ok((0..num_layers).map(|_| T::default()).collect()),
        n if n == num_layers => Ok(list),
        n => Err(config_err(format!(
            "{name} holds {n} entries for {num_layers} layers"
        ))),
    }
}

impl<'a> KvCacheParams<'a> {
    /// Validates the lists and builds an arena with exactly `num_layers` slots.
    pub fn normalize(self, num_layers: usize, mode: CacheMode) -> Result<KvCacheArena<'a>, AttentionError> {
        let past = filled("past_key_value", self.past_key_value, num_layers)?;
        let device = filled("kv_cache_block_pointers", self.kv_cache_block_pointers, num_layers)?;
        let host = filled(
            "host_kv_cache_block_pointers",
            self.host_kv_cache_block_pointers,
            num_layers,
        )?;
        let windows = filled(
            "host_max_attention_window_sizes",
            self.host_max_attention_window_sizes,
            num_layers,
        )?;
        if let Some(layer) = windows.iter().position(|w| *w == Some(0)) {
            return Err(config_err(format!(
                "layer {layer} max attention window must be at least 1"
            )));
        }

        let mut entries = Vec::with_capacity(num_layers);
        for (layer, ((past, device), host)) in past.into_iter().zip(device).zip(host).enumerate() {
            let entry = match (mode, past, device, host) {
                (_, None, None, None) => LayerCacheEntry::Empty,
                (CacheMode::Contiguous, Some(tensor), None, None) => {
                    let dims = tensor.dims();
                    if dims.len() != 5 || dims[1] != 2 {
                        return Err(config_err(format!(
                            "layer {layer} past_key_value must be [batch, 2, kv_heads, max_len, head_dim], got {dims:?}"
                        )));
                    }
                    LayerCacheEntry::Contiguous(tensor)
                }
                (CacheMode::Paged, None, Some(device), Some(host)) => {
                    if device.rows.len() != host.rows.len() {
                        return Err(config_err(format!(
                            "layer {layer} device and host block pointers disagree on batch size"
                        )));
                    }
                    if self.block_store.is_none() {
                        return Err(config_err(format!(
                            "layer {layer} carries block pointers but no block store was supplied"
                        )));
                    }
                    LayerCacheEntry::Paged { device, host }
                }
                (CacheMode::Paged, None, Some(_), None) | (CacheMode::Paged, None, None, Some(_)) => {
                    return Err(config_err(format!(
                        "layer {layer} needs both device and host block pointers"
                    )));
                }
                (mode, _, _, _) => {
                    return Err(config_err(format!(
                        "layer {layer} cache representation does not match {mode:?} execution"
                    )));
                }
            };
            entries.push(entry);
        }

        let any_cached = entries.iter().any(|e| !matches!(e, LayerCacheEntry::Empty));
        if any_cached && self.host_past_key_value_lengths.is_none() {
            return Err(config_err(
                "cached layers require host_past_key_value_lengths",
            ));
        }

        log::debug!(
            "kv-cache normalized: layers={num_layers} mode={mode:?} cached={any_cached} sink={:?}",
            self.host_sink_token_length
        );

        Ok(KvCacheArena {
            mode,
            entries,
            windows,
            past_lengths: self.host_past_key_value_lengths,
            sink_token_length: self.host_sink_token_length.unwrap_or(0),
            indirection: self.cache_indirection,
            store: self.block_store,
        })
    }
}

/// One cache slot per layer plus the fields every layer shares.
pub struct KvCacheArena<'a> {
    mode: CacheMode,
    entries: Vec<LayerCacheEntry>,
    windows: Vec<Option<usize>>,
    past_lengths: Option<Vec<usize>>,
    sink_token_length: usize,
    indirection: Option<CacheIndirection>,
    store: Option<&'a dyn KvBlockStore>,
}

impl<'a> KvCacheArena<'a> {
    /// Arena for a call that carries no cache at all.
    pub fn empty(num_layers: usize, mode: CacheMode) -> Self {
        Self {
            mode,
            entries: vec![LayerCacheEntry::Empty; num_layers],
            windows: vec![None; num_layers],
            past_lengths: None,
            sink_token_length: 0,
            indirection: None,
            store: None,
        }
    }

    pub fn num_layers(&self) -> usize {
        self.entries.len()
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    pub fn layer(&self, index: usize) -> Result<LayerCacheView<'_, 'a>, AttentionError> {
        if index >= self.entries.len() {
            return Err(config_err(format!(
                "layer {index} out of range for {} cache slots",
                self.entries.len()
            )));
        }
        Ok(LayerCacheView { arena: self, index })
    }
}

/// Read access to one layer's slot.
#[derive(Clone, Copy)]
pub struct LayerCacheView<'s, 'a> {
    arena: &'s KvCacheArena<'a>,
    index: usize,
}

impl LayerCacheView<'_, '_> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn mode(&self) -> CacheMode {
        self.arena.mode
    }

    pub fn entry(&self) -> &LayerCacheEntry {
        &self.arena.entries[self.index]
    }

    pub fn max_attention_window(&self) -> Option<usize> {
        self.arena.windows[self.index]
    }

    pub fn sink_token_length(&self) -> usize {
        self.arena.sink_token_length
    }

    pub fn past_length(&self, request: usize) -> Result<usize, AttentionError> {
        match &self.arena.past_lengths {
            None => Ok(0),
            Some(lengths) => lengths.get(request).copied().ok_or_else(|| {
                shape_err(format!(
                    "host_past_key_value_lengths has {} entries, request {request} is out of range",
                    lengths.len()
                ))
            }),
        }
    }

    /// Cached `[kv_heads, past_len, head_dim]` keys and values of `request`,
    /// with beam indirection applied. `None` for a fresh sequence.
    pub fn resolve_past(&self, request: usize) -> Result<Option<(Tensor, Tensor)>, AttentionError> {
        let past_len = self.past_length(request)?;
        if past_len == 0 {
            return Ok(None);
        }
        let fetch = |src: usize| self.fetch(src, past_len);
        let past = match &self.arena.indirection {
            Some(indirection) => indirection.remap(request, past_len, fetch)?,
            None => fetch(request)?,
        };
        Ok(Some(past))
    }

    /// Cached past of `request` as held in its own slot, ignoring beam
    /// indirection. This is the history a new present extends.
    pub fn stored_past(&self, request: usize) -> Result<Option<(Tensor, Tensor)>, AttentionError> {
        let past_len = self.past_length(request)?;
        if past_len == 0 {
            return Ok(None);
        }
        self.fetch(request, past_len).map(Some)
    }

    fn fetch(&self, request: usize, len: usize) -> Result<(Tensor, Tensor), AttentionError> {
        match self.entry() {
            LayerCacheEntry::Empty => Err(shape_err(format!(
                "layer {} has neither a past tensor nor block pointers but request {request} has past length {len}",
                self.index
            ))),
            LayerCacheEntry::Contiguous(past) => {
                let (batch, _, _, max_len, _) = past.dims5().map_err(to_backend_err)?;
                if request >= batch || len > max_len {
                    return Err(shape_err(format!(
                        "layer {} past tensor [{batch}, 2, _, {max_len}, _] cannot serve request {request} with past length {len}",
                        self.index
                    )));
                }
                let slot = past
                    .i(request)
                    .and_then(|slot| slot.narrow(2, 0, len))
                    .map_err(to_backend_err)?;
                let keys = slot.i(0).map_err(to_backend_err)?;
                let values = slot.i(1).map_err(to_backend_err)?;
                Ok((keys, values))
            }
            LayerCacheEntry::Paged { device, .. } => {
                let store = self
                    .arena
                    .store
                    .ok_or_else(|| config_err("paged cache without a block store"))?;
                store.gather(device.row(request)?, len)
            }
        }
    }
}
