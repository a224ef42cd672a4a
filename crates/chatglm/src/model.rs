//! Decoder stack: embeddings, the layer loop and the final norm.

use std::sync::Arc;

use attention::kv_cache::{KvCacheArena, KvCacheParams, LayerPresent};
use candle_core::Tensor;
use embedding::{EmbeddingSharding, PositionBlockEmbedding, TokenEmbedding, TokenEmbeddingConfig};
use layers::{Communicator, NormKind, NormalizationLayer, PrecisionPolicy};

use crate::config::{PositionScheme, ResolvedConfig, RuntimeOptions};
use crate::error::{config_err, config_from, Result};
use crate::layer::{load_norm, DecoderLayer};
use crate::position::{BatchLayout, PositionInput, RequestPositions};
use crate::weights::{names, WeightSource};

/// Inputs of one forward call.
pub struct ModelInputs<'a> {
    /// `[tokens]` when padding is removed, `[batch, seq]` otherwise.
    pub input_ids: Tensor,
    pub position_ids: PositionInput,
    /// Real tokens per request; see [`BatchLayout::new`].
    pub input_lengths: Option<Vec<usize>>,
    pub use_cache: bool,
    pub kv_cache: KvCacheParams<'a>,
    /// Token index (within its request) whose logits are kept; `None` keeps
    /// every token. Only the causal LM reads this.
    pub last_token_ids: Option<Vec<usize>>,
}

impl<'a> ModelInputs<'a> {
    pub fn new(input_ids: Tensor, position_ids: PositionInput) -> Self {
        Self {
            input_ids,
            position_ids,
            input_lengths: None,
            use_cache: false,
            kv_cache: KvCacheParams::default(),
            last_token_ids: None,
        }
    }

    pub fn with_lengths(mut self, input_lengths: Vec<usize>) -> Self {
        self.input_lengths = Some(input_lengths);
        self
    }

    pub fn with_cache(mut self, kv_cache: KvCacheParams<'a>) -> Self {
        self.use_cache = true;
        self.kv_cache = kv_cache;
        self
    }
}

#[derive(Debug)]
pub struct ModelOutput {
    /// Final-normalized hidden states in the input layout.
    pub hidden_states: Tensor,
    /// One entry per layer when the cache was in use.
    pub presents: Option<Vec<LayerPresent>>,
    pub batch: BatchLayout,
}

#[derive(Debug)]
pub struct ChatGlmModel {
    config: ResolvedConfig,
    vocab_embedding: TokenEmbedding,
    position_embedding: Option<PositionBlockEmbedding>,
    layers: Vec<DecoderLayer>,
    ln_f: Arc<dyn NormalizationLayer>,
    policy: PrecisionPolicy,
}

impl ChatGlmModel {
    pub fn new(
        config: &ResolvedConfig,
        weights: &dyn WeightSource,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        let hidden = config.hidden_size;
        let embedding_config = TokenEmbeddingConfig::new(config.vocab_size, hidden)
            .with_sharding(config.embedding_sharding);
        let (rows, cols) = embedding_config
            .local_shape(config.mapping.tp_size)
            .map_err(config_from)?;
        let table = weights.get(names::VOCAB_EMBEDDING, &[rows, cols])?;
        let vocab_embedding = match config.embedding_sharding {
            EmbeddingSharding::None => TokenEmbedding::new(embedding_config, table),
            _ => TokenEmbedding::sharded(embedding_config, table, Arc::clone(&comm)),
        }
        .map_err(config_from)?;

        let position_embedding = match config.strategy.positions {
            PositionScheme::LearnedBlock => {
                let table_rows = config.max_position_embeddings + 1;
                Some(
                    PositionBlockEmbedding::new(
                        config.max_position_embeddings,
                        hidden,
                        weights.get(names::POSITION_EMBEDDING, &[table_rows, hidden])?,
                        weights.get(names::BLOCK_EMBEDDING, &[table_rows, hidden])?,
                    )
                    .map_err(config_from)?,
                )
            }
            PositionScheme::Rotary1d | PositionScheme::Rotary2d => None,
        };

        let layers = (0..config.num_layers)
            .map(|index| DecoderLayer::new(index, config, weights, Arc::clone(&comm)))
            .collect::<Result<Vec<_>>>()?;
        let ln_f = load_norm(
            names::FINAL_NORM,
            config.norm_kind,
            hidden,
            config.norm_epsilon,
            weights,
        )?;

        log::debug!(
            "decoder stack: {} layers, norm={}, positions={:?}",
            layers.len(),
            config.norm_kind.name(),
            config.strategy.positions
        );
        Ok(Self {
            config: config.clone(),
            vocab_embedding,
            position_embedding,
            layers,
            ln_f,
            policy: PrecisionPolicy::from_parameter_dtype(config.dtype),
        })
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn layers(&self) -> &[DecoderLayer] {
        &self.layers
    }

    pub fn vocab_embedding(&self) -> &TokenEmbedding {
        &self.vocab_embedding
    }

    pub fn policy(&self) -> &PrecisionPolicy {
        &self.policy
    }

    pub fn norm_kind(&self) -> NormKind {
        self.config.norm_kind
    }

    /// Token embeddings, plus learned position and block embeddings when the
    /// version uses them.
    pub fn embed(&self, input_ids: &Tensor, position_ids: &PositionInput) -> Result<Tensor> {
        self.check_positions(position_ids)?;
        let tokens = self.vocab_embedding.forward(input_ids)?;
        match (&self.position_embedding, position_ids) {
            (Some(table), PositionInput::TwoDimensional { position, block }) => {
                Ok(tokens.add(&table.forward(position, block)?)?)
            }
            _ => Ok(tokens),
        }
    }

    fn check_positions(&self, position_ids: &PositionInput) -> Result<()> {
        let wants_2d = self.config.position_encoding_2d();
        if wants_2d != position_ids.is_2d() {
            return Err(config_err(format!(
                "{} expects {} position ids",
                self.config.version.as_str(),
                if wants_2d { "2d (position, block)" } else { "1d" }
            )));
        }
        Ok(())
    }

    pub fn forward(&self, inputs: ModelInputs<'_>, options: &RuntimeOptions) -> Result<ModelOutput> {
        let ModelInputs {
            input_ids,
            position_ids,
            input_lengths,
            use_cache,
            kv_cache,
            ..
        } = inputs;
        let batch = BatchLayout::new(&input_ids, options.layout(), input_lengths.as_deref())?;
        let mut hidden = self.embed(&input_ids, &position_ids)?;
        let positions = RequestPositions::new(&position_ids, &input_ids, &batch)?;

        let num_layers = self.layers.len();
        let arena = if use_cache {
            kv_cache.normalize(num_layers, options.cache_mode())?
        } else {
            KvCacheArena::empty(num_layers, options.cache_mode())
        };

        let mut presents = Vec::with_capacity(if use_cache { num_layers } else { 0 });
        for layer in &self.layers {
            let view = if use_cache {
                Some(arena.layer(layer.index())?)
            } else {
                None
            };
            let (next, present) =
                layer.forward(&hidden, &batch, &positions, view.as_ref(), &self.policy)?;
            hidden = next;
            presents.extend(present);
        }

        let hidden_states = self.ln_f.forward(&hidden, &self.policy)?;
        Ok(ModelOutput {
            hidden_states,
            presents: use_cache.then_some(presents),
            batch,
        })
    }
}
