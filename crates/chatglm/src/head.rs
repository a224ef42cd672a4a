use std::sync::Arc;

use candle_core::{DType, Tensor};
use layers::{ActivationKind, Linear, LinearConfig, NormKind, NormalizationLayer, PrecisionPolicy};

use crate::config::ResolvedConfig;
use crate::error::{config_from, Result};
use crate::layer::load_norm;
use crate::self_attention::optional;
use crate::weights::{names, WeightSource};

/// `fc -> gelu -> layernorm -> proj` over the padded vocabulary.
///
/// The head is replicated on every rank; each rank produces full logits.
#[derive(Debug)]
pub struct ChatGlmLmHead {
    fc: Linear,
    norm: Arc<dyn NormalizationLayer>,
    proj: Linear,
    padded_vocab_size: usize,
}

impl ChatGlmLmHead {
    /// `tied_embedding` is the vocabulary table to reuse as the output
    /// projection; it is zero-padded up to the padded vocabulary.
    pub fn new(
        config: &ResolvedConfig,
        weights: &dyn WeightSource,
        tied_embedding: Option<&Tensor>,
    ) -> Result<Self> {
        let hidden = config.hidden_size;
        let vocab = config.padded_vocab_size;
        let prefix = names::LM_HEAD;

        let fc = Linear::new(
            LinearConfig::new(hidden, hidden, true),
            weights.get(&format!("{prefix}.fc.weight"), &[hidden, hidden])?,
            optional(weights, true, &format!("{prefix}.fc.bias"), hidden)?,
        )
        .map_err(config_from)?;
        let norm = load_norm(
            &format!("{prefix}.layernorm"),
            NormKind::LayerNorm,
            hidden,
            config.norm_epsilon,
            weights,
        )?;
        let proj_weight = match tied_embedding {
            Some(table) => {
                let rows = table.dim(0)?;
                table.pad_with_zeros(0, 0, vocab.saturating_sub(rows))?
            }
            None => weights.get(&format!("{prefix}.proj.weight"), &[vocab, hidden])?,
        };
        let proj = Linear::new(
            LinearConfig::new(hidden, vocab, true),
            proj_weight,
            optional(weights, true, &format!("{prefix}.proj.bias"), vocab)?,
        )
        .map_err(config_from)?;

        Ok(Self {
            fc,
            norm,
            proj,
            padded_vocab_size: vocab,
        })
    }

    pub fn padded_vocab_size(&self) -> usize {
        self.padded_vocab_size
    }

    /// Logits in `f32`, shaped like `hidden` with the last axis replaced by
    /// the padded vocabulary.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let projected = self.fc.forward(hidden, policy)?;
        let activated = ActivationKind::Gelu.forward(&projected, policy)?;
        let normed = self.norm.forward(&activated, policy)?;
        let logits = self.proj.forward(&normed, policy)?;
        Ok(logits.to_dtype(DType::F32)?)
    }
}
