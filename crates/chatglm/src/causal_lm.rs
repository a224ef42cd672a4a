//! Decoder stack plus LM head, and the input contract seen by a runtime.

use std::sync::Arc;

use attention::kv_cache::LayerPresent;
use candle_core::{Device, Tensor};
use layers::Communicator;

use crate::config::{ChatGlmConfig, ResolvedConfig, RuntimeOptions};
use crate::error::{config_err, shape_err, Result};
use crate::head::ChatGlmLmHead;
use crate::model::{ChatGlmModel, ModelInputs};
use crate::position::{default_positions, ids_tensor, BatchLayout, InputLayout, PositionInput};
use crate::weights::WeightSource;

/// Tokens of one request for the next forward call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestState {
    pub tokens: Vec<u32>,
    /// Tokens already in the cache.
    pub past_length: usize,
    /// Length of the original prompt, used by the 2D position convention.
    pub context_length: usize,
}

impl RequestState {
    /// First call for a prompt.
    pub fn context(tokens: Vec<u32>) -> Self {
        let context_length = tokens.len();
        Self {
            tokens,
            past_length: 0,
            context_length,
        }
    }

    /// One generation step after `past_length` cached tokens.
    pub fn decode(token: u32, past_length: usize, context_length: usize) -> Self {
        Self {
            tokens: vec![token],
            past_length,
            context_length,
        }
    }
}

/// Tensors built by [`ChatGlmForCausalLM::prepare_inputs`].
#[derive(Debug, Clone)]
pub struct PreparedInputs {
    pub input_ids: Tensor,
    pub position_ids: PositionInput,
    pub input_lengths: Vec<usize>,
    pub past_lengths: Vec<usize>,
}

impl PreparedInputs {
    /// Uncached model inputs.
    pub fn into_model_inputs<'a>(self) -> ModelInputs<'a> {
        ModelInputs::new(self.input_ids, self.position_ids).with_lengths(self.input_lengths)
    }
}

#[derive(Debug)]
pub struct CausalLmOutput {
    /// `f32` logits over the padded vocabulary: `[tokens, vocab]` or
    /// `[batch, seq, vocab]`, or `[batch, vocab]` when last tokens are gathered.
    pub logits: Tensor,
    pub presents: Option<Vec<LayerPresent>>,
}

#[derive(Debug)]
pub struct ChatGlmForCausalLM {
    config: ResolvedConfig,
    transformer: ChatGlmModel,
    lm_head: ChatGlmLmHead,
}

impl ChatGlmForCausalLM {
    pub fn new(
        config: &ChatGlmConfig,
        weights: &dyn WeightSource,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        let resolved = config.normalize()?;
        if comm.mapping() != resolved.mapping {
            return Err(config_err(format!(
                "communicator mapping {:?} does not match configured {:?}",
                comm.mapping(),
                resolved.mapping
            )));
        }
        let transformer = ChatGlmModel::new(&resolved, weights, comm)?;
        let tied = resolved
            .share_embedding_table
            .then(|| transformer.vocab_embedding().weight().clone());
        let lm_head = ChatGlmLmHead::new(&resolved, weights, tied.as_ref())?;

        log::info!(
            "built {} model: layers={} hidden={} heads={}/{} vocab={} (padded {}) tp={}/{}",
            resolved.version.as_str(),
            resolved.num_layers,
            resolved.hidden_size,
            resolved.num_heads,
            resolved.num_kv_heads,
            resolved.output_vocab_size,
            resolved.padded_vocab_size,
            resolved.mapping.tp_rank,
            resolved.mapping.tp_size
        );
        Ok(Self {
            config: resolved,
            transformer,
            lm_head,
        })
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn transformer(&self) -> &ChatGlmModel {
        &self.transformer
    }

    pub fn lm_head(&self) -> &ChatGlmLmHead {
        &self.lm_head
    }

    /// Whether callers must supply `(position, block)` pairs.
    pub fn position_encoding_2d(&self) -> bool {
        self.config.position_encoding_2d()
    }

    /// Builds token and default position tensors for `requests` in the layout
    /// selected by `options`.
    pub fn prepare_inputs(
        &self,
        requests: &[RequestState],
        options: &RuntimeOptions,
        device: &Device,
    ) -> Result<PreparedInputs> {
        if requests.is_empty() {
            return Err(shape_err("prepare_inputs needs at least one request"));
        }
        let layout = options.layout();
        let two_d = self.position_encoding_2d();
        let mut positions = Vec::with_capacity(requests.len());
        let mut blocks = Vec::with_capacity(requests.len());
        for request in requests {
            let (p, b) = default_positions(
                two_d,
                request.past_length,
                request.tokens.len(),
                request.context_length,
            );
            positions.push(p);
            blocks.extend(b);
        }
        let tokens: Vec<Vec<u32>> = requests.iter().map(|r| r.tokens.clone()).collect();
        let input_ids = ids_tensor(&tokens, layout, device)?;
        let position_ids = if two_d {
            let position = ids_tensor(&positions, layout, device)?;
            let block = ids_tensor(&blocks, layout, device)?;
            let stacked_axis = match layout {
                InputLayout::Packed => 0,
                InputLayout::Padded => 1,
            };
            PositionInput::split_2d(&Tensor::stack(&[position, block], stacked_axis)?, layout)?
        } else {
            PositionInput::OneDimensional(ids_tensor(&positions, layout, device)?)
        };

        Ok(PreparedInputs {
            input_ids,
            position_ids,
            input_lengths: requests.iter().map(|r| r.tokens.len()).collect(),
            past_lengths: requests.iter().map(|r| r.past_length).collect(),
        })
    }

    pub fn forward(&self, inputs: ModelInputs<'_>, options: &RuntimeOptions) -> Result<CausalLmOutput> {
        let last_token_ids = inputs.last_token_ids.clone();
        let output = self.transformer.forward(inputs, options)?;
        let hidden = match last_token_ids {
            Some(ids) => gather_tokens(&output.hidden_states, &output.batch, &ids)?,
            None => output.hidden_states,
        };
        let logits = self.lm_head.forward(&hidden, self.transformer.policy())?;
        Ok(CausalLmOutput {
            logits,
            presents: output.presents,
        })
    }
}

/// Picks token `ids[r]` of every request, giving `[batch, hidden]`.
fn gather_tokens(hidden: &Tensor, batch: &BatchLayout, ids: &[usize]) -> Result<Tensor> {
    if ids.len() != batch.batch_size() {
        return Err(shape_err(format!(
            "last_token_ids has {} entries for {} requests",
            ids.len(),
            batch.batch_size()
        )));
    }
    let rows = ids
        .iter()
        .zip(&batch.spans)
        .enumerate()
        .map(|(request, (&id, span))| {
            if id >= span.len {
                return Err(shape_err(format!(
                    "last token {id} is outside request {request} of length {}",
                    span.len
                )));
            }
            Ok(batch.request(hidden, request)?.narrow(0, id, 1)?)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Tensor::cat(&rows, 0)?)
}
