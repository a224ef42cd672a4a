use std::sync::Arc;

use attention::kv_cache::{LayerCacheView, LayerPresent};
use candle_core::Tensor;
use layers::norm::build_norm;
use layers::{
    Communicator, FeedForward, FeedForwardConfig, NormConfig, NormKind, NormalizationLayer,
    PrecisionPolicy, Residual,
};

use crate::config::ResolvedConfig;
use crate::error::{config_from, Result};
use crate::position::{BatchLayout, RequestPositions};
use crate::self_attention::{optional, AttentionBlock};
use crate::weights::{names, WeightSource};

/// Loads `{prefix}.weight` (and `{prefix}.bias` for LayerNorm).
pub(crate) fn load_norm(
    prefix: &str,
    kind: NormKind,
    hidden: usize,
    epsilon: f64,
    weights: &dyn WeightSource,
) -> Result<Arc<dyn NormalizationLayer>> {
    let weight = weights.get(&format!("{prefix}.weight"), &[hidden])?;
    let bias = optional(
        weights,
        kind == NormKind::LayerNorm,
        &format!("{prefix}.bias"),
        hidden,
    )?;
    build_norm(NormConfig::new(hidden, kind, epsilon), weight, bias).map_err(config_from)
}

/// `input_layernorm -> attention -> residual -> post_layernorm -> mlp -> residual`.
///
/// The residual wiring comes from the version strategy: either the scaled
/// `normed * alpha + branch` form or a plain add whose residual source is the
/// normalized or the raw input.
#[derive(Debug)]
pub struct DecoderLayer {
    index: usize,
    input_layernorm: Arc<dyn NormalizationLayer>,
    attention: AttentionBlock,
    post_layernorm: Arc<dyn NormalizationLayer>,
    mlp: FeedForward,
    residual: Residual,
}

impl DecoderLayer {
    pub fn new(
        index: usize,
        config: &ResolvedConfig,
        weights: &dyn WeightSource,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        let prefix = names::layer(index);
        let hidden = config.hidden_size;
        let norm = |name: &str| {
            load_norm(
                &format!("{prefix}.{name}"),
                config.norm_kind,
                hidden,
                config.norm_epsilon,
                weights,
            )
        };
        let input_layernorm = norm("input_layernorm")?;
        let post_layernorm = norm("post_layernorm")?;

        let attention = AttentionBlock::new(
            index,
            &format!("{prefix}.attention"),
            config,
            weights,
            Arc::clone(&comm),
        )?;

        let mlp_config = FeedForwardConfig::new(
            hidden,
            config.intermediate_size,
            config.activation,
            config.add_bias_linear,
        );
        let mapping = comm.mapping();
        let fc_width = mlp_config.fc_output_dim(&mapping).map_err(config_from)?;
        let local = mlp_config.local_intermediate(&mapping).map_err(config_from)?;
        let bias = config.add_bias_linear;
        let mlp = FeedForward::new(
            mlp_config,
            weights.get(&format!("{prefix}.mlp.fc.weight"), &[fc_width, hidden])?,
            optional(weights, bias, &format!("{prefix}.mlp.fc.bias"), fc_width)?,
            weights.get(&format!("{prefix}.mlp.proj.weight"), &[hidden, local])?,
            optional(weights, bias, &format!("{prefix}.mlp.proj.bias"), hidden)?,
            comm,
        )
        .map_err(config_from)?;

        Ok(Self {
            index,
            input_layernorm,
            attention,
            post_layernorm,
            mlp,
            residual: Residual::new(config.strategy.residual.residual_config()),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn attention(&self) -> &AttentionBlock {
        &self.attention
    }

    pub fn residual(&self) -> &Residual {
        &self.residual
    }

    pub fn forward(
        &self,
        hidden: &Tensor,
        batch: &BatchLayout,
        positions: &RequestPositions,
        cache: Option<&LayerCacheView<'_, '_>>,
        policy: &PrecisionPolicy,
    ) -> Result<(Tensor, Option<LayerPresent>)> {
        let normed = self.input_layernorm.forward(hidden, policy)?;
        let (attended, present) = self
            .attention
            .forward(&normed, batch, positions, cache, policy)?;
        let hidden = self
            .residual
            .add(&attended, self.residual.source(hidden, &normed), policy)?;

        let normed = self.post_layernorm.forward(&hidden, policy)?;
        let transformed = self.mlp.forward(&normed, policy)?;
        let output = self
            .residual
            .add(&transformed, self.residual.source(&hidden, &normed), policy)?;
        Ok((output, present))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChatGlmConfig, ResidualStrategy};
    use crate::position::{InputLayout, PositionInput};
    use crate::weights::SyntheticWeights;
    use candle_core::{DType, Device, D};
    use layers::SingleProcess;

    /// Synthetic weights with both branch output projections zeroed, so a
    /// layer reduces to its residual wiring.
    struct SilentBranches(SyntheticWeights);

    impl WeightSource for SilentBranches {
        fn get(&self, name: &str, shape: &[usize]) -> Result<Tensor> {
            if name.ends_with("attention.dense.weight") || name.ends_with("mlp.proj.weight") {
                return Ok(Tensor::zeros(shape, DType::F32, &Device::Cpu)?);
            }
            self.0.get(name, shape)
        }
    }

    fn reference_norm(x: &Tensor, weights: &dyn WeightSource, prefix: &str, kind: NormKind) -> Result<Tensor> {
        let weight = weights.get(&format!("{prefix}.weight"), &[8])?;
        let out = match kind {
            NormKind::LayerNorm => {
                let bias = weights.get(&format!("{prefix}.bias"), &[8])?;
                let centered = x.broadcast_sub(&x.mean_keepdim(D::Minus1)?)?;
                let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
                centered
                    .broadcast_div(&(var + 1e-5)?.sqrt()?)?
                    .broadcast_mul(&weight)?
                    .broadcast_add(&bias)?
            }
            NormKind::RmsNorm => {
                let rms = (x.sqr()?.mean_keepdim(D::Minus1)? + 1e-5)?.sqrt()?;
                x.broadcast_div(&rms)?.broadcast_mul(&weight)?
            }
        };
        Ok(out)
    }

    fn run_layer(config: &ChatGlmConfig) -> Result<(Tensor, Tensor, DecoderLayer, SilentBranches)> {
        let resolved = config.normalize()?;
        let weights = SilentBranches(SyntheticWeights::new(9, DType::F32, Device::Cpu));
        let layer = DecoderLayer::new(0, &resolved, &weights, Arc::new(SingleProcess))?;

        let ids = Tensor::zeros(3, DType::U32, &Device::Cpu)?;
        let batch = BatchLayout::new(&ids, InputLayout::Packed, None)?;
        let steps = Tensor::new(&[0u32, 1, 2], &Device::Cpu)?;
        let input = if resolved.position_encoding_2d() {
            PositionInput::TwoDimensional {
                position: steps.clone(),
                block: steps.zeros_like()?,
            }
        } else {
            PositionInput::OneDimensional(steps)
        };
        let positions = RequestPositions::new(&input, &ids, &batch)?;

        let x = Tensor::arange(0f32, 24.0, &Device::Cpu)?
            .reshape((3, 8))?
            .affine(0.37, -3.0)?
            .sin()?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let (out, present) = layer.forward(&x, &batch, &positions, None, &policy)?;
        assert!(present.is_none());
        Ok((x, out, layer, weights))
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        Ok(a.sub(b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
    }

    fn small(version: &str, post_layernorm: bool, rmsnorm: bool) -> ChatGlmConfig {
        ChatGlmConfig {
            chatglm_version: Some(version.to_string()),
            hidden_size: 8,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            vocab_size: 10,
            max_position_embeddings: 8,
            rmsnorm: Some(rmsnorm),
            apply_residual_connection_post_layernorm: Some(post_layernorm),
            ..ChatGlmConfig::default()
        }
    }

    #[test]
    fn scaled_residual_matches_reference() -> Result<()> {
        let (x, out, layer, weights) = run_layer(&small("chatglm", false, false))?;
        assert_eq!(
            layer.residual().config().residual_scale,
            Some(2.0),
            "alpha = sqrt(2 * num_layers)"
        );
        let kind = NormKind::LayerNorm;
        let n1 = reference_norm(&x, &weights, "transformer.layers.0.input_layernorm", kind)?;
        let h = n1.affine(2.0, 0.0)?;
        let n2 = reference_norm(&h, &weights, "transformer.layers.0.post_layernorm", kind)?;
        let expected = n2.affine(2.0, 0.0)?;
        assert!(max_diff(&out, &expected)? < 1e-4);
        Ok(())
    }

    #[test]
    fn standard_residual_follows_post_layernorm_flag() -> Result<()> {
        let (x, out, layer, _) = run_layer(&small("chatglm3", false, true))?;
        assert_eq!(layer.residual().config().residual_scale, None);
        assert!(max_diff(&out, &x)? < 1e-6);

        let (x, out, _, weights) = run_layer(&small("chatglm3", true, true))?;
        let kind = NormKind::RmsNorm;
        let n1 = reference_norm(&x, &weights, "transformer.layers.0.input_layernorm", kind)?;
        let expected = reference_norm(&n1, &weights, "transformer.layers.0.post_layernorm", kind)?;
        assert!(max_diff(&out, &expected)? < 1e-4);
        Ok(())
    }

    #[test]
    fn every_version_picks_one_residual_form() -> Result<()> {
        for (version, scaled) in [("glm", false), ("chatglm", true), ("chatglm2", false), ("chatglm3", false)] {
            let (_, _, layer, _) = run_layer(&small(version, false, false))?;
            let config = layer.residual().config();
            assert_eq!(config.residual_scale.is_some(), scaled, "{version}");
            let resolved = small(version, false, false).normalize()?;
            assert_eq!(
                matches!(resolved.strategy.residual, ResidualStrategy::Scaled { .. }),
                scaled
            );
        }
        Ok(())
    }
}
